//! HTTP client for the platform API
//!
//! The platform acts as the certificate authority and receives quota usage
//! reports. Every call carries the bearer token and is bounded by the client
//! timeout.
//!
//! - `GET {base}/certificates?domains=a.com,b.com` answers `200` with a
//!   certificate, `202` while issuance is pending, or an error status with a
//!   `{"error": "..."}` body.
//! - `POST {base}/quotas/secured-routes` with `{"inUse": n}` records usage.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::authority::{Authority, AuthorityError};
use crate::certificate::Certificate;
use crate::quota::UsageReporter;
use crate::Error;

/// Certificate as returned by the platform; binary fields are base64
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificatePayload {
    certificate: String,
    private_key: String,
    #[serde(default)]
    domains: Vec<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificatePayload {
    fn into_certificate(self) -> Result<Certificate, AuthorityError> {
        let certificate = BASE64
            .decode(self.certificate.as_bytes())
            .map_err(|e| AuthorityError::Decode(format!("certificate: {e}")))?;
        let private_key = BASE64
            .decode(self.private_key.as_bytes())
            .map_err(|e| AuthorityError::Decode(format!("privateKey: {e}")))?;

        Ok(Certificate {
            certificate,
            private_key,
            domains: self.domains,
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsagePayload {
    in_use: i64,
}

/// Authenticated client for the platform API
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PlatformClient {
    /// Create a client for `base_url` whose calls time out after `timeout`
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("platform_client", e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a non-success response to a structured platform error
async fn platform_error(response: reqwest::Response) -> AuthorityError {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return AuthorityError::Transport(e.to_string()),
    };

    let message = serde_json::from_str::<ErrorPayload>(&body)
        .map(|p| p.error)
        .unwrap_or(body);

    AuthorityError::Platform { status, message }
}

fn transport(e: reqwest::Error) -> AuthorityError {
    AuthorityError::Transport(e.to_string())
}

#[async_trait]
impl Authority for PlatformClient {
    async fn obtain(&self, domains: &[String]) -> Result<Certificate, AuthorityError> {
        let response = self
            .http
            .get(self.url("/certificates"))
            .bearer_auth(&self.token)
            .query(&[("domains", domains.join(","))])
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK => {
                let payload: CertificatePayload = response
                    .json()
                    .await
                    .map_err(|e| AuthorityError::Decode(e.to_string()))?;
                payload.into_certificate()
            }
            StatusCode::ACCEPTED => {
                debug!(domains = ?domains, "Certificate issuance pending");
                Err(AuthorityError::Pending)
            }
            _ => Err(platform_error(response).await),
        }
    }
}

#[async_trait]
impl UsageReporter for PlatformClient {
    async fn report_secured_routes_in_use(&self, in_use: i64) -> Result<(), AuthorityError> {
        let response = self
            .http
            .post(self.url("/quotas/secured-routes"))
            .bearer_auth(&self.token)
            .json(&UsagePayload { in_use })
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(platform_error(response).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_base64_fields() {
        let json = serde_json::json!({
            "certificate": BASE64.encode(b"cert-pem"),
            "privateKey": BASE64.encode(b"key-pem"),
            "domains": ["a.example.com"],
            "notBefore": "2024-01-01T00:00:00Z",
            "notAfter": "2024-03-31T00:00:00Z",
        });
        let payload: CertificatePayload = serde_json::from_value(json).unwrap();
        let cert = payload.into_certificate().unwrap();

        assert_eq!(cert.certificate, b"cert-pem");
        assert_eq!(cert.private_key, b"key-pem");
        assert_eq!(cert.domains, vec!["a.example.com"]);
        assert_eq!(cert.not_after.timestamp(), 1_711_843_200);
    }

    #[test]
    fn payload_with_bad_base64_is_a_decode_error() {
        let payload = CertificatePayload {
            certificate: "not base64!".to_string(),
            private_key: BASE64.encode(b"key"),
            domains: vec![],
            not_before: Utc::now(),
            not_after: Utc::now(),
        };
        assert!(matches!(
            payload.into_certificate(),
            Err(AuthorityError::Decode(_))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client =
            PlatformClient::new("https://platform.example.com/", "t", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.url("/certificates"),
            "https://platform.example.com/certificates"
        );
    }
}
