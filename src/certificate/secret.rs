//! Managed Secret layout and persistence
//!
//! A managed secret is a `kubernetes.io/tls` Secret labelled with
//! `app.kubernetes.io/managed-by=<controller-name>`. Its annotations record the
//! domain list and validity window so renewals and no-op detection never need
//! to parse the certificate itself. Secrets without the label are foreign and
//! are never written or deleted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::{sanitize_domains, Certificate, CertificateRequest};
use crate::{
    Error, ANNOTATION_CERTIFICATE_DOMAINS, ANNOTATION_CERTIFICATE_NOT_AFTER,
    ANNOTATION_CERTIFICATE_NOT_BEFORE, LABEL_MANAGED_BY, SECRET_TYPE_TLS, TLS_CERT_KEY,
    TLS_PRIVATE_KEY_KEY,
};

/// Trait abstracting Secret persistence
///
/// The manager writes and lists through this trait; the controller deletes
/// through it. Mocked in tests, backed by the Kubernetes API in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Fetch a secret, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create or update a secret with server-side apply
    async fn apply(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a secret; a missing secret is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List every secret carrying this controller's ownership label
    async fn list_managed(&self) -> Result<Vec<Secret>, Error>;
}

/// Real Kubernetes implementation of [`SecretClient`]
pub struct KubeSecretClient {
    client: Client,
    controller_name: String,
}

impl KubeSecretClient {
    /// Create a new KubeSecretClient; `controller_name` is the SSA field manager and label value
    pub fn new(client: Client, controller_name: impl Into<String>) -> Self {
        Self {
            client,
            controller_name: controller_name.into(),
        }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| {
                Error::internal_with_context("apply_secret", "secret has no namespace")
            })?;
        let name = secret.name_any();

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(&self.controller_name).force();
        api.patch(&name, &params, &Patch::Apply(secret)).await?;

        debug!(namespace = %namespace, secret = %name, "Applied managed secret");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed(&self) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let selector = format!("{}={}", LABEL_MANAGED_BY, self.controller_name);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }
}

/// Returns true if the object carries this controller's ownership label
pub fn is_managed(meta: &ObjectMeta, controller_name: &str) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(LABEL_MANAGED_BY))
        .map(|v| v == controller_name)
        .unwrap_or(false)
}

/// Comma-joined domain list as stored in the domains annotation
pub fn domains_annotation_value(domains: &[String]) -> String {
    domains.join(",")
}

/// Build the Secret persisted for an issued certificate
pub fn build_managed_secret(
    request: &CertificateRequest,
    certificate: &Certificate,
    controller_name: &str,
) -> Secret {
    let labels = BTreeMap::from([(LABEL_MANAGED_BY.to_string(), controller_name.to_string())]);
    let annotations = BTreeMap::from([
        (
            ANNOTATION_CERTIFICATE_DOMAINS.to_string(),
            domains_annotation_value(request.domains()),
        ),
        (
            ANNOTATION_CERTIFICATE_NOT_BEFORE.to_string(),
            certificate.not_before.timestamp().to_string(),
        ),
        (
            ANNOTATION_CERTIFICATE_NOT_AFTER.to_string(),
            certificate.not_after.timestamp().to_string(),
        ),
    ]);
    let data = BTreeMap::from([
        (
            TLS_CERT_KEY.to_string(),
            ByteString(certificate.certificate.clone()),
        ),
        (
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(certificate.private_key.clone()),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(request.secret_name().to_string()),
            namespace: Some(request.namespace().to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_TLS.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Bookkeeping parsed back out of a managed secret's annotations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedSecret {
    /// Namespace of the secret
    pub namespace: String,
    /// Name of the secret
    pub name: String,
    /// Sanitized domain list
    pub domains: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl ManagedSecret {
    /// Parse the bookkeeping annotations of a managed secret
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let annotations = secret.annotations();

        let invalid = |msg: String| Error::invalid_secret(&namespace, &name, msg);

        let domains = annotations
            .get(ANNOTATION_CERTIFICATE_DOMAINS)
            .map(|v| parse_domains(v))
            .ok_or_else(|| invalid(format!("missing {ANNOTATION_CERTIFICATE_DOMAINS}")))?;
        let not_before = parse_unix_annotation(annotations, ANNOTATION_CERTIFICATE_NOT_BEFORE)
            .map_err(invalid)?;
        let not_after = parse_unix_annotation(annotations, ANNOTATION_CERTIFICATE_NOT_AFTER)
            .map_err(invalid)?;

        Ok(Self {
            namespace: namespace.clone(),
            name: name.clone(),
            domains,
            not_before,
            not_after,
        })
    }

    /// Rebuild the request that produced this secret
    pub fn to_request(&self) -> CertificateRequest {
        CertificateRequest::new(&self.domains, &self.namespace, &self.name)
    }
}

/// Parse a comma-joined domain annotation into a sanitized list
pub fn parse_domains(value: &str) -> Vec<String> {
    sanitize_domains(value.split(','))
}

fn parse_unix_annotation(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Result<DateTime<Utc>, String> {
    let raw = annotations
        .get(key)
        .ok_or_else(|| format!("missing {key}"))?;
    let secs: i64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("{key}={raw:?} is not a unix timestamp: {e}"))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("{key}={raw:?} is out of range"))
}
