//! Certificate authority contract
//!
//! The authority turns a domain set into a signed certificate. Issuance is
//! asynchronous on its side: a request may come back [`AuthorityError::Pending`],
//! meaning the certificate was ordered but is not ready yet and the caller
//! should simply ask again later.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::certificate::Certificate;

/// Failures of a platform or authority call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// Issuance was requested but the certificate is not ready yet
    #[error("certificate issuance pending")]
    Pending,

    /// The platform answered with an error status
    #[error("platform error (status {status}): {message}")]
    Platform {
        /// HTTP status code
        status: u16,
        /// Error message returned by the platform
        message: String,
    },

    /// The request never got a usable answer (connect, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),
}

impl AuthorityError {
    /// Whether retrying the same call later can succeed
    ///
    /// Client errors other than rate limiting will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Pending | Self::Transport(_) => true,
            Self::Platform { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Resolves domain sets into certificates
///
/// Implementations must bound each call with a short timeout so a worker
/// never blocks indefinitely.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authority: Send + Sync {
    /// Obtain a certificate covering exactly `domains`
    async fn obtain(&self, domains: &[String]) -> Result<Certificate, AuthorityError>;
}
