//! Certificate requests and issued certificates
//!
//! A [`CertificateRequest`] is the unit of demand flowing from the controller
//! to the manager. Its domain list is always sanitized so that two requests
//! for the same hosts compare equal regardless of case, order or duplicates.

mod secret;

pub use secret::{
    build_managed_secret, domains_annotation_value, is_managed, parse_domains, KubeSecretClient,
    ManagedSecret, SecretClient,
};

#[cfg(test)]
pub use secret::MockSecretClient;

use chrono::{DateTime, Utc};

/// Lowercase, deduplicate and sort a list of hostnames.
///
/// Empty entries are dropped. The result is the canonical comparison key for
/// certificate content.
pub fn sanitize_domains<I, S>(domains: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = domains
        .into_iter()
        .map(|d| d.as_ref().trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// A request for a certificate covering `domains`, stored in `namespace/secret_name`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    domains: Vec<String>,
    namespace: String,
    secret_name: String,
}

impl CertificateRequest {
    /// Create a request; the domain list is sanitized on construction
    pub fn new<I, S>(
        domains: I,
        namespace: impl Into<String>,
        secret_name: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: sanitize_domains(domains),
            namespace: namespace.into(),
            secret_name: secret_name.into(),
        }
    }

    /// Sanitized domain list
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Namespace of the target secret
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the target secret
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    /// Identity key `secret@namespace`
    pub fn key(&self) -> String {
        secret_key(&self.namespace, &self.secret_name)
    }
}

/// Identity key of a secret, `name@namespace`
pub fn secret_key(namespace: &str, name: &str) -> String {
    format!("{name}@{namespace}")
}

/// A signed certificate returned by the authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// PEM encoded certificate chain
    pub certificate: Vec<u8>,
    /// PEM encoded private key
    pub private_key: Vec<u8>,
    /// Domains covered by the certificate
    pub domains: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}
