//! certpilot - automatic TLS certificates for Kubernetes ingresses
//!
//! certpilot watches Ingress and IngressRoute resources that opt in through an
//! annotation, obtains certificates for their TLS hosts from an external
//! authority, stores them as managed `kubernetes.io/tls` Secrets and renews
//! them before they expire. Concurrent issuance is bounded by a tenant-wide
//! quota that is reported back to the platform.
//!
//! # Modules
//!
//! - [`controller`] - Watches cluster resources and turns changes into certificate demand
//! - [`manager`] - Deduplicating work queue that issues, stores and renews certificates
//! - [`quota`] - Two-phase admission control and usage reporting
//! - [`authority`] - Contract of the certificate authority
//! - [`platform`] - HTTP client for the platform API (authority + quota reporting)
//! - [`certificate`] - Certificate requests and the managed Secret layout
//! - [`crd`] - Resource types not shipped by k8s-openapi
//! - [`config`] - Command-line and environment configuration
//! - [`retry`] - Exponential backoff helpers
//! - [`telemetry`] - Tracing subscriber and OpenTelemetry export
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod authority;
pub mod certificate;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod manager;
pub mod platform;
pub mod quota;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire Constants
// =============================================================================

/// Annotation that opts an Ingress or IngressRoute into certificate management
pub const ANNOTATION_ENABLE_CERTIFICATES: &str = "certpilot.dev/enable-certificates";

/// Label key recording which controller owns a Secret
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Default controller name, used as the ownership label value
pub const DEFAULT_CONTROLLER_NAME: &str = "certpilot";

/// Annotation holding the comma-joined, sorted domain list of a managed Secret
pub const ANNOTATION_CERTIFICATE_DOMAINS: &str = "certpilot.dev/certificate-domains";

/// Annotation holding the certificate NotBefore as decimal Unix seconds
pub const ANNOTATION_CERTIFICATE_NOT_BEFORE: &str = "certpilot.dev/certificate-not-before";

/// Annotation holding the certificate NotAfter as decimal Unix seconds
pub const ANNOTATION_CERTIFICATE_NOT_AFTER: &str = "certpilot.dev/certificate-not-after";

/// Secret type for TLS key pairs
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// Secret payload key holding the PEM certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret payload key holding the PEM private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Returns true if the annotation map opts the resource in
pub fn is_opted_in(annotations: &std::collections::BTreeMap<String, String>) -> bool {
    annotations
        .get(ANNOTATION_ENABLE_CERTIFICATES)
        .map(|v| v == "true")
        .unwrap_or(false)
}
