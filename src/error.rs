//! Error types for certpilot
//!
//! Errors are structured with fields to aid debugging in production. Each
//! subsystem owns a narrower error enum (quota admission, authority calls)
//! that converts into [`Error`] at the manager/controller boundary.

use thiserror::Error;

use crate::authority::AuthorityError;
use crate::quota::QuotaError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for certpilot operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Quota admission rejected the request
    #[error("quota admission rejected: {0}")]
    Quota(#[from] QuotaError),

    /// Certificate authority call failed or is not ready yet
    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    /// The target secret exists but is not owned by this controller
    #[error("secret {namespace}/{name} is not managed by this controller")]
    ForeignSecret {
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
    },

    /// A managed secret carries malformed bookkeeping annotations
    #[error("invalid managed secret {namespace}/{name}: {message}")]
    InvalidSecret {
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
        /// Description of what's malformed
        message: String,
    },

    /// Resource caches did not finish their initial sync
    #[error("cache sync failed: {message}")]
    CacheSync {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "manager", "controller", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a foreign-secret error
    pub fn foreign_secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ForeignSecret {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an invalid-secret error
    pub fn invalid_secret(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidSecret {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a cache sync error
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync {
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the authority reported the certificate as not ready yet
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Authority(AuthorityError::Pending))
    }

    /// Whether the failed operation may succeed if retried later
    ///
    /// Quota rejections, foreign secrets and malformed data need an external
    /// change before a retry can help; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::Internal { .. } => true,
            Self::Authority(e) => e.is_retryable(),
            Self::Quota(_)
            | Self::ForeignSecret { .. }
            | Self::InvalidSecret { .. }
            | Self::CacheSync { .. }
            | Self::Validation { .. }
            | Self::Serialization { .. } => false,
        }
    }
}
