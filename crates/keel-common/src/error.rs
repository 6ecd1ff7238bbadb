//! Error types shared by Keel crates
//!
//! Errors carry the application they concern so failures read well in
//! structured logs and Kubernetes events.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for an Application spec
    #[error("validation error for {application}: {message}")]
    Validation {
        /// Name of the application with invalid configuration
        application: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.replicas.min")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "telemetry", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error without application context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            application: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with application context and field path
    pub fn validation_for_field(
        application: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            application: application.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the operation could succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::Internal { .. } => true,
            Self::Validation { .. } | Self::Serialization { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}
