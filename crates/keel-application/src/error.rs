//! Application controller error types

use std::time::Duration;

use crate::resources::ResourceKind;
use crate::store::StoreError;

/// Failure of a single resource type step. Never aborts sibling steps.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The Application spec cannot produce this resource
    #[error("validation failed: {0}")]
    Validation(String),

    /// Ownership could not be established or belongs to someone else
    #[error("owner reference: {0}")]
    OwnerReference(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} step timed out after {}s", .after.as_secs())]
    Timeout { kind: ResourceKind, after: Duration },
}

impl StepError {
    /// Whether retrying without a spec change could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Timeout { .. } => true,
            Self::Validation(_) | Self::OwnerReference(_) | Self::Serialization(_) => false,
        }
    }

    /// Event reason matching this failure
    pub fn event_reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => keel_common::events::reasons::VALIDATION_FAILED,
            _ => keel_common::events::reasons::RESOURCE_APPLY_FAILED,
        }
    }
}

impl From<keel_common::Error> for StepError {
    fn from(e: keel_common::Error) -> Self {
        match e {
            keel_common::Error::Validation { message, field, .. } => match field {
                Some(field) => Self::Validation(format!("{field}: {message}")),
                None => Self::Validation(message),
            },
            other => Self::Store(StoreError::Unavailable {
                message: other.to_string(),
            }),
        }
    }
}

/// A resource type that ended a cycle in error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub kind: ResourceKind,
    pub message: String,
    pub retryable: bool,
}

/// Error returned from a reconciliation cycle
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("missing namespace on Application")]
    MissingNamespace,

    #[error("{} resource type(s) failed: {}", .failed.len(), summarize(.failed))]
    StepsFailed { failed: Vec<FailedStep> },
}

fn summarize(failed: &[FailedStep]) -> String {
    failed
        .iter()
        .map(|f| format!("{}: {}", f.kind, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileError {
    /// Whether the cycle should be retried on a timer rather than waiting
    /// for the next spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingNamespace => false,
            Self::StepsFailed { failed } => failed.iter().any(|f| f.retryable),
        }
    }
}
