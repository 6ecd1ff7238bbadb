//! Events on Applications, shown by `kubectl describe application`.
//!
//! Publishing never fails a reconcile; a rejected Event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Application Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason`/`action` against `resource_ref`, with an optional note
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the API server's events endpoint
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the Event's reporting component; the pod
    /// name from `POD_NAME`, when set, its reporting instance
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "dropping application event");
        }
    }
}

/// Discards every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// Every child resource converged
    pub const APPLICATION_SYNCED: &str = "ApplicationSynced";
    /// A child resource could not be applied
    pub const RESOURCE_APPLY_FAILED: &str = "ResourceApplyFailed";
    /// Spec validation failed for a child resource
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// The shared workload identity record is missing
    pub const IDENTITY_CONFIG_MISSING: &str = "IdentityConfigMissing";
}

/// Event actions
pub mod actions {
    /// A full reconcile cycle
    pub const RECONCILE: &str = "Reconcile";
    /// Applying a child resource
    pub const APPLY: &str = "Apply";
}
