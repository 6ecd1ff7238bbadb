//! Object store seam
//!
//! The apply engine and orchestrator reach the cluster only through these
//! traits: [`ObjectStore`] for child resources, [`StatusWriter`] for the
//! Application status, and [`SharedConfigLookup`] for read-only platform
//! records. [`KubeStore`] implements all three against the API server;
//! [`MemoryStore`] implements them in memory for tests and dry runs.

mod kube;
mod memory;

pub use self::kube::KubeStore;
pub use self::memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use ::kube::discovery::ApiResource;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use keel_common::crd::ApplicationStatus;

/// Identity of a namespaced object in the store
#[derive(Clone, Debug)]
pub struct ObjectKey {
    pub resource: ApiResource,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: ApiResource, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.resource.kind, self.namespace, self.name)
    }
}

/// Store failures, classified by how the caller should react
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Concurrent modification or already exists; retryable
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Rejected by the store; retrying the same write cannot succeed
    #[error("{kind} {name} rejected: {message}")]
    Invalid {
        kind: String,
        name: String,
        message: String,
    },

    /// Store unreachable or failing; retryable
    #[error("object store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable { .. })
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Namespaced object access used by the apply engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when absent
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError>;

    /// Create an object that does not exist yet, under the same field
    /// manager later patches use
    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError>;

    /// Apply `object` as this controller's field manager. Fields the previous
    /// apply set and `object` omits are removed; other managers' fields stay.
    async fn patch(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// List objects of a type in a namespace matching an equality label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, StoreError>;
}

/// Writes the Application status sub-resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Merge `status` into the Application's status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationStatus,
    ) -> Result<(), StoreError>;
}

/// Read-only access to shared platform configuration records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SharedConfigLookup: Send + Sync {
    /// Data of a ConfigMap, `None` when the record does not exist
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;
}

/// Parse an equality-based label selector (`k=v,k2=v2`)
pub(crate) fn parse_label_selector(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
