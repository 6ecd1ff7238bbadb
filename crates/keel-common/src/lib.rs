//! Common types for Keel: the Application CRD, mesh resource types, errors,
//! events, and logging setup

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod policy;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Keel system resources (operator, shared identity config)
pub const KEEL_SYSTEM_NAMESPACE: &str = "keel-system";

/// Selector label carried by every child resource and the pods it targets
pub const LABEL_APP: &str = "app";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label for Keel-owned resources
pub const LABEL_MANAGED_BY_KEEL: &str = "keel";

/// Namespace label set by Kubernetes on every namespace
pub const LABEL_NAMESPACE_NAME: &str = "kubernetes.io/metadata.name";

/// Argo CD sync-options annotation key
pub const ANNOTATION_SYNC_OPTIONS: &str = "argocd.argoproj.io/sync-options";

/// Argo CD must never prune controller-created children
pub const SYNC_OPTIONS_NO_PRUNE: &str = "Prune=false";

/// Hash of the document last applied to a child resource
pub const ANNOTATION_LAST_APPLIED: &str = "keel.dev/last-applied";
