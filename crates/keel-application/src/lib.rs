//! Application controller
//!
//! Converges a `keel.dev/v1alpha1` Application into its child resources:
//! - Deployment, ServiceAccount, Service
//! - HorizontalPodAutoscaler and PodDisruptionBudget
//! - Istio PeerAuthentication, deny AuthorizationPolicy and ServiceEntries
//! - NetworkPolicy synthesized from the access policy
//! - the workload identity federation ConfigMap
//!
//! Each resource type is applied independently and reports its own outcome
//! into the Application status.

pub mod apply;
pub mod controller;
pub mod error;
pub mod policy;
pub mod resources;
pub mod settings;
pub mod status;
pub mod store;

pub use controller::{error_policy, reconcile, Context};
pub use error::{ReconcileError, StepError};
pub use settings::ControllerSettings;

/// Server-side apply field manager for every write this controller makes
pub const FIELD_MANAGER: &str = "keel-application-controller";
