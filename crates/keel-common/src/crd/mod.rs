//! Custom Resource Definitions for Keel

mod application;
mod types;

pub use application::{
    AccessPolicy, Application, ApplicationSpec, ApplicationStatus, ControllerStatus, EnvVar,
    ExternalPort, ExternalRule, GcpAuth, GcpSpec, InboundPolicy, InternalRule, OutboundPolicy,
    Priority, Probe, Replicas, ResourceRequirements, SyncPhase,
};
pub use types::{Condition, ConditionStatus};
