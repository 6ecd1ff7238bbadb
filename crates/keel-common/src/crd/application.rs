//! Application CRD: a single containerised workload and the platform
//! resources it needs (service, scaling, mesh identity, network access)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

// =============================================================================
// CRD
// =============================================================================

/// Spec for an Application
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    namespaced,
    status = "ApplicationStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.application.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Container image reference
    pub image: String,

    /// The single port the container listens on
    pub port: u16,

    /// Horizontal scaling bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<Replicas>,

    /// Override for the container entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Plain environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Container resource limits and requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Scheduling priority hint
    #[serde(default)]
    pub priority: Priority,

    /// HTTP liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,

    /// HTTP readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,

    /// Peers and external hosts this application talks to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_policy: Option<AccessPolicy>,

    /// Google Cloud workload identity binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpSpec>,
}

/// Replica bounds; unset values fall back to platform defaults
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Replicas {
    /// Lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    /// Upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

/// Plain environment variable
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Resource quantities keyed by resource name (cpu, memory)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Hard limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    /// Scheduler requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// Scheduling priority hint, mapped onto a priority class
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Preempted first
    Low,
    /// Default
    #[default]
    Medium,
    /// Preempted last
    High,
}

impl Priority {
    /// Lowercase name used in priority class names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// HTTP GET probe against the application port (or an explicit one)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Request path
    pub path: String,
    /// Port to probe, defaults to the application port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Seconds to wait before the first probe
    #[serde(default)]
    pub initial_delay: u32,
    /// Seconds before a probe attempt times out
    #[serde(default = "default_probe_timeout")]
    pub timeout: u32,
    /// Consecutive failures before the probe fails
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_timeout() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

// =============================================================================
// Access policy
// =============================================================================

/// Declared network access for an application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    /// Peers allowed to reach this application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundPolicy>,
    /// Peers and external hosts this application may reach
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<OutboundPolicy>,
}

/// Inbound rules
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InboundPolicy {
    /// Peers allowed to call this application, in declaration order
    #[serde(default)]
    pub rules: Vec<InternalRule>,
}

/// Outbound rules
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OutboundPolicy {
    /// In-cluster peers this application may call
    #[serde(default)]
    pub rules: Vec<InternalRule>,
    /// Hosts outside the cluster this application may call
    #[serde(default)]
    pub external: Vec<ExternalRule>,
}

/// An in-cluster peer application
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct InternalRule {
    /// Peer namespace; empty means the declaring application's namespace
    #[serde(default)]
    pub namespace: String,
    /// Peer application name
    pub application: String,
}

impl InternalRule {
    /// Resolve namespace using the declaring application's namespace
    pub fn resolve_namespace<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            default_namespace
        } else {
            &self.namespace
        }
    }
}

/// A host outside the cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExternalRule {
    /// DNS name
    pub host: String,
    /// Ports; when empty the platform registers HTTPS on 443
    #[serde(default)]
    pub ports: Vec<ExternalPort>,
}

/// Port on an external host
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExternalPort {
    /// Port name
    pub name: String,
    /// Port number
    pub port: u16,
    /// Protocol (HTTP, HTTPS, TCP, GRPC)
    pub protocol: String,
}

// =============================================================================
// Cloud identity
// =============================================================================

/// Google Cloud settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GcpSpec {
    /// Workload identity federation
    pub auth: GcpAuth,
}

/// Google service account the application impersonates
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuth {
    /// Service account email
    pub service_account: String,
}

// =============================================================================
// Status
// =============================================================================

/// Outcome of one controller (resource type) or of the whole application
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// A reconciliation cycle is in flight
    Progressing,
    /// Last cycle converged this resource type
    Synced,
    /// Last cycle failed for this resource type
    Error,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Synced => write!(f, "Synced"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Status entry for one controller
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ControllerStatus {
    /// Phase
    pub status: SyncPhase,
    /// Human-readable detail
    #[serde(default)]
    pub message: String,
    /// When this entry last changed
    pub timestamp: DateTime<Utc>,
}

impl ControllerStatus {
    /// New entry stamped with the current time
    pub fn new(status: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Same phase and message, ignoring the timestamp
    pub fn same_state(&self, other: &ControllerStatus) -> bool {
        self.status == other.status && self.message == other.message
    }
}

/// Status of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Last generation a cycle started for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Summary across every controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ControllerStatus>,
    /// Per resource type outcome, keyed by kind (e.g. "PodDisruptionBudget")
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerStatus>,
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Helpers
// =============================================================================

impl ApplicationSpec {
    /// Validate the fields the workload and its service are built from
    pub fn validate_workload(&self, application: &str) -> Result<(), Error> {
        if self.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                application,
                "spec.image",
                "image must not be empty",
            ));
        }
        if self.port == 0 {
            return Err(Error::validation_for_field(
                application,
                "spec.port",
                "port must be between 1 and 65535",
            ));
        }
        for (i, var) in self.env.iter().enumerate() {
            if var.name.is_empty() {
                return Err(Error::validation_for_field(
                    application,
                    format!("spec.env[{i}].name"),
                    "environment variable name must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl AccessPolicy {
    /// Reject rules without a peer name or host
    pub fn validate(&self, application: &str) -> Result<(), Error> {
        let inbound = self.inbound.iter().flat_map(|i| i.rules.iter());
        for (i, rule) in inbound.enumerate() {
            if rule.application.is_empty() {
                return Err(Error::validation_for_field(
                    application,
                    format!("spec.accessPolicy.inbound.rules[{i}].application"),
                    "rule must name an application",
                ));
            }
        }
        if let Some(outbound) = &self.outbound {
            for (i, rule) in outbound.rules.iter().enumerate() {
                if rule.application.is_empty() {
                    return Err(Error::validation_for_field(
                        application,
                        format!("spec.accessPolicy.outbound.rules[{i}].application"),
                        "rule must name an application",
                    ));
                }
            }
            for (i, rule) in outbound.external.iter().enumerate() {
                if rule.host.trim().is_empty() {
                    return Err(Error::validation_for_field(
                        application,
                        format!("spec.accessPolicy.outbound.external[{i}].host"),
                        "external rule must name a host",
                    ));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn minimal_spec() -> ApplicationSpec {
        serde_json::from_value(serde_json::json!({"image": "image", "port": 8080}))
            .expect("minimal spec deserializes")
    }

    #[test]
    fn minimal_spec_uses_defaults() {
        let spec = minimal_spec();
        assert_eq!(spec.priority, Priority::Medium);
        assert!(spec.replicas.is_none());
        assert!(spec.access_policy.is_none());
        assert!(spec.validate_workload("minimal").is_ok());
    }

    #[test]
    fn deserializes_full_access_policy() {
        let spec: ApplicationSpec = serde_json::from_value(serde_json::json!({
            "image": "image",
            "port": 8080,
            "replicas": {"min": 3, "max": 6},
            "priority": "high",
            "accessPolicy": {
                "inbound": {"rules": [{"namespace": "other", "application": "caller"}]},
                "outbound": {
                    "rules": [{"application": "backend"}],
                    "external": [
                        {"host": "example.com", "ports": [{"name": "http", "port": 80, "protocol": "HTTP"}]},
                        {"host": "foo.com"}
                    ]
                }
            },
            "gcp": {"auth": {"serviceAccount": "app@project.iam.gserviceaccount.com"}}
        }))
        .expect("full spec deserializes");

        assert_eq!(spec.priority.as_str(), "high");
        assert_eq!(spec.replicas.and_then(|r| r.min), Some(3));
        let policy = spec.access_policy.as_ref().expect("access policy");
        let inbound = policy.inbound.as_ref().expect("inbound");
        assert_eq!(inbound.rules[0].namespace, "other");
        let outbound = policy.outbound.as_ref().expect("outbound");
        assert_eq!(outbound.rules[0].resolve_namespace("ns1"), "ns1");
        assert_eq!(outbound.external.len(), 2);
        assert!(outbound.external[1].ports.is_empty());
        assert_eq!(
            spec.gcp.map(|g| g.auth.service_account),
            Some("app@project.iam.gserviceaccount.com".to_string())
        );
    }

    #[test]
    fn probe_defaults() {
        let probe: Probe = serde_json::from_value(serde_json::json!({"path": "/health"}))
            .expect("probe deserializes");
        assert_eq!(probe.timeout, 1);
        assert_eq!(probe.failure_threshold, 3);
        assert_eq!(probe.initial_delay, 0);
        assert!(probe.port.is_none());
    }

    #[test]
    fn workload_validation_rejects_empty_image_and_zero_port() {
        let mut spec = minimal_spec();
        spec.image = " ".to_string();
        assert!(spec.validate_workload("minimal").is_err());

        let mut spec = minimal_spec();
        spec.port = 0;
        let err = spec.validate_workload("minimal").unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn access_policy_validation_rejects_unnamed_peers() {
        let policy = AccessPolicy {
            inbound: Some(InboundPolicy {
                rules: vec![InternalRule {
                    namespace: String::new(),
                    application: String::new(),
                }],
            }),
            outbound: None,
        };
        assert!(policy.validate("minimal").is_err());

        let policy = AccessPolicy {
            inbound: None,
            outbound: Some(OutboundPolicy {
                rules: vec![],
                external: vec![ExternalRule {
                    host: String::new(),
                    ports: vec![],
                }],
            }),
        };
        assert!(policy.validate("minimal").is_err());
        assert!(AccessPolicy::default().validate("minimal").is_ok());
    }

    #[test]
    fn status_serializes_per_controller_map() {
        let mut status = ApplicationStatus::default();
        status.controllers.insert(
            "PodDisruptionBudget".to_string(),
            ControllerStatus::new(SyncPhase::Synced, "synced"),
        );
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["controllers"]["PodDisruptionBudget"]["status"], "Synced");
        assert!(json.get("observedGeneration").is_none());
    }

    #[test]
    fn crd_is_namespaced_with_status_subresource() {
        let crd = Application::crd();
        assert_eq!(crd.spec.group, "keel.dev");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "Application");
        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
        let yaml = serde_yaml::to_string(&crd).expect("crd serializes to yaml");
        assert!(yaml.contains("applications.keel.dev"));
    }
}
