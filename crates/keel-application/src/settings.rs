//! Platform-wide settings the application controller is started with

use std::time::Duration;

/// Default name of the shared identity config record
pub const DEFAULT_IDENTITY_CONFIG_NAME: &str = "gcp-identity-config";

/// Default namespace of the ingress gateways
pub const DEFAULT_INGRESS_GATEWAY_NAMESPACE: &str = "istio-gateways";

/// Default prefix of the `<prefix>-<priority>` priority classes
pub const DEFAULT_PRIORITY_CLASS_PREFIX: &str = "keel";

/// Default per-step deadline
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by every reconciliation cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Namespace the shared identity config record lives in
    pub system_namespace: String,
    /// Name of the shared identity config record
    pub identity_config_name: String,
    /// Namespace whose traffic is denied access to actuator paths
    pub ingress_gateway_namespace: String,
    /// Prefix of the priority class names
    pub priority_class_prefix: String,
    /// Deadline for each resource type step
    pub step_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            system_namespace: keel_common::KEEL_SYSTEM_NAMESPACE.to_string(),
            identity_config_name: DEFAULT_IDENTITY_CONFIG_NAME.to_string(),
            ingress_gateway_namespace: DEFAULT_INGRESS_GATEWAY_NAMESPACE.to_string(),
            priority_class_prefix: DEFAULT_PRIORITY_CLASS_PREFIX.to_string(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl ControllerSettings {
    /// Priority class name for a priority hint
    pub fn priority_class(&self, priority: keel_common::crd::Priority) -> String {
        format!("{}-{}", self.priority_class_prefix, priority.as_str())
    }
}
