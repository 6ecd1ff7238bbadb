//! Child resource builders
//!
//! Pure functions from an Application spec to the desired document of one
//! child resource type. Nothing here talks to the API server; the apply
//! engine persists what these produce.

mod identity;
mod mesh;
mod network;
mod scaling;
mod service;
mod workload;

pub use identity::{gcp_auth_config, IdentityPool, GCP_AUTH_CONFIG_KEY};
pub use mesh::{deny_policy, peer_authentication, service_entries, DENIED_PATHS};
pub use network::network_policy;
pub use scaling::{
    horizontal_pod_autoscaler, pod_disruption_budget, ReplicaBounds, CPU_TARGET_UTILIZATION,
    DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS,
};
pub use service::service;
pub use workload::{deployment, service_account, RUN_AS_ID, TMP_VOLUME};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::discovery::ApiResource;

use keel_common::crd::ApplicationSpec;
use keel_common::kube_utils::{HasApiResource, ObjectMeta};
use keel_common::policy::{AuthorizationPolicy, PeerAuthentication, ServiceEntry};

use crate::policy::SelfApplication;
use crate::settings::ControllerSettings;

/// Maximum length of a Kubernetes object name (DNS label)
const MAX_NAME_LEN: usize = 63;

// =============================================================================
// Resource kinds
// =============================================================================

/// Child resource types tracked per Application, one status entry each
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ServiceAccount,
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    PodDisruptionBudget,
    PeerAuthentication,
    AuthorizationPolicy,
    NetworkPolicy,
    ServiceEntry,
    ConfigMap,
}

impl ResourceKind {
    /// Every tracked kind, in the order status entries are reported
    pub const ALL: [ResourceKind; 10] = [
        Self::ServiceAccount,
        Self::Deployment,
        Self::Service,
        Self::HorizontalPodAutoscaler,
        Self::PodDisruptionBudget,
        Self::PeerAuthentication,
        Self::AuthorizationPolicy,
        Self::NetworkPolicy,
        Self::ServiceEntry,
        Self::ConfigMap,
    ];

    /// Kubernetes kind, also the status map key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            Self::PodDisruptionBudget => "PodDisruptionBudget",
            Self::PeerAuthentication => "PeerAuthentication",
            Self::AuthorizationPolicy => "AuthorizationPolicy",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::ServiceEntry => "ServiceEntry",
            Self::ConfigMap => "ConfigMap",
        }
    }

    /// API resource used to read and write this kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::HorizontalPodAutoscaler => ApiResource::erase::<HorizontalPodAutoscaler>(&()),
            Self::PodDisruptionBudget => ApiResource::erase::<PodDisruptionBudget>(&()),
            Self::PeerAuthentication => PeerAuthentication::api_resource(),
            Self::AuthorizationPolicy => AuthorizationPolicy::api_resource(),
            Self::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
            Self::ServiceEntry => ServiceEntry::api_resource(),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Build context
// =============================================================================

/// Everything a builder needs to know about the Application being reconciled
#[derive(Clone, Copy, Debug)]
pub struct AppContext<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub spec: &'a ApplicationSpec,
    pub settings: &'a ControllerSettings,
}

impl<'a> AppContext<'a> {
    /// Metadata for a child named `name`
    pub fn meta(&self, name: impl Into<String>) -> ObjectMeta {
        ObjectMeta::for_application(name, self.namespace, self.name)
    }

    /// Metadata for the child that shares the Application's name
    pub fn own_meta(&self) -> ObjectMeta {
        self.meta(self.name)
    }

    /// Identity used by the access policy synthesizer
    pub fn self_application(&self) -> SelfApplication<'a> {
        SelfApplication {
            name: self.name,
            namespace: self.namespace,
            port: self.spec.port,
        }
    }
}

// =============================================================================
// Child names
// =============================================================================

/// Name of the deny AuthorizationPolicy
pub fn deny_policy_name(application: &str) -> String {
    format!("{application}-deny")
}

/// Name of the workload identity ConfigMap
pub fn gcp_auth_config_name(application: &str) -> String {
    format!("{application}-gcp-auth")
}

/// Name of the ServiceEntry registering `host`
pub fn service_entry_name(application: &str, host: &str) -> String {
    let mut sanitized = String::with_capacity(host.len());
    for c in host.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
        } else if !sanitized.ends_with('-') {
            sanitized.push('-');
        }
    }
    let mut name = format!("{application}-egress-{}", sanitized.trim_matches('-'));
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}
