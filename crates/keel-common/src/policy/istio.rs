//! Istio security types
//!
//! - PeerAuthentication: mTLS mode for an application's pods
//! - AuthorizationPolicy: L7 allow/deny rules enforced by the sidecar

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{selector_labels, HasApiResource, ObjectMeta};

/// mTLS mode that rejects plaintext traffic
pub const MTLS_STRICT: &str = "STRICT";

/// Authorization action that rejects matching requests
pub const ACTION_DENY: &str = "DENY";

/// Istio AuthorizationPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    /// API version
    #[serde(default = "AuthorizationPolicy::api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "AuthorizationPolicy::kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: AuthorizationPolicySpec,
}

impl HasApiResource for AuthorizationPolicy {
    const API_VERSION: &'static str = "security.istio.io/v1";
    const KIND: &'static str = "AuthorizationPolicy";
}

impl AuthorizationPolicy {
    fn api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new AuthorizationPolicy
    pub fn new(metadata: ObjectMeta, spec: AuthorizationPolicySpec) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec,
        }
    }

    /// Create a DENY policy for the application's pods rejecting requests
    /// that originate in `from_namespaces` and target `paths`.
    pub fn deny_paths_from_namespaces(
        metadata: ObjectMeta,
        application: &str,
        from_namespaces: Vec<String>,
        paths: Vec<String>,
    ) -> Self {
        Self::new(
            metadata,
            AuthorizationPolicySpec {
                selector: Some(WorkloadSelector::for_application(application)),
                action: ACTION_DENY.to_string(),
                rules: vec![AuthorizationRule {
                    from: vec![AuthorizationSource {
                        source: SourceSpec {
                            namespaces: from_namespaces,
                            ..Default::default()
                        },
                    }],
                    to: vec![AuthorizationOperation {
                        operation: OperationSpec {
                            paths,
                            ..Default::default()
                        },
                    }],
                }],
            },
        )
    }
}

/// AuthorizationPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    /// Selector for the workloads this policy applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<WorkloadSelector>,

    /// Action: ALLOW, DENY, AUDIT, CUSTOM (empty = implicit deny-all)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    /// Rules the action applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AuthorizationRule>,
}

/// Workload selector shared by Istio security resources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Match labels
    pub match_labels: BTreeMap<String, String>,
}

impl WorkloadSelector {
    /// Select the pods of an application
    pub fn for_application(application: &str) -> Self {
        Self {
            match_labels: selector_labels(application),
        }
    }
}

/// Authorization rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationRule {
    /// Source conditions (who is calling)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<AuthorizationSource>,
    /// Destination conditions (what operation)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<AuthorizationOperation>,
}

/// Authorization source (caller identity)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationSource {
    /// Source specification
    pub source: SourceSpec,
}

/// Source specification
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceSpec {
    /// SPIFFE principals
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    /// Source namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Authorization operation (what's being accessed)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationOperation {
    /// Operation specification
    pub operation: OperationSpec,
}

/// Operation specification
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationSpec {
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Hosts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Request paths (prefix match with trailing `*`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

/// Istio PeerAuthentication for mTLS configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerAuthentication {
    /// API version
    #[serde(default = "PeerAuthentication::api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "PeerAuthentication::kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: PeerAuthenticationSpec,
}

impl HasApiResource for PeerAuthentication {
    const API_VERSION: &'static str = "security.istio.io/v1";
    const KIND: &'static str = "PeerAuthentication";
}

impl PeerAuthentication {
    fn api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new PeerAuthentication
    pub fn new(metadata: ObjectMeta, spec: PeerAuthenticationSpec) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec,
        }
    }

    /// Require STRICT mTLS for every port of the application's pods
    pub fn strict_for_application(metadata: ObjectMeta, application: &str) -> Self {
        Self::new(
            metadata,
            PeerAuthenticationSpec {
                selector: Some(WorkloadSelector::for_application(application)),
                mtls: MtlsConfig {
                    mode: MTLS_STRICT.to_string(),
                },
            },
        )
    }
}

/// PeerAuthentication spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerAuthenticationSpec {
    /// Workloads this mode applies to (namespace-wide when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<WorkloadSelector>,
    /// mTLS configuration
    pub mtls: MtlsConfig,
}

/// mTLS configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MtlsConfig {
    /// mTLS mode: STRICT, PERMISSIVE, DISABLE
    pub mode: String,
}
