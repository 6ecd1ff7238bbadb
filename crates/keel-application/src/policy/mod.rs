//! Access policy synthesis
//!
//! Translates an Application's declared access policy into NetworkPolicy
//! ingress/egress rules plus external host registrations. Only explicitly
//! declared peers produce rules; declaration order is preserved and nothing
//! is deduplicated here.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use keel_common::crd::{AccessPolicy, ExternalPort, InternalRule};
use keel_common::{LABEL_APP, LABEL_NAMESPACE_NAME};

/// Port registered for an external host that declares none
pub const DEFAULT_EXTERNAL_PORT: u16 = 443;

/// The application a policy is synthesized for
#[derive(Clone, Copy, Debug)]
pub struct SelfApplication<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub port: u16,
}

/// A host outside the cluster the application may reach
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalRegistration {
    pub host: String,
    pub ports: Vec<ExternalPort>,
}

/// Output of [`synthesize`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesizedPolicy {
    pub ingress: Vec<NetworkPolicyIngressRule>,
    pub egress: Vec<NetworkPolicyEgressRule>,
    pub external: Vec<ExternalRegistration>,
}

/// Synthesize network rules and external registrations for `app`.
///
/// - one ingress entry per inbound rule, no port restriction
/// - one egress entry per outbound internal rule, restricted to `app.port`
/// - one registration per external rule, in declaration order
pub fn synthesize(policy: Option<&AccessPolicy>, app: &SelfApplication<'_>) -> SynthesizedPolicy {
    let Some(policy) = policy else {
        return SynthesizedPolicy::default();
    };

    let ingress = policy
        .inbound
        .iter()
        .flat_map(|inbound| inbound.rules.iter())
        .map(|rule| NetworkPolicyIngressRule {
            from: Some(vec![peer(rule, app.namespace)]),
            ports: None,
        })
        .collect();

    let mut egress = Vec::new();
    let mut external = Vec::new();
    if let Some(outbound) = &policy.outbound {
        egress = outbound
            .rules
            .iter()
            .map(|rule| NetworkPolicyEgressRule {
                to: Some(vec![peer(rule, app.namespace)]),
                // peers are assumed to listen on the same port as the caller
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(i32::from(app.port))),
                    protocol: Some("TCP".to_string()),
                    end_port: None,
                }]),
            })
            .collect();

        external = outbound
            .external
            .iter()
            .map(|rule| ExternalRegistration {
                host: rule.host.clone(),
                ports: if rule.ports.is_empty() {
                    vec![default_external_port()]
                } else {
                    rule.ports.clone()
                },
            })
            .collect();
    }

    SynthesizedPolicy {
        ingress,
        egress,
        external,
    }
}

/// Collapse registrations sharing a host into one, keeping first-seen order
/// and appending ports not already registered for that host.
pub fn collapse_external(registrations: Vec<ExternalRegistration>) -> Vec<ExternalRegistration> {
    let mut collapsed: Vec<ExternalRegistration> = Vec::with_capacity(registrations.len());
    for registration in registrations {
        match collapsed.iter_mut().find(|r| r.host == registration.host) {
            Some(existing) => {
                for port in registration.ports {
                    if !existing.ports.contains(&port) {
                        existing.ports.push(port);
                    }
                }
            }
            None => collapsed.push(registration),
        }
    }
    collapsed
}

fn peer(rule: &InternalRule, own_namespace: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(match_labels(
            LABEL_NAMESPACE_NAME,
            rule.resolve_namespace(own_namespace),
        )),
        pod_selector: Some(match_labels(LABEL_APP, &rule.application)),
        ip_block: None,
    }
}

fn match_labels(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        match_expressions: None,
    }
}

fn default_external_port() -> ExternalPort {
    ExternalPort {
        name: "https".to_string(),
        port: DEFAULT_EXTERNAL_PORT,
        protocol: "HTTPS".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
