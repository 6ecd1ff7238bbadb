//! NetworkPolicy builder

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use keel_common::kube_utils::selector_labels;

use super::AppContext;
use crate::error::StepError;
use crate::policy::synthesize;

/// Build the NetworkPolicy for a declared access policy.
///
/// Returns `None` when the Application declares no access policy; the
/// caller removes any policy left over from an earlier spec.
pub fn network_policy(app: &AppContext<'_>) -> Result<Option<NetworkPolicy>, StepError> {
    let Some(policy) = app.spec.access_policy.as_ref() else {
        return Ok(None);
    };
    policy.validate(app.name)?;

    let synthesized = synthesize(Some(policy), &app.self_application());

    Ok(Some(NetworkPolicy {
        metadata: app.own_meta().into(),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(app.name)),
                match_expressions: None,
            },
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(synthesized.ingress),
            egress: Some(synthesized.egress),
        }),
    }))
}
