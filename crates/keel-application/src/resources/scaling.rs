//! HorizontalPodAutoscaler and PodDisruptionBudget builders

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use keel_common::crd::Replicas;
use keel_common::kube_utils::selector_labels;

use super::AppContext;
use crate::error::StepError;

/// Scaler lower bound when the Application declares none
pub const DEFAULT_MIN_REPLICAS: u32 = 2;

/// Scaler upper bound when the Application declares none
pub const DEFAULT_MAX_REPLICAS: u32 = 5;

/// Average CPU utilization the scaler targets
pub const CPU_TARGET_UTILIZATION: i32 = 80;

/// Effective replica bounds after defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

impl ReplicaBounds {
    /// Apply defaults and validate: `1 <= min <= max`
    pub fn resolve(replicas: Option<&Replicas>) -> Result<Self, StepError> {
        let min = replicas
            .and_then(|r| r.min)
            .unwrap_or(DEFAULT_MIN_REPLICAS);
        let max = replicas
            .and_then(|r| r.max)
            .unwrap_or(DEFAULT_MAX_REPLICAS.max(min));

        if min == 0 {
            return Err(StepError::Validation(
                "spec.replicas.min: must be at least 1".to_string(),
            ));
        }
        if max < min {
            return Err(StepError::Validation(format!(
                "spec.replicas.max: {max} is below min {min}"
            )));
        }
        if i32::try_from(max).is_err() {
            return Err(StepError::Validation(format!(
                "spec.replicas.max: {max} is out of range"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Build the autoscaler targeting the application's Deployment
pub fn horizontal_pod_autoscaler(
    app: &AppContext<'_>,
) -> Result<HorizontalPodAutoscaler, StepError> {
    let bounds = ReplicaBounds::resolve(app.spec.replicas.as_ref())?;

    Ok(HorizontalPodAutoscaler {
        metadata: app.own_meta().into(),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: app.name.to_string(),
            },
            // bounds are range-checked in resolve()
            min_replicas: Some(bounds.min as i32),
            max_replicas: bounds.max as i32,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(CPU_TARGET_UTILIZATION),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the disruption budget: half the pods must stay up when the
/// application runs more than one replica, otherwise none are protected.
pub fn pod_disruption_budget(app: &AppContext<'_>) -> Result<PodDisruptionBudget, StepError> {
    let bounds = ReplicaBounds::resolve(app.spec.replicas.as_ref())?;
    let min_available = if bounds.min > 1 {
        IntOrString::String("50%".to_string())
    } else {
        IntOrString::Int(0)
    };

    Ok(PodDisruptionBudget {
        metadata: app.own_meta().into(),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(min_available),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(app.name)),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}
