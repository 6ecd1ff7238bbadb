//! Service builder

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use keel_common::kube_utils::selector_labels;

use super::AppContext;
use crate::error::StepError;

const SERVICE_PORT_NAME: &str = "http";

/// Build the ClusterIP Service in front of the application's pods
pub fn service(app: &AppContext<'_>) -> Result<Service, StepError> {
    app.spec.validate_workload(app.name)?;
    let port = i32::from(app.spec.port);

    Ok(Service {
        metadata: app.own_meta().into(),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(app.name)),
            ports: Some(vec![ServicePort {
                name: Some(SERVICE_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                app_protocol: Some(SERVICE_PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}
