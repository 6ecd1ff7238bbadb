//! Istio resource builders: mTLS, actuator deny policy, external hosts

use keel_common::policy::{
    AuthorizationPolicy, PeerAuthentication, ServiceEntry, ServiceEntryPort, ServiceEntrySpec,
    LOCATION_MESH_EXTERNAL, RESOLUTION_DNS,
};

use super::{deny_policy_name, service_entry_name, AppContext};
use crate::error::StepError;
use crate::policy::{collapse_external, synthesize};

/// Paths the ingress gateways may never reach
pub const DENIED_PATHS: &[&str] = &["/actuator*"];

/// STRICT mTLS for the application's pods
pub fn peer_authentication(app: &AppContext<'_>) -> PeerAuthentication {
    PeerAuthentication::strict_for_application(app.own_meta(), app.name)
}

/// Deny requests from the ingress gateways to management paths
pub fn deny_policy(app: &AppContext<'_>) -> AuthorizationPolicy {
    AuthorizationPolicy::deny_paths_from_namespaces(
        app.meta(deny_policy_name(app.name)),
        app.name,
        vec![app.settings.ingress_gateway_namespace.clone()],
        DENIED_PATHS.iter().map(|p| p.to_string()).collect(),
    )
}

/// One ServiceEntry per distinct external host, in declaration order
pub fn service_entries(app: &AppContext<'_>) -> Result<Vec<ServiceEntry>, StepError> {
    if let Some(policy) = &app.spec.access_policy {
        policy.validate(app.name)?;
    }
    let synthesized = synthesize(app.spec.access_policy.as_ref(), &app.self_application());

    Ok(collapse_external(synthesized.external)
        .into_iter()
        .map(|registration| {
            ServiceEntry::new(
                app.meta(service_entry_name(app.name, &registration.host)),
                ServiceEntrySpec {
                    ports: registration
                        .ports
                        .iter()
                        .map(|p| ServiceEntryPort {
                            number: p.port,
                            name: p.name.clone(),
                            protocol: p.protocol.clone(),
                        })
                        .collect(),
                    hosts: vec![registration.host],
                    export_to: vec![".".to_string()],
                    location: LOCATION_MESH_EXTERNAL.to_string(),
                    resolution: RESOLUTION_DNS.to_string(),
                },
            )
        })
        .collect())
}
