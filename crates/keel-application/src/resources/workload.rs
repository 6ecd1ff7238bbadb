//! Deployment and ServiceAccount builders

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecurityContext,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use keel_common::crd;
use keel_common::kube_utils::selector_labels;
use keel_common::{ANNOTATION_SYNC_OPTIONS, SYNC_OPTIONS_NO_PRUNE};

use super::AppContext;
use crate::error::StepError;

/// Unprivileged user and group every container runs as
pub const RUN_AS_ID: i64 = 150;

/// Writable scratch volume; the root filesystem is read-only
pub const TMP_VOLUME: &str = "tmp";

const TMP_MOUNT_PATH: &str = "/tmp";
const CONTAINER_PORT_NAME: &str = "main";
const ANNOTATION_PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";

/// Build the Deployment.
///
/// `spec.replicas` is left unset: the HorizontalPodAutoscaler owns it.
pub fn deployment(app: &AppContext<'_>) -> Result<Deployment, StepError> {
    app.spec.validate_workload(app.name)?;

    let template_annotations = BTreeMap::from([
        (
            ANNOTATION_SYNC_OPTIONS.to_string(),
            SYNC_OPTIONS_NO_PRUNE.to_string(),
        ),
        (ANNOTATION_PROMETHEUS_SCRAPE.to_string(), "true".to_string()),
    ]);

    Ok(Deployment {
        metadata: app.own_meta().into(),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(app.name)),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels(app.name)),
                    annotations: Some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec(app)),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the ServiceAccount the pods run as
pub fn service_account(app: &AppContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: app.own_meta().into(),
        ..Default::default()
    }
}

fn pod_spec(app: &AppContext<'_>) -> PodSpec {
    PodSpec {
        containers: vec![container(app)],
        service_account_name: Some(app.name.to_string()),
        priority_class_name: Some(app.settings.priority_class(app.spec.priority)),
        security_context: Some(PodSecurityContext {
            fs_group: Some(RUN_AS_ID),
            supplemental_groups: Some(vec![RUN_AS_ID]),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                localhost_profile: None,
            }),
            ..Default::default()
        }),
        volumes: Some(vec![Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn container(app: &AppContext<'_>) -> Container {
    let spec = app.spec;
    Container {
        name: app.name.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        env: (!spec.env.is_empty()).then(|| {
            spec.env
                .iter()
                .map(|var| EnvVar {
                    name: var.name.clone(),
                    value: Some(var.value.clone()),
                    value_from: None,
                })
                .collect()
        }),
        ports: Some(vec![ContainerPort {
            name: Some(CONTAINER_PORT_NAME.to_string()),
            container_port: i32::from(spec.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: spec.resources.as_ref().map(resource_requirements),
        liveness_probe: spec.liveness.as_ref().map(|p| http_probe(p, spec.port)),
        readiness_probe: spec.readiness.as_ref().map(|p| http_probe(p, spec.port)),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            run_as_user: Some(RUN_AS_ID),
            run_as_group: Some(RUN_AS_ID),
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: TMP_VOLUME.to_string(),
            mount_path: TMP_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn resource_requirements(resources: &crd::ResourceRequirements) -> ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        limits: quantities(&resources.limits),
        requests: quantities(&resources.requests),
        ..Default::default()
    }
}

fn http_probe(probe: &crd::Probe, default_port: u16) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(probe.path.clone()),
            port: IntOrString::Int(i32::from(probe.port.unwrap_or(default_port))),
            ..Default::default()
        }),
        initial_delay_seconds: Some(to_i32(probe.initial_delay)),
        timeout_seconds: Some(to_i32(probe.timeout)),
        failure_threshold: Some(to_i32(probe.failure_threshold)),
        ..Default::default()
    }
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_support::{context, minimal_spec};
    use crate::settings::ControllerSettings;

    #[test]
    fn story_minimal_application_gets_hardened_deployment() {
        let spec = minimal_spec();
        let settings = ControllerSettings::default();
        let deployment = deployment(&context(&spec, &settings)).expect("valid spec");

        assert_eq!(deployment.metadata.name.as_deref(), Some("minimal"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("ns1"));
        let spec = deployment.spec.expect("spec");
        assert!(spec.replicas.is_none());
        assert_eq!(
            spec.selector.match_labels,
            Some(BTreeMap::from([("app".to_string(), "minimal".to_string())]))
        );

        let template_meta = spec.template.metadata.expect("template metadata");
        let annotations = template_meta.annotations.expect("annotations");
        assert_eq!(annotations["argocd.argoproj.io/sync-options"], "Prune=false");
        assert_eq!(annotations["prometheus.io/scrape"], "true");

        let pod = spec.template.spec.expect("pod spec");
        assert_eq!(pod.service_account_name.as_deref(), Some("minimal"));
        assert_eq!(pod.priority_class_name.as_deref(), Some("keel-medium"));
        let pod_sc = pod.security_context.expect("pod security context");
        assert_eq!(pod_sc.fs_group, Some(150));
        assert_eq!(pod_sc.supplemental_groups, Some(vec![150]));
        assert_eq!(
            pod_sc.seccomp_profile.map(|p| p.type_),
            Some("RuntimeDefault".to_string())
        );

        let volumes = pod.volumes.expect("volumes");
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "tmp");
        assert!(volumes[0].empty_dir.is_some());

        assert_eq!(pod.containers.len(), 1);
        let c = &pod.containers[0];
        assert_eq!(c.name, "minimal");
        assert_eq!(c.image.as_deref(), Some("image"));
        assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        let port = &c.ports.as_ref().expect("ports")[0];
        assert_eq!(port.name.as_deref(), Some("main"));
        assert_eq!(port.container_port, 8080);
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        let mount = &c.volume_mounts.as_ref().expect("mounts")[0];
        assert_eq!(mount.mount_path, "/tmp");
        let sc = c.security_context.as_ref().expect("container security context");
        assert_eq!(sc.privileged, Some(false));
        assert_eq!(sc.run_as_user, Some(150));
        assert_eq!(sc.run_as_group, Some(150));
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert!(c.command.is_none());
        assert!(c.env.is_none());
        assert!(c.resources.is_none());
    }

    #[test]
    fn story_optional_container_settings_flow_through() {
        let spec: crd::ApplicationSpec = serde_json::from_value(serde_json::json!({
            "image": "image",
            "port": 8080,
            "command": ["/app", "--serve"],
            "env": [{"name": "MODE", "value": "prod"}],
            "resources": {"limits": {"memory": "256Mi"}, "requests": {"cpu": "100m"}},
            "priority": "low",
            "liveness": {"path": "/health", "initialDelay": 5},
            "readiness": {"path": "/ready", "port": 9090}
        }))
        .expect("spec");
        let settings = ControllerSettings::default();
        let deployment = deployment(&context(&spec, &settings)).expect("valid spec");
        let pod = deployment.spec.and_then(|s| s.template.spec).expect("pod");
        let c = &pod.containers[0];

        assert_eq!(pod.priority_class_name.as_deref(), Some("keel-low"));
        assert_eq!(
            c.command,
            Some(vec!["/app".to_string(), "--serve".to_string()])
        );
        assert_eq!(c.env.as_ref().expect("env")[0].value.as_deref(), Some("prod"));
        let resources = c.resources.as_ref().expect("resources");
        assert_eq!(
            resources.limits.as_ref().expect("limits")["memory"],
            Quantity("256Mi".to_string())
        );

        let liveness = c.liveness_probe.as_ref().expect("liveness");
        let get = liveness.http_get.as_ref().expect("http get");
        assert_eq!(get.port, IntOrString::Int(8080));
        assert_eq!(liveness.initial_delay_seconds, Some(5));
        assert_eq!(liveness.failure_threshold, Some(3));

        let readiness = c.readiness_probe.as_ref().expect("readiness");
        assert_eq!(
            readiness.http_get.as_ref().expect("http get").port,
            IntOrString::Int(9090)
        );
    }

    #[test]
    fn story_empty_image_fails_validation() {
        let mut spec = minimal_spec();
        spec.image = String::new();
        let settings = ControllerSettings::default();
        let err = deployment(&context(&spec, &settings)).unwrap_err();
        assert!(matches!(err, StepError::Validation(_)));
    }

    #[test]
    fn service_account_is_named_after_application() {
        let spec = minimal_spec();
        let settings = ControllerSettings::default();
        let sa = service_account(&context(&spec, &settings));
        assert_eq!(sa.metadata.name.as_deref(), Some("minimal"));
        assert_eq!(
            sa.metadata.labels.expect("labels")["app.kubernetes.io/managed-by"],
            "keel"
        );
    }
}
