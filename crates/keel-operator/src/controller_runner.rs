use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use keel_application::resources::ResourceKind;
use keel_application::{error_policy, reconcile, Context, ControllerSettings};
use keel_common::crd::Application;

/// Server-side watch timeout in seconds; kept under the client's 30s read
/// timeout so idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Mesh kinds watched through the dynamic API
const DYNAMIC_CHILD_KINDS: [ResourceKind; 3] = [
    ResourceKind::PeerAuthentication,
    ResourceKind::AuthorizationPolicy,
    ResourceKind::ServiceEntry,
];

/// Run the Application controller until shutdown is signalled.
///
/// Changes to any owned child re-trigger its Application, so drift is
/// repaired without periodic requeues.
pub async fn run_application_controller(client: Client, settings: ControllerSettings) {
    let ctx = Arc::new(Context::from_client(client.clone(), settings));
    let wc = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    let applications: Api<Application> = Api::all(client.clone());
    let mut controller = Controller::new(applications, wc())
        .owns(Api::<ServiceAccount>::all(client.clone()), wc())
        .owns(Api::<Deployment>::all(client.clone()), wc())
        .owns(Api::<Service>::all(client.clone()), wc())
        .owns(Api::<HorizontalPodAutoscaler>::all(client.clone()), wc())
        .owns(Api::<PodDisruptionBudget>::all(client.clone()), wc())
        .owns(Api::<NetworkPolicy>::all(client.clone()), wc())
        .owns(Api::<ConfigMap>::all(client.clone()), wc());

    for kind in DYNAMIC_CHILD_KINDS {
        let resource = kind.api_resource();
        let api = Api::<DynamicObject>::all_with(client.clone(), &resource);
        controller = controller.owns_with(api, resource, wc());
    }

    tracing::info!("- Application controller");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Application"))
        .await;
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
