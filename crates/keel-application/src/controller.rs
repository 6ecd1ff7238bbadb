//! Application reconciliation
//!
//! One cycle derives every child resource type from the Application spec,
//! applies each through the [`ApplyEngine`] concurrently under its own
//! deadline and reports the outcomes into the Application status. A failing
//! step never stops its siblings; the cycle fails if any step failed.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use keel_common::crd::{Application, ApplicationStatus};
use keel_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use keel_common::kube_utils::application_selector;

use crate::apply::{ApplyEngine, ApplyOutcome};
use crate::error::{ReconcileError, StepError};
use crate::resources::{
    deny_policy, deployment, gcp_auth_config, gcp_auth_config_name, horizontal_pod_autoscaler,
    network_policy, peer_authentication, pod_disruption_budget, service, service_account,
    service_entries, AppContext, IdentityPool, ResourceKind,
};
use crate::settings::ControllerSettings;
use crate::status::{self, StatusTracker};
use crate::store::{KubeStore, ObjectStore, SharedConfigLookup, StatusWriter};
use crate::FIELD_MANAGER;

/// Requeue delay after a cycle with a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the Application controller
pub struct Context {
    /// Child resource reads and writes
    pub store: Arc<dyn ObjectStore>,
    /// Application status writes
    pub status: Arc<dyn StatusWriter>,
    /// Read-only shared platform records
    pub shared_config: Arc<dyn SharedConfigLookup>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    pub settings: ControllerSettings,
}

impl Context {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        status: Arc<dyn StatusWriter>,
        shared_config: Arc<dyn SharedConfigLookup>,
        events: Arc<dyn EventPublisher>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            status,
            shared_config,
            events,
            settings,
        }
    }

    /// Context talking to the API server through `client`
    pub fn from_client(client: Client, settings: ControllerSettings) -> Self {
        let store = Arc::new(KubeStore::new(client.clone()));
        let events = Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER));
        Self {
            store: store.clone(),
            status: store.clone(),
            shared_config: store,
            events,
            settings,
        }
    }

    /// Context backed entirely by one in-memory store
    #[cfg(test)]
    pub fn for_testing(store: Arc<crate::store::MemoryStore>) -> Self {
        Self {
            store: store.clone(),
            status: store.clone(),
            shared_config: store,
            events: Arc::new(keel_common::events::NoopEventPublisher),
            settings: ControllerSettings::default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an Application
///
/// Returns `Action::await_change()` once every resource type converged, or
/// [`ReconcileError::StepsFailed`] naming the resource types that did not.
#[instrument(skip(app, ctx), fields(application = %app.name_any()))]
pub async fn reconcile(
    app: Arc<Application>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = app.name_any();
    let namespace = app.namespace().ok_or(ReconcileError::MissingNamespace)?;
    info!("reconciling application");

    let owner = app.controller_owner_ref(&()).map(|owner| OwnerReference {
        block_owner_deletion: Some(true),
        ..owner
    });
    let object_ref = app.object_ref(&());
    let generation = app.metadata.generation;
    let current = app.status.as_ref();

    // Progressing marks only go out for a new generation so an unchanged
    // spec never produces a status write. Per-kind Progressing entries are
    // therefore skipped on resyncs; see "Status writes" in DESIGN.md.
    let progressing = if current.and_then(|s| s.observed_generation) != generation {
        let progressing = StatusTracker::start(&ResourceKind::ALL).to_status(generation, current);
        write_status(&ctx, &namespace, &name, &progressing).await;
        Some(progressing)
    } else {
        None
    };

    let app_ctx = AppContext {
        name: &name,
        namespace: &namespace,
        spec: &app.spec,
        settings: &ctx.settings,
    };
    let engine = ApplyEngine::new(ctx.store.as_ref(), owner.as_ref());
    let results = join_all(
        ResourceKind::ALL.map(|kind| run_step(kind, &app_ctx, &engine, &ctx, &object_ref)),
    )
    .await;

    let mut tracker = StatusTracker::start(&ResourceKind::ALL);
    for (kind, result) in &results {
        match result {
            Ok(outcome) => debug!(%kind, %outcome, "resource type step finished"),
            Err(e) => {
                warn!(%kind, error = %e, retryable = e.is_retryable(), "resource type step failed");
                ctx.events
                    .publish(
                        &object_ref,
                        EventType::Warning,
                        e.event_reason(),
                        actions::APPLY,
                        Some(format!("{kind}: {e}")),
                    )
                    .await;
            }
        }
        tracker.finish(*kind, result);
    }

    let stored = progressing.as_ref().or(current);
    let desired = tracker.to_status(generation, stored);
    if status::differs(&desired, stored) {
        write_status(&ctx, &namespace, &name, &desired).await;
    } else {
        debug!("status unchanged, skipping write");
    }

    let failed = tracker.failed();
    if !failed.is_empty() {
        return Err(ReconcileError::StepsFailed { failed });
    }

    if !current.is_some_and(status::is_ready) {
        ctx.events
            .publish(
                &object_ref,
                EventType::Normal,
                reasons::APPLICATION_SYNCED,
                actions::RECONCILE,
                Some("All resource types synced".to_string()),
            )
            .await;
    }
    info!("application synced");
    Ok(Action::await_change())
}

/// Error policy for the Application controller
///
/// Retryable failures requeue after [`RETRY_INTERVAL`]; anything else
/// waits for the next spec change.
pub fn error_policy(app: Arc<Application>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        application = %app.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

/// Status writes are best effort; the next cycle writes them again
async fn write_status(ctx: &Context, namespace: &str, name: &str, status: &ApplicationStatus) {
    if let Err(e) = ctx.status.patch_status(namespace, name, status).await {
        warn!(error = %e, "failed to update application status");
    }
}

// =============================================================================
// Steps
// =============================================================================

async fn run_step(
    kind: ResourceKind,
    app: &AppContext<'_>,
    engine: &ApplyEngine<'_>,
    ctx: &Context,
    object_ref: &ObjectReference,
) -> (ResourceKind, Result<ApplyOutcome, StepError>) {
    let after = ctx.settings.step_timeout;
    let result = match tokio::time::timeout(after, apply_kind(kind, app, engine, ctx, object_ref))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(StepError::Timeout { kind, after }),
    };
    (kind, result)
}

async fn apply_kind(
    kind: ResourceKind,
    app: &AppContext<'_>,
    engine: &ApplyEngine<'_>,
    ctx: &Context,
    object_ref: &ObjectReference,
) -> Result<ApplyOutcome, StepError> {
    let resource = kind.api_resource();
    match kind {
        ResourceKind::ServiceAccount => engine.apply(&resource, &service_account(app)).await,
        ResourceKind::Deployment => engine.apply(&resource, &deployment(app)?).await,
        ResourceKind::Service => engine.apply(&resource, &service(app)?).await,
        ResourceKind::HorizontalPodAutoscaler => {
            engine
                .apply(&resource, &horizontal_pod_autoscaler(app)?)
                .await
        }
        ResourceKind::PodDisruptionBudget => {
            engine.apply(&resource, &pod_disruption_budget(app)?).await
        }
        ResourceKind::PeerAuthentication => {
            engine.apply(&resource, &peer_authentication(app)).await
        }
        ResourceKind::AuthorizationPolicy => engine.apply(&resource, &deny_policy(app)).await,
        ResourceKind::NetworkPolicy => match network_policy(app)? {
            Some(policy) => engine.apply(&resource, &policy).await,
            None => engine.remove(&resource, app.namespace, app.name).await,
        },
        ResourceKind::ServiceEntry => apply_service_entries(app, engine, &resource).await,
        ResourceKind::ConfigMap => {
            apply_gcp_auth_config(app, engine, ctx, object_ref, &resource).await
        }
    }
}

/// One ServiceEntry per declared host; entries for hosts no longer
/// declared are pruned
async fn apply_service_entries(
    app: &AppContext<'_>,
    engine: &ApplyEngine<'_>,
    resource: &ApiResource,
) -> Result<ApplyOutcome, StepError> {
    let entries = service_entries(app)?;
    let mut outcome = ApplyOutcome::Absent;
    let mut keep = Vec::with_capacity(entries.len());
    for entry in &entries {
        outcome = outcome.combine(engine.apply(resource, entry).await?);
        keep.push(entry.metadata.name.clone());
    }
    let pruned = engine
        .prune(
            resource,
            app.namespace,
            &application_selector(app.name),
            &keep,
        )
        .await?;
    Ok(outcome.combine(pruned))
}

/// Workload identity config. A missing shared record is a warning, not a
/// failure, and leaves any existing config in place.
async fn apply_gcp_auth_config(
    app: &AppContext<'_>,
    engine: &ApplyEngine<'_>,
    ctx: &Context,
    object_ref: &ObjectReference,
    resource: &ApiResource,
) -> Result<ApplyOutcome, StepError> {
    let config_name = gcp_auth_config_name(app.name);
    if app.spec.gcp.is_none() {
        return engine.remove(resource, app.namespace, &config_name).await;
    }

    let settings = app.settings;
    let Some(data) = ctx
        .shared_config
        .config_map_data(&settings.system_namespace, &settings.identity_config_name)
        .await?
    else {
        warn!(
            record = %settings.identity_config_name,
            namespace = %settings.system_namespace,
            "identity config record missing, skipping workload identity config"
        );
        ctx.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::IDENTITY_CONFIG_MISSING,
                actions::APPLY,
                Some(format!(
                    "ConfigMap {}/{} not found; {config_name} not created",
                    settings.system_namespace, settings.identity_config_name
                )),
            )
            .await;
        return Ok(ApplyOutcome::Absent);
    };

    let pool = IdentityPool::from_data(&data)?;
    match gcp_auth_config(app, &pool)? {
        Some(config) => engine.apply(resource, &config).await,
        None => Ok(ApplyOutcome::Absent),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use keel_common::crd::{ApplicationSpec, GcpAuth, GcpSpec, SyncPhase};
    use serde_json::{json, Value};

    use super::*;
    use crate::store::{MemoryStore, MockSharedConfigLookup, MockStatusWriter, ObjectKey, StoreError};

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn spec(value: Value) -> ApplicationSpec {
        serde_json::from_value(value).expect("spec deserializes")
    }

    fn minimal_spec() -> ApplicationSpec {
        spec(json!({"image": "image", "port": 8080}))
    }

    fn application(spec: ApplicationSpec) -> Arc<Application> {
        let mut app = Application::new("minimal", spec);
        app.metadata.namespace = Some("ns1".to_string());
        app.metadata.uid = Some("app-uid".to_string());
        app.metadata.generation = Some(1);
        Arc::new(app)
    }

    /// Same Application as the watch would deliver it after the last cycle
    fn observed(app: &Application, store: &MemoryStore) -> Arc<Application> {
        let mut next = app.clone();
        next.status = store.status("ns1", "minimal");
        Arc::new(next)
    }

    fn identity_record() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "workloadIdentityPool".to_string(),
                "project.svc.id.goog".to_string(),
            ),
            ("identityProvider".to_string(), "provider".to_string()),
        ])
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(bool, String)>>,
    }

    impl RecordingPublisher {
        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, reason)| reason.clone())
                .collect()
        }

        fn warnings(&self) -> usize {
            self.events
                .lock()
                .expect("lock")
                .iter()
                .filter(|(warning, _)| *warning)
                .count()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.events
                .lock()
                .expect("lock")
                .push((matches!(type_, EventType::Warning), reason.to_string()));
        }
    }

    fn context_with_events(store: Arc<MemoryStore>) -> (Arc<Context>, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        let mut ctx = Context::for_testing(store);
        ctx.events = events.clone();
        (Arc::new(ctx), events)
    }

    fn exists(store: &MemoryStore, kind: ResourceKind, name: &str) -> bool {
        store.object(&kind.api_resource(), "ns1", name).is_some()
    }

    // =========================================================================
    // Stories
    // =========================================================================

    #[tokio::test]
    async fn story_minimal_application_converges() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, events) = context_with_events(store.clone());

        let action = reconcile(application(minimal_spec()), ctx)
            .await
            .expect("cycle succeeds");
        assert_eq!(action, Action::await_change());

        for (kind, name) in [
            (ResourceKind::ServiceAccount, "minimal"),
            (ResourceKind::Deployment, "minimal"),
            (ResourceKind::Service, "minimal"),
            (ResourceKind::HorizontalPodAutoscaler, "minimal"),
            (ResourceKind::PodDisruptionBudget, "minimal"),
            (ResourceKind::PeerAuthentication, "minimal"),
            (ResourceKind::AuthorizationPolicy, "minimal-deny"),
        ] {
            assert!(exists(&store, kind, name), "{kind} {name} missing");
        }
        assert!(!exists(&store, ResourceKind::NetworkPolicy, "minimal"));
        assert!(store
            .names(&ResourceKind::ServiceEntry.api_resource(), "ns1")
            .is_empty());
        assert!(!exists(&store, ResourceKind::ConfigMap, "minimal-gcp-auth"));

        let deployment = store
            .object(&ResourceKind::Deployment.api_resource(), "ns1", "minimal")
            .expect("deployment");
        assert_eq!(
            deployment["metadata"]["ownerReferences"][0]["uid"],
            "app-uid"
        );
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            "image"
        );

        let pdb = store
            .object(
                &ResourceKind::PodDisruptionBudget.api_resource(),
                "ns1",
                "minimal",
            )
            .expect("pdb");
        assert_eq!(pdb["spec"]["minAvailable"], "50%");

        let status = store.status("ns1", "minimal").expect("status written");
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.controllers.len(), 10);
        assert!(status
            .controllers
            .values()
            .all(|c| c.status == SyncPhase::Synced));
        assert!(status::is_ready(&status));
        assert_eq!(events.reasons(), vec!["ApplicationSynced"]);
    }

    #[tokio::test]
    async fn story_second_cycle_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, events) = context_with_events(store.clone());
        let app = application(minimal_spec());

        reconcile(app.clone(), ctx.clone()).await.expect("first cycle");
        let writes = store.write_count();
        let status_writes = store.status_write_count();

        reconcile(observed(&app, &store), ctx)
            .await
            .expect("second cycle");

        assert_eq!(store.write_count(), writes);
        assert_eq!(store.status_write_count(), status_writes);
        assert_eq!(events.reasons(), vec!["ApplicationSynced"]);
    }

    #[tokio::test]
    async fn story_settings_removed_from_spec_leave_the_deployment() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _events) = context_with_events(store.clone());
        let full = application(spec(json!({
            "image": "image",
            "port": 8080,
            "env": [{"name": "MODE", "value": "prod"}],
            "liveness": {"path": "/health"}
        })));
        reconcile(full.clone(), ctx.clone()).await.expect("first cycle");

        let deployment = || {
            store
                .object(&ResourceKind::Deployment.api_resource(), "ns1", "minimal")
                .expect("deployment")
        };
        let live = deployment();
        let container = &live["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["env"][0]["name"], "MODE");
        assert!(container.get("livenessProbe").is_some());

        let mut trimmed = (*observed(&full, &store)).clone();
        trimmed.spec = minimal_spec();
        trimmed.metadata.generation = Some(2);
        reconcile(Arc::new(trimmed.clone()), ctx.clone())
            .await
            .expect("second cycle");

        let live = deployment();
        let container = &live["spec"]["template"]["spec"]["containers"][0];
        assert!(container.get("env").is_none());
        assert!(container.get("livenessProbe").is_none());
        let writes = store.write_count();

        reconcile(observed(&trimmed, &store), ctx)
            .await
            .expect("third cycle");
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn story_failing_disruption_budget_does_not_block_siblings() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes_for(
            "PodDisruptionBudget",
            StoreError::Invalid {
                kind: "PodDisruptionBudget".to_string(),
                name: "minimal".to_string(),
                message: "admission webhook denied".to_string(),
            },
        );
        let (ctx, events) = context_with_events(store.clone());

        let err = reconcile(application(minimal_spec()), ctx.clone())
            .await
            .unwrap_err();
        let ReconcileError::StepsFailed { failed } = &err else {
            panic!("expected StepsFailed, got {err:?}");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ResourceKind::PodDisruptionBudget);
        assert!(!err.is_retryable());

        let status = store.status("ns1", "minimal").expect("status");
        assert_eq!(status.controllers["PodDisruptionBudget"].status, SyncPhase::Error);
        assert_eq!(status.controllers["Service"].status, SyncPhase::Synced);
        assert_eq!(
            status.controllers["HorizontalPodAutoscaler"].status,
            SyncPhase::Synced
        );
        assert!(!status::is_ready(&status));
        assert!(exists(&store, ResourceKind::Service, "minimal"));
        assert_eq!(events.reasons(), vec!["ResourceApplyFailed"]);

        assert_eq!(
            error_policy(application(minimal_spec()), &err, ctx),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn story_transient_failure_requeues_and_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes_for("Service", StoreError::unavailable("etcd leader election"));
        let (ctx, events) = context_with_events(store.clone());
        let app = application(minimal_spec());

        let err = reconcile(app.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            error_policy(app.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );

        store.clear_failures_for("Service");
        reconcile(observed(&app, &store), ctx)
            .await
            .expect("recovered");
        let status = store.status("ns1", "minimal").expect("status");
        assert!(status::is_ready(&status));
        assert_eq!(
            events.reasons(),
            vec!["ResourceApplyFailed", "ApplicationSynced"]
        );
    }

    #[tokio::test]
    async fn story_invalid_replicas_fail_only_scaling_steps() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, events) = context_with_events(store.clone());
        let spec = spec(json!({"image": "image", "port": 8080, "replicas": {"min": 4, "max": 2}}));

        let err = reconcile(application(spec), ctx).await.unwrap_err();
        let ReconcileError::StepsFailed { failed } = err else {
            panic!("expected StepsFailed");
        };
        let kinds: Vec<_> = failed.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::HorizontalPodAutoscaler,
                ResourceKind::PodDisruptionBudget
            ]
        );
        assert!(exists(&store, ResourceKind::Deployment, "minimal"));
        assert_eq!(events.reasons(), vec!["ValidationFailed", "ValidationFailed"]);
    }

    #[tokio::test]
    async fn story_access_policy_creates_and_removes_network_policy() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _) = context_with_events(store.clone());
        let with_policy = spec(json!({
            "image": "image",
            "port": 8080,
            "accessPolicy": {
                "inbound": {"rules": [{"namespace": "ns2", "application": "frontend"}]},
                "outbound": {
                    "rules": [{"application": "backend"}],
                    "external": [{"host": "api.example.com"}]
                }
            }
        }));

        reconcile(application(with_policy), ctx.clone())
            .await
            .expect("cycle with policy");
        let np = store
            .object(&ResourceKind::NetworkPolicy.api_resource(), "ns1", "minimal")
            .expect("network policy");
        assert_eq!(
            np["spec"]["ingress"][0]["from"][0]["namespaceSelector"]["matchLabels"]
                ["kubernetes.io/metadata.name"],
            "ns2"
        );
        assert_eq!(
            np["spec"]["egress"][0]["to"][0]["namespaceSelector"]["matchLabels"]
                ["kubernetes.io/metadata.name"],
            "ns1"
        );
        assert_eq!(np["spec"]["egress"][0]["ports"][0]["port"], 8080);
        assert_eq!(
            store.names(&ResourceKind::ServiceEntry.api_resource(), "ns1"),
            vec!["minimal-egress-api-example-com"]
        );

        let mut without_policy = (*application(minimal_spec())).clone();
        without_policy.metadata.generation = Some(2);
        reconcile(Arc::new(without_policy), ctx)
            .await
            .expect("cycle without policy");
        assert!(!exists(&store, ResourceKind::NetworkPolicy, "minimal"));
        assert!(store
            .names(&ResourceKind::ServiceEntry.api_resource(), "ns1")
            .is_empty());
    }

    #[tokio::test]
    async fn story_unowned_network_policy_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            &ResourceKind::NetworkPolicy.api_resource(),
            json!({"metadata": {"name": "minimal", "namespace": "ns1"}}),
        );
        let (ctx, _) = context_with_events(store.clone());

        reconcile(application(minimal_spec()), ctx)
            .await
            .expect("cycle succeeds");
        assert!(exists(&store, ResourceKind::NetworkPolicy, "minimal"));
    }

    #[tokio::test]
    async fn story_gcp_binding_without_identity_record_warns() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, events) = context_with_events(store.clone());
        let mut spec = minimal_spec();
        spec.gcp = Some(GcpSpec {
            auth: GcpAuth {
                service_account: "sa@project.iam.gserviceaccount.com".to_string(),
            },
        });

        reconcile(application(spec), ctx)
            .await
            .expect("missing record is not a failure");

        assert!(!exists(&store, ResourceKind::ConfigMap, "minimal-gcp-auth"));
        assert_eq!(
            events.reasons(),
            vec!["IdentityConfigMissing", "ApplicationSynced"]
        );
        let status = store.status("ns1", "minimal").expect("status");
        assert_eq!(status.controllers["ConfigMap"].status, SyncPhase::Synced);
    }

    #[tokio::test]
    async fn story_gcp_binding_with_identity_record_writes_config() {
        let store = Arc::new(MemoryStore::new().with_config_map(
            "keel-system",
            "gcp-identity-config",
            identity_record(),
        ));
        let (ctx, events) = context_with_events(store.clone());
        let mut spec = minimal_spec();
        spec.gcp = Some(GcpSpec {
            auth: GcpAuth {
                service_account: "sa@project.iam.gserviceaccount.com".to_string(),
            },
        });

        reconcile(application(spec), ctx.clone())
            .await
            .expect("cycle succeeds");
        let cm = store
            .object(
                &ResourceKind::ConfigMap.api_resource(),
                "ns1",
                "minimal-gcp-auth",
            )
            .expect("config map");
        let config: Value =
            serde_json::from_str(cm["data"]["config"].as_str().expect("config")).expect("json");
        assert_eq!(
            config["audience"],
            "identitynamespace:project.svc.id.goog:provider"
        );
        assert_eq!(events.warnings(), 0);

        // binding removed: the config goes with it
        let mut unbound = (*application(minimal_spec())).clone();
        unbound.metadata.generation = Some(2);
        reconcile(Arc::new(unbound), ctx).await.expect("cycle succeeds");
        assert!(!exists(&store, ResourceKind::ConfigMap, "minimal-gcp-auth"));
    }

    #[tokio::test]
    async fn story_application_without_uid_fails_every_write() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _) = context_with_events(store.clone());
        let mut app = (*application(minimal_spec())).clone();
        app.metadata.uid = None;

        let err = reconcile(Arc::new(app), ctx).await.unwrap_err();
        let ReconcileError::StepsFailed { failed } = err else {
            panic!("expected StepsFailed");
        };
        // optional kinds with nothing declared never need an owner
        assert_eq!(failed.len(), 7);
        assert!(failed
            .iter()
            .all(|f| matches!(f.kind, ResourceKind::ServiceAccount
                | ResourceKind::Deployment
                | ResourceKind::Service
                | ResourceKind::HorizontalPodAutoscaler
                | ResourceKind::PodDisruptionBudget
                | ResourceKind::PeerAuthentication
                | ResourceKind::AuthorizationPolicy)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn story_missing_namespace_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut app = (*application(minimal_spec())).clone();
        app.metadata.namespace = None;

        let err = reconcile(Arc::new(app), Arc::new(Context::for_testing(store)))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingNamespace));
    }

    #[tokio::test]
    async fn story_status_write_failure_does_not_fail_cycle() {
        let store = Arc::new(MemoryStore::new());
        let mut status = MockStatusWriter::new();
        status
            .expect_patch_status()
            .times(2)
            .returning(|_, _, _| Err(StoreError::unavailable("apiserver timeout")));
        let mut shared_config = MockSharedConfigLookup::new();
        shared_config.expect_config_map_data().never();
        let ctx = Context::new(
            store.clone(),
            Arc::new(status),
            Arc::new(shared_config),
            Arc::new(keel_common::events::NoopEventPublisher),
            ControllerSettings::default(),
        );

        reconcile(application(minimal_spec()), Arc::new(ctx))
            .await
            .expect("status failures are only logged");
        assert!(exists(&store, ResourceKind::Deployment, "minimal"));
    }

    /// Delegates to a [`MemoryStore`] but stalls reads of one kind
    struct StallingStore {
        inner: MemoryStore,
        stalled_kind: &'static str,
    }

    #[async_trait]
    impl ObjectStore for StallingStore {
        async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
            if key.resource.kind == self.stalled_kind {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.get(key).await
        }

        async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
            self.inner.create(key, object).await
        }

        async fn patch(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
            self.inner.patch(key, object).await
        }

        async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn list(
            &self,
            resource: &ApiResource,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<Value>, StoreError> {
            self.inner.list(resource, namespace, label_selector).await
        }
    }

    #[tokio::test]
    async fn story_stalled_step_times_out_alone() {
        let memory = Arc::new(MemoryStore::new());
        let stalling = Arc::new(StallingStore {
            inner: MemoryStore::new(),
            stalled_kind: "HorizontalPodAutoscaler",
        });
        let mut ctx = Context::for_testing(memory.clone());
        ctx.store = stalling.clone();
        ctx.settings.step_timeout = Duration::from_millis(50);

        let err = reconcile(application(minimal_spec()), Arc::new(ctx))
            .await
            .unwrap_err();
        let ReconcileError::StepsFailed { failed } = &err else {
            panic!("expected StepsFailed");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ResourceKind::HorizontalPodAutoscaler);
        assert!(err.is_retryable());
        assert!(stalling
            .inner
            .object(&ResourceKind::Deployment.api_resource(), "ns1", "minimal")
            .is_some());

        let status = memory.status("ns1", "minimal").expect("status");
        assert_eq!(
            status.controllers["HorizontalPodAutoscaler"].message,
            "HorizontalPodAutoscaler step timed out after 0s"
        );
    }
}
