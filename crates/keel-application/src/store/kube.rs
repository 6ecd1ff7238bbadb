//! API server backed store
//!
//! Child writes go through `DynamicObject` with an explicit `ApiResource`.
//! Both create and update are forced server-side apply under
//! [`FIELD_MANAGER`], so one apply manager owns every field Keel sets. A
//! field dropped from the next apply is removed by the API server and
//! fields other managers own are left alone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use keel_common::crd::{Application, ApplicationStatus};

use super::{ObjectKey, ObjectStore, SharedConfigLookup, StatusWriter, StoreError};
use crate::FIELD_MANAGER;

/// Store implementation talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    async fn server_side_apply(
        &self,
        key: &ObjectKey,
        object: &Value,
    ) -> Result<Value, StoreError> {
        let applied = self
            .api(&key.resource, &key.namespace)
            .patch(&key.name, &apply_params(), &Patch::Apply(object))
            .await
            .map_err(|e| classify(e, &key.resource.kind, &key.name))?;
        to_value(&applied, key)
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Classify a kube error for the object `kind`/`name`
fn classify(err: kube::Error, kind: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => StoreError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: resp.message,
            },
            400 | 403 | 422 => StoreError::Invalid {
                kind: kind.to_string(),
                name: name.to_string(),
                message: resp.message,
            },
            _ => StoreError::unavailable(format!("{kind} {name}: {}", resp.message)),
        },
        other => StoreError::unavailable(format!("{kind} {name}: {other}")),
    }
}

fn to_value(obj: &DynamicObject, key: &ObjectKey) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid {
        kind: key.resource.kind.clone(),
        name: key.name.clone(),
        message: format!("decode: {e}"),
    })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        let found = self
            .api(&key.resource, &key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, &key.resource.kind, &key.name))?;
        found.as_ref().map(|obj| to_value(obj, key)).transpose()
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
        let created = self.server_side_apply(key, object).await?;
        debug!(object = %key, "created");
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
        let patched = self.server_side_apply(key, object).await?;
        debug!(object = %key, "applied");
        Ok(patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.resource, &key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, &key.resource.kind, &key.name))?;
        debug!(object = %key, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| classify(e, &resource.kind, label_selector))?;
        list.items
            .iter()
            .map(|obj| {
                serde_json::to_value(obj).map_err(|e| StoreError::Invalid {
                    kind: resource.kind.clone(),
                    name: obj.metadata.name.clone().unwrap_or_default(),
                    message: format!("decode: {e}"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl StatusWriter for KubeStore {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationStatus,
    ) -> Result<(), StoreError> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, "Application", name))?;
        Ok(())
    }
}

#[async_trait]
impl SharedConfigLookup for KubeStore {
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api
            .get_opt(name)
            .await
            .map_err(|e| classify(e, "ConfigMap", name))?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }
}
