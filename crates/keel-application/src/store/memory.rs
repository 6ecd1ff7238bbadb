//! In-memory store
//!
//! Behaves like the API server's server-side apply for the operations the
//! controller uses. Updates are a recursive merge that drops fields the
//! previous apply set and the new one omits, `ownerReferences` merge by uid,
//! and `resourceVersion` only moves when content changes. Failures can be
//! injected per kind. Counters let tests assert that a converged application
//! causes no further writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::discovery::ApiResource;
use serde_json::{Map, Value};

use keel_common::crd::ApplicationStatus;

use super::{
    parse_label_selector, ObjectKey, ObjectStore, SharedConfigLookup, StatusWriter, StoreError,
};

/// (apiVersion, kind, namespace, name)
type StoredKey = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoredKey, Value>,
    /// Last document applied through create/patch, per object
    applied: BTreeMap<StoredKey, Value>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    statuses: BTreeMap<(String, String), ApplicationStatus>,
    write_failures: BTreeMap<String, StoreError>,
}

/// In-memory [`ObjectStore`], [`StatusWriter`] and [`SharedConfigLookup`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    resource_version: AtomicU64,
    uid: AtomicU64,
    writes: AtomicUsize,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Register a shared ConfigMap visible through [`SharedConfigLookup`]
    pub fn with_config_map(
        self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.state()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
        self
    }

    /// Make every create/patch of `kind` fail with `error`
    pub fn fail_writes_for(&self, kind: &str, error: StoreError) {
        self.state().write_failures.insert(kind.to_string(), error);
    }

    /// Stop injecting failures for `kind`
    pub fn clear_failures_for(&self, kind: &str) {
        self.state().write_failures.remove(kind);
    }

    /// Seed an object as if another actor had created it
    pub fn insert(&self, resource: &ApiResource, object: Value) {
        let namespace = meta_str(&object, "namespace").unwrap_or_default();
        let name = meta_str(&object, "name").unwrap_or_default();
        let key = (
            resource.api_version.clone(),
            resource.kind.clone(),
            namespace,
            name,
        );
        self.state().objects.insert(key, object);
    }

    /// Merge `patch` into a stored object as another field manager would.
    /// Not counted as a write.
    pub fn merge_foreign(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) {
        let mut state = self.state();
        if let Some(current) = state
            .objects
            .get_mut(&stored_key_parts(resource, namespace, name))
        {
            merge(current, patch);
            set_meta(current, "resourceVersion", self.next_resource_version());
        }
    }

    /// Stored object, if any
    pub fn object(&self, resource: &ApiResource, namespace: &str, name: &str) -> Option<Value> {
        self.state()
            .objects
            .get(&stored_key_parts(resource, namespace, name))
            .cloned()
    }

    /// Names of every stored object of a kind in a namespace
    pub fn names(&self, resource: &ApiResource, namespace: &str) -> Vec<String> {
        self.state()
            .objects
            .keys()
            .filter(|(v, k, ns, _)| {
                *v == resource.api_version && *k == resource.kind && ns == namespace
            })
            .map(|(_, _, _, name)| name.clone())
            .collect()
    }

    /// Number of create and patch calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of status writes so far
    pub fn status_write_count(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Last status written for an Application
    pub fn status(&self, namespace: &str, name: &str) -> Option<ApplicationStatus> {
        self.state()
            .statuses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn check_write(&self, state: &State, key: &ObjectKey) -> Result<(), StoreError> {
        match state.write_failures.get(&key.resource.kind) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn stored_key(key: &ObjectKey) -> StoredKey {
    stored_key_parts(&key.resource, &key.namespace, &key.name)
}

fn stored_key_parts(resource: &ApiResource, namespace: &str, name: &str) -> StoredKey {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn meta_str(object: &Value, field: &str) -> Option<String> {
    object
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn set_meta(object: &mut Value, field: &str, value: String) {
    if let Some(meta) = object
        .as_object_mut()
        .map(|o| o.entry("metadata").or_insert_with(|| Value::Object(Map::new())))
        .and_then(Value::as_object_mut)
    {
        meta.insert(field.to_string(), Value::String(value));
    }
}

/// Recursive merge: objects merge key by key, `ownerReferences` by uid,
/// everything else is replaced
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                let slot = target.entry(k.clone()).or_insert(Value::Null);
                if k == "ownerReferences" {
                    merge_by_uid(slot, v);
                } else {
                    merge(slot, v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn merge_by_uid(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Array(live), Value::Array(entries)) => {
            for entry in entries {
                match live.iter_mut().find(|l| l.get("uid") == entry.get("uid")) {
                    Some(existing) => *existing = entry.clone(),
                    None => live.push(entry.clone()),
                }
            }
        }
        (target, patch) => merge(target, patch),
    }
}

/// Remove from `target` the fields `previous` set that `next` omits
fn drop_removed(target: &mut Value, previous: &Value, next: &Value) {
    let (Value::Object(target), Value::Object(previous)) = (target, previous) else {
        return;
    };
    for (k, prev) in previous {
        match next.get(k) {
            None => {
                target.remove(k);
            }
            Some(next) => {
                if let Some(slot) = target.get_mut(k) {
                    drop_removed(slot, prev, next);
                }
            }
        }
    }
}

fn labels_match(object: &Value, selector: &[(&str, &str)]) -> bool {
    let labels = object.get("metadata").and_then(|m| m.get("labels"));
    selector.iter().all(|(k, v)| {
        labels
            .and_then(|l| l.get(*k))
            .and_then(Value::as_str)
            .is_some_and(|actual| actual == *v)
    })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        Ok(self.state().objects.get(&stored_key(key)).cloned())
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
        let mut state = self.state();
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write(&state, key)?;

        let stored = stored_key(key);
        if state.objects.contains_key(&stored) {
            return Err(StoreError::Conflict {
                kind: key.resource.kind.clone(),
                name: key.name.clone(),
                message: "already exists".to_string(),
            });
        }

        state.applied.insert(stored.clone(), object.clone());
        let mut object = object.clone();
        let uid = self.uid.fetch_add(1, Ordering::SeqCst) + 1;
        set_meta(&mut object, "uid", format!("uid-{uid}"));
        set_meta(&mut object, "resourceVersion", self.next_resource_version());
        state.objects.insert(stored, object.clone());
        Ok(object)
    }

    async fn patch(&self, key: &ObjectKey, object: &Value) -> Result<Value, StoreError> {
        let mut state = self.state();
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write(&state, key)?;

        let stored = stored_key(key);
        let State {
            objects, applied, ..
        } = &mut *state;
        let Some(current) = objects.get_mut(&stored) else {
            return Err(StoreError::NotFound {
                kind: key.resource.kind.clone(),
                name: key.name.clone(),
            });
        };

        let mut merged = current.clone();
        if let Some(previous) = applied.get(&stored) {
            drop_removed(&mut merged, previous, object);
        }
        merge(&mut merged, object);
        applied.insert(stored, object.clone());
        if merged != *current {
            set_meta(&mut merged, "resourceVersion", self.next_resource_version());
            *current = merged;
        }
        Ok(current.clone())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state();
        state.applied.remove(&stored_key(key));
        match state.objects.remove(&stored_key(key)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind: key.resource.kind.clone(),
                name: key.name.clone(),
            }),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let selector = parse_label_selector(label_selector);
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|((v, k, ns, _), obj)| {
                *v == resource.api_version
                    && *k == resource.kind
                    && ns == namespace
                    && labels_match(obj, &selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

#[async_trait]
impl StatusWriter for MemoryStore {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        self.status_writes.fetch_add(1, Ordering::SeqCst);

        let entry = state
            .statuses
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        // merge-patch semantics: map entries merge, scalars and lists replace
        entry.controllers.extend(status.controllers.clone());
        if status.observed_generation.is_some() {
            entry.observed_generation = status.observed_generation;
        }
        if status.application.is_some() {
            entry.application = status.application.clone();
        }
        entry.conditions = status.conditions.clone();
        Ok(())
    }
}

#[async_trait]
impl SharedConfigLookup for MemoryStore {
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        Ok(self
            .state()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
