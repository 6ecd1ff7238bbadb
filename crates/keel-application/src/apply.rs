//! Idempotent apply engine
//!
//! Get-or-create keyed by (namespace, name), then apply again only when the
//! live object differs from what this controller wants. Every document gets
//! the Application's controller owner reference before its first write so
//! deleting the Application cascades to its children. A hash of the applied
//! document is kept in the `keel.dev/last-applied` annotation; a field the
//! builders stop emitting changes the hash and forces a new apply.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use keel_common::kube_utils::deterministic_hash;
use keel_common::ANNOTATION_LAST_APPLIED;

use crate::error::StepError;
use crate::store::{ObjectKey, ObjectStore, StoreError};

/// What an apply did to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Nothing desired and nothing present
    Absent,
}

impl ApplyOutcome {
    /// Combine outcomes of several objects of one kind; the most significant wins
    pub fn combine(self, other: ApplyOutcome) -> ApplyOutcome {
        fn rank(o: ApplyOutcome) -> u8 {
            match o {
                ApplyOutcome::Absent => 0,
                ApplyOutcome::Unchanged => 1,
                ApplyOutcome::Deleted => 2,
                ApplyOutcome::Updated => 3,
                ApplyOutcome::Created => 4,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Absent => "absent",
        })
    }
}

/// Applies child documents on behalf of one Application
pub struct ApplyEngine<'a> {
    store: &'a dyn ObjectStore,
    owner: Option<&'a OwnerReference>,
}

impl<'a> ApplyEngine<'a> {
    /// `owner` is `None` when the Application has no UID yet; every write
    /// then fails for its step alone.
    pub fn new(store: &'a dyn ObjectStore, owner: Option<&'a OwnerReference>) -> Self {
        Self { store, owner }
    }

    fn owner(&self) -> Result<&'a OwnerReference, StepError> {
        self.owner.ok_or_else(|| {
            StepError::OwnerReference("Application has no UID to own children with".to_string())
        })
    }

    /// Create `desired` or bring the live object in line with it
    pub async fn apply<T: Serialize>(
        &self,
        resource: &ApiResource,
        desired: &T,
    ) -> Result<ApplyOutcome, StepError> {
        let owner = self.owner()?;
        let mut doc = serde_json::to_value(desired)?;
        let (namespace, name) = prepare(&mut doc, resource, owner)?;
        let hash = stamp_last_applied(&mut doc)?;
        let key = ObjectKey::new(resource.clone(), namespace, name);

        let Some(live) = self.store.get(&key).await? else {
            self.store.create(&key, &doc).await?;
            info!(object = %key, "created child resource");
            return Ok(ApplyOutcome::Created);
        };

        if let Some(other) = foreign_controller(&live, owner) {
            return Err(StepError::OwnerReference(format!(
                "{key} is controlled by {other}"
            )));
        }

        if last_applied(&live) == Some(hash.as_str()) && is_subset(&doc, &live) {
            debug!(object = %key, "child resource unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        self.store.patch(&key, &doc).await?;
        info!(object = %key, "updated child resource");
        Ok(ApplyOutcome::Updated)
    }

    /// Delete a child that is no longer desired. Objects this Application
    /// does not control are left alone.
    pub async fn remove(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<ApplyOutcome, StepError> {
        let key = ObjectKey::new(resource.clone(), namespace, name);
        let Some(live) = self.store.get(&key).await? else {
            return Ok(ApplyOutcome::Absent);
        };
        if !self.controls(&live)? {
            debug!(object = %key, "not controlled by this application, leaving in place");
            return Ok(ApplyOutcome::Absent);
        }
        self.delete(&key).await
    }

    /// Delete controlled objects matching `label_selector` whose names are
    /// not in `keep`
    pub async fn prune(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
        keep: &[String],
    ) -> Result<ApplyOutcome, StepError> {
        let mut outcome = ApplyOutcome::Absent;
        for live in self.store.list(resource, namespace, label_selector).await? {
            let Some(name) = live
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if keep.iter().any(|k| k == name) || !self.controls(&live)? {
                continue;
            }
            let key = ObjectKey::new(resource.clone(), namespace, name);
            outcome = outcome.combine(self.delete(&key).await?);
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<ApplyOutcome, StepError> {
        match self.store.delete(key).await {
            Ok(()) => {
                info!(object = %key, "deleted stale child resource");
                Ok(ApplyOutcome::Deleted)
            }
            Err(StoreError::NotFound { .. }) => Ok(ApplyOutcome::Absent),
            Err(e) => Err(e.into()),
        }
    }

    fn controls(&self, live: &Value) -> Result<bool, StepError> {
        let owner = self.owner()?;
        Ok(controller_uid(live).is_some_and(|uid| uid == owner.uid))
    }
}

/// Stamp type meta and the owner reference, returning (namespace, name)
fn prepare(
    doc: &mut Value,
    resource: &ApiResource,
    owner: &OwnerReference,
) -> Result<(String, String), StepError> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| StepError::Validation(format!("{} is not an object", resource.kind)))?;
    obj.insert(
        "apiVersion".to_string(),
        Value::String(resource.api_version.clone()),
    );
    obj.insert("kind".to_string(), Value::String(resource.kind.clone()));

    let meta = obj
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| StepError::Validation(format!("{} has no metadata", resource.kind)))?;
    let field = |meta: &serde_json::Map<String, Value>, f: &str| {
        meta.get(f)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StepError::Validation(format!("{} has no {f}", resource.kind)))
    };
    let name = field(&*meta, "name")?;
    let namespace = field(&*meta, "namespace")?;
    meta.insert(
        "ownerReferences".to_string(),
        serde_json::to_value(vec![owner])?,
    );
    Ok((namespace, name))
}

/// Record a hash of `doc` in its annotations and return it
fn stamp_last_applied(doc: &mut Value) -> Result<String, StepError> {
    let hash = deterministic_hash(&serde_json::to_string(&*doc)?);
    if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
        let annotations = meta
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                ANNOTATION_LAST_APPLIED.to_string(),
                Value::String(hash.clone()),
            );
        }
    }
    Ok(hash)
}

fn last_applied(live: &Value) -> Option<&str> {
    live.get("metadata")?
        .get("annotations")?
        .get(ANNOTATION_LAST_APPLIED)?
        .as_str()
}

fn controller_uid(live: &Value) -> Option<&str> {
    live.get("metadata")?
        .get("ownerReferences")?
        .as_array()?
        .iter()
        .find(|r| r.get("controller").and_then(Value::as_bool) == Some(true))?
        .get("uid")?
        .as_str()
}

/// Description of the controller owner when it is not `owner`
fn foreign_controller(live: &Value, owner: &OwnerReference) -> Option<String> {
    let uid = controller_uid(live)?;
    if uid == owner.uid {
        return None;
    }
    let refs = live.get("metadata")?.get("ownerReferences")?.as_array()?;
    let controller = refs.iter().find(|r| r.get("uid").and_then(Value::as_str) == Some(uid))?;
    Some(format!(
        "{} {}",
        controller.get("kind").and_then(Value::as_str).unwrap_or("object"),
        controller.get("name").and_then(Value::as_str).unwrap_or(uid),
    ))
}

/// Whether every field of `desired` already holds in `live`.
///
/// Objects compare key by key, arrays element-wise with equal length.
/// `ownerReferences` is a list keyed by uid, so other owners' entries are
/// ignored. Empty collections match missing fields since the API server
/// drops them.
fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) if k == "ownerReferences" => owner_refs_subset(dv, lv),
            Some(lv) => is_subset(dv, lv),
            None => is_empty(dv),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        (d, Value::Null) => is_empty(d),
        (d, l) => d == l,
    }
}

fn owner_refs_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Array(d), Value::Array(l)) => d.iter().all(|dr| {
            l.iter()
                .any(|lr| lr.get("uid") == dr.get("uid") && is_subset(dr, lr))
        }),
        (d, l) => is_subset(d, l),
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.values().all(is_empty),
        _ => false,
    }
}
