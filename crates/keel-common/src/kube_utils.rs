//! Shared Kubernetes helpers: child-resource metadata and `ApiResource` building

use std::collections::BTreeMap;

use kube::discovery::ApiResource;

// =============================================================================
// ObjectMeta - canonical metadata for every child resource
// =============================================================================

/// Kubernetes ObjectMeta for child resources of an Application.
///
/// Construction stamps the `app=<application>` selector label, the Keel
/// managed-by label, and the Argo CD no-prune annotation, so every builder
/// produces the same labelling without repeating it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata for a child named `name` belonging to `application`
    pub fn for_application(
        name: impl Into<String>,
        namespace: impl Into<String>,
        application: &str,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(crate::LABEL_APP.to_string(), application.to_string());
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_KEEL.to_string(),
        );
        let mut annotations = BTreeMap::new();
        annotations.insert(
            crate::ANNOTATION_SYNC_OPTIONS.to_string(),
            crate::SYNC_OPTIONS_NO_PRUNE.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations,
        }
    }
}

impl From<ObjectMeta> for k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            name: Some(meta.name),
            namespace: Some(meta.namespace),
            labels: (!meta.labels.is_empty()).then_some(meta.labels),
            annotations: (!meta.annotations.is_empty()).then_some(meta.annotations),
            ..Default::default()
        }
    }
}

/// Selector labels (`app=<application>`) for pods of an application
pub fn selector_labels(application: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(crate::LABEL_APP.to_string(), application.to_string())])
}

/// Label selector string matching every child of an application
pub fn application_selector(application: &str) -> String {
    format!(
        "{}={},{}={}",
        crate::LABEL_APP,
        application,
        crate::LABEL_MANAGED_BY,
        crate::LABEL_MANAGED_BY_KEEL
    )
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for hand-written CRD types (Istio resources) to derive their
/// `ApiResource` from the same constants used during serialization.
///
/// # Example
/// ```ignore
/// impl HasApiResource for PeerAuthentication {
///     const API_VERSION: &'static str = "security.istio.io/v1";
///     const KIND: &'static str = "PeerAuthentication";
/// }
///
/// let ar = PeerAuthentication::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "security.istio.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "AuthorizationPolicy")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version). Core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind using the API server's rules for
/// the kinds Keel manages.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Truncated SHA-256 of `input` as 16 hex chars.
///
/// Stable across toolchains, so it is safe to persist in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
