//! Istio resource types generated for applications
//!
//! - PeerAuthentication (mTLS mode)
//! - AuthorizationPolicy (L7 deny rules)
//! - ServiceEntry (external host registration)
//!
//! All types implement `HasApiResource` so the apply path and the watch
//! wiring agree on API version and kind.

mod istio;
mod service_entry;

pub use istio::{
    AuthorizationOperation, AuthorizationPolicy, AuthorizationPolicySpec, AuthorizationRule,
    AuthorizationSource, MtlsConfig, OperationSpec, PeerAuthentication, PeerAuthenticationSpec,
    SourceSpec, WorkloadSelector, ACTION_DENY, MTLS_STRICT,
};
pub use service_entry::{
    ServiceEntry, ServiceEntryPort, ServiceEntrySpec, LOCATION_MESH_EXTERNAL, RESOLUTION_DNS,
};
