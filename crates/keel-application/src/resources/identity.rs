//! Workload identity federation ConfigMap builder
//!
//! Applications bound to a Google service account get a credential
//! configuration that exchanges the projected Kubernetes token for Google
//! credentials. Pool and provider come from a platform-wide record.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;

use super::{gcp_auth_config_name, AppContext};
use crate::error::StepError;

/// Key holding the credential configuration JSON
pub const GCP_AUTH_CONFIG_KEY: &str = "config";

const POOL_KEY: &str = "workloadIdentityPool";
const PROVIDER_KEY: &str = "identityProvider";

const CREDENTIAL_TYPE: &str = "external_account";
const IMPERSONATION_URL_PREFIX: &str =
    "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/";
const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
const TOKEN_FILE: &str = "/var/run/secrets/tokens/gcp-ksa/token";

/// Platform identity pool settings read from the shared record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPool {
    pub workload_identity_pool: String,
    pub identity_provider: String,
}

impl IdentityPool {
    /// Parse the shared record's data
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, StepError> {
        let get = |key: &str| {
            data.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    StepError::Validation(format!("identity config record is missing '{key}'"))
                })
        };
        Ok(Self {
            workload_identity_pool: get(POOL_KEY)?,
            identity_provider: get(PROVIDER_KEY)?,
        })
    }

    fn audience(&self) -> String {
        format!(
            "identitynamespace:{}:{}",
            self.workload_identity_pool, self.identity_provider
        )
    }
}

#[derive(Serialize)]
struct CredentialConfig<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
    audience: String,
    service_account_impersonation_url: String,
    subject_token_type: &'a str,
    token_url: &'a str,
    credential_source: CredentialSource<'a>,
}

#[derive(Serialize)]
struct CredentialSource<'a> {
    file: &'a str,
}

/// Build `<application>-gcp-auth`, or `None` when the Application declares
/// no Google service account.
pub fn gcp_auth_config(
    app: &AppContext<'_>,
    pool: &IdentityPool,
) -> Result<Option<ConfigMap>, StepError> {
    let Some(gcp) = &app.spec.gcp else {
        return Ok(None);
    };
    let service_account = gcp.auth.service_account.trim();
    if service_account.is_empty() {
        return Err(StepError::Validation(
            "spec.gcp.auth.serviceAccount: must not be empty".to_string(),
        ));
    }

    let config = CredentialConfig {
        type_: CREDENTIAL_TYPE,
        audience: pool.audience(),
        service_account_impersonation_url: format!(
            "{IMPERSONATION_URL_PREFIX}{service_account}:generateAccessToken"
        ),
        subject_token_type: SUBJECT_TOKEN_TYPE,
        token_url: TOKEN_URL,
        credential_source: CredentialSource { file: TOKEN_FILE },
    };

    Ok(Some(ConfigMap {
        metadata: app.meta(gcp_auth_config_name(app.name)).into(),
        data: Some(BTreeMap::from([(
            GCP_AUTH_CONFIG_KEY.to_string(),
            serde_json::to_string(&config)?,
        )])),
        ..Default::default()
    }))
}
