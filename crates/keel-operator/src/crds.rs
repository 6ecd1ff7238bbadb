use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use keel_common::crd::Application;

/// Field manager for CRD installation
const CRD_FIELD_MANAGER: &str = "keel-controller";

/// Application CRD as YAML
pub fn application_crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&Application::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))
}

/// Install or update the Application CRD using server-side apply
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CRD_FIELD_MANAGER).force();
    let name = Application::crd_name();

    tracing::info!("Installing {name} CRD...");
    crds.patch(name, &params, &Patch::Apply(&Application::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    tracing::info!("{name} CRD installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_yaml_names_the_application_resource() {
        let yaml = application_crd_yaml().expect("render");
        assert!(yaml.contains("name: applications.keel.dev"));
        assert!(yaml.contains("kind: Application"));
        assert_eq!(Application::crd_name(), "applications.keel.dev");
    }
}
