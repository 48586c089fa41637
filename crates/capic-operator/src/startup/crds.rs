//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the installed schema always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use capic_common::crd::{IonosCloudCluster, IonosCloudMachine};
use capic_common::retry::{retry_with_backoff, RetryConfig};
use capic_common::FIELD_MANAGER;

/// Attempts before startup gives up on the API server
const INSTALL_ATTEMPTS: u32 = 10;

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![IonosCloudCluster::crd(), IonosCloudMachine::crd()]
}

/// All CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

async fn install_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }
    Ok(())
}

/// Install or update the IonosCloudCluster and IonosCloudMachine CRDs
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    retry_with_backoff(
        &RetryConfig::with_max_attempts(INSTALL_ATTEMPTS),
        "install CRDs",
        || install_crds(client),
    )
    .await?;
    tracing::info!("CRDs installed/updated");
    Ok(())
}
