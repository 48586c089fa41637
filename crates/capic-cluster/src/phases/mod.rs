//! Phase handlers for the IonosCloudCluster controller
//!
//! Each handler reads the cluster as observed and returns the next status as
//! a value; nothing in here writes the cluster status directly.

mod deleting;
mod failed;
mod pending;
mod provisioning;
mod ready;

pub use deleting::handle_deleting;
pub use failed::handle_failed;
pub use pending::handle_pending;
pub use provisioning::handle_provisioning;
pub use ready::handle_ready;

use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use capic_cloud::CloudClient;
use capic_common::credentials::CloudCredentials;
use capic_common::crd::{
    condition_types, Condition, ConditionStatus, IonosCloudCluster, IonosCloudClusterStatus,
    ProvisioningRequest, ResourceKey,
};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::outcome;
use capic_common::{Error, Outcome};

use crate::controller::Context;

/// Ledger key of a cluster
pub(crate) fn request_key(cluster: &IonosCloudCluster) -> ResourceKey {
    ResourceKey::cluster(cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Deterministic name of the IP block backing a derived endpoint
pub(crate) fn endpoint_block_name(cluster: &IonosCloudCluster) -> String {
    format!(
        "{}-{}-endpoint",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Resolve the cluster's cloud credentials
///
/// `None` while the referenced Secret does not exist yet. A Secret that
/// exists but cannot be parsed is a permanent error.
pub(crate) async fn resolve_credentials(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Option<CloudCredentials>, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let Some(secret) = ctx
        .kube
        .get_secret(&namespace, &cluster.spec.credentials_ref.name)
        .await?
    else {
        return Ok(None);
    };
    let credentials = CloudCredentials::from_secret(&resource_name(cluster), &secret)?
        .with_contract_number(cluster.spec.contract_number.clone());
    Ok(Some(credentials))
}

/// Cloud client authenticated as the cluster, `None` while credentials are missing
pub(crate) async fn cloud_client(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Option<Arc<dyn CloudClient>>, Error> {
    let Some(credentials) = resolve_credentials(cluster, ctx).await? else {
        return Ok(None);
    };
    let client = ctx
        .cloud
        .build(&credentials)
        .map_err(|e| e.into_error(&resource_name(cluster), "build_client"))?;
    Ok(Some(client))
}

/// Wait for the credentials Secret without failing the cluster
pub(crate) fn waiting_for_credentials(
    cluster: &IonosCloudCluster,
    status: IonosCloudClusterStatus,
    ctx: &Context,
) -> Outcome<IonosCloudClusterStatus> {
    let message = format!(
        "waiting for credentials Secret {}",
        cluster.spec.credentials_ref.name
    );
    info!(secret = %cluster.spec.credentials_ref.name, "credentials Secret not found, waiting");
    let status = status
        .condition(Condition::new(
            condition_types::CREDENTIALS_RESOLVED,
            ConditionStatus::False,
            "SecretNotFound",
            message.clone(),
        ))
        .message(message);
    Outcome::requeue(ctx.config.waiting_interval).with_status(status)
}

/// Requeue while `request` is in flight, flagging it once it has gone stale
pub(crate) async fn in_flight(
    cluster: &IonosCloudCluster,
    ctx: &Context,
    status: IonosCloudClusterStatus,
    request: &ProvisioningRequest,
    message: &str,
) -> Outcome<IonosCloudClusterStatus> {
    outcome::in_flight(
        ctx.events.as_ref(),
        &object_ref(cluster),
        &ctx.config,
        status,
        request,
        message,
    )
    .await
}
