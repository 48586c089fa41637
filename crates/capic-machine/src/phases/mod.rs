//! Phase handlers for the IonosCloudMachine controller
//!
//! Each handler reads the machine as observed and returns the next status as
//! a value. Cloud resources carry deterministic names derived from the
//! machine, so anything created before its request was recorded can be found
//! again by name.

mod bootstrapping;
mod creating;
mod deleting;
mod failed;
mod network;
mod pending;
mod running;

pub use bootstrapping::handle_bootstrapping;
pub use creating::handle_creating;
pub use deleting::handle_deleting;
pub use failed::handle_failed;
pub use network::handle_network;
pub use pending::handle_pending;
pub use running::handle_running;

use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use capic_cloud::CloudClient;
use capic_common::credentials::CloudCredentials;
use capic_common::crd::{
    IonosCloudCluster, IonosCloudMachine, IonosCloudMachineStatus, OperationKind,
    ProvisioningRequest, ResourceKey,
};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::outcome;
use capic_common::{Error, Outcome, CLUSTER_NAME_LABEL};

use crate::controller::Context;

/// Ledger key of a machine
pub(crate) fn request_key(machine: &IonosCloudMachine) -> ResourceKey {
    ResourceKey::machine(machine.namespace().unwrap_or_default(), machine.name_any())
}

/// Name of the machine's server and of its IP block
pub(crate) fn cloud_name(machine: &IonosCloudMachine) -> String {
    format!(
        "{}-{}",
        machine.namespace().unwrap_or_default(),
        machine.name_any()
    )
}

pub(crate) fn nic_name(machine: &IonosCloudMachine) -> String {
    format!("{}-nic", machine.name_any())
}

/// The owning cluster and a cloud client authenticated as it
pub(crate) struct CloudAccess {
    pub cluster: IonosCloudCluster,
    pub cloud: Arc<dyn CloudClient>,
}

/// Either cloud access, or what is still missing for it
pub(crate) enum Access {
    Granted(CloudAccess),
    Missing(String),
}

/// Look up the cluster named by the machine's Cluster API label
///
/// `Err(message)` when the label or the cluster is missing.
pub(crate) async fn owning_cluster(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Result<IonosCloudCluster, String>, Error> {
    let Some(name) = machine.labels().get(CLUSTER_NAME_LABEL) else {
        return Ok(Err(format!("waiting for label {}", CLUSTER_NAME_LABEL)));
    };
    let namespace = machine.namespace().unwrap_or_default();
    match ctx.kube.get_cluster(&namespace, name).await? {
        Some(cluster) => Ok(Ok(cluster)),
        None => Ok(Err(format!("waiting for IonosCloudCluster {}", name))),
    }
}

/// Cloud client using the credentials referenced by `cluster`
pub(crate) async fn cloud_for(
    machine: &IonosCloudMachine,
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Option<Arc<dyn CloudClient>>, Error> {
    let resource = resource_name(machine);
    let namespace = cluster.namespace().unwrap_or_default();
    let secret_name = &cluster.spec.credentials_ref.name;
    let Some(secret) = ctx.kube.get_secret(&namespace, secret_name).await? else {
        return Ok(None);
    };
    let credentials = CloudCredentials::from_secret(&resource, &secret)?
        .with_contract_number(cluster.spec.contract_number.clone());
    let client = ctx
        .cloud
        .build(&credentials)
        .map_err(|e| e.into_error(&resource, "build_client"))?;
    Ok(Some(client))
}

/// Owning cluster plus cloud client, whatever the cluster's phase
pub(crate) async fn cloud_access(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Access, Error> {
    let cluster = match owning_cluster(machine, ctx).await? {
        Ok(cluster) => cluster,
        Err(missing) => return Ok(Access::Missing(missing)),
    };
    match cloud_for(machine, &cluster, ctx).await? {
        Some(cloud) => Ok(Access::Granted(CloudAccess { cluster, cloud })),
        None => Ok(Access::Missing(format!(
            "waiting for credentials Secret {}",
            cluster.spec.credentials_ref.name
        ))),
    }
}

/// Requeue without failing while a dependency is missing
pub(crate) fn waiting(
    status: IonosCloudMachineStatus,
    ctx: &Context,
    message: impl Into<String>,
) -> Outcome<IonosCloudMachineStatus> {
    let message = message.into();
    info!(reason = %message, "machine waiting");
    Outcome::requeue(ctx.config.waiting_interval).with_status(status.message(message))
}

/// Requeue while `request` is in flight, flagging it once it has gone stale
pub(crate) async fn in_flight(
    machine: &IonosCloudMachine,
    ctx: &Context,
    status: IonosCloudMachineStatus,
    request: &ProvisioningRequest,
    message: &str,
) -> Outcome<IonosCloudMachineStatus> {
    outcome::in_flight(
        ctx.events.as_ref(),
        &object_ref(machine),
        &ctx.config,
        status,
        request,
        message,
    )
    .await
}

/// Mark every kind in `kinds` as settled on `outcome`
pub(crate) fn settle_all(
    outcome: Outcome<IonosCloudMachineStatus>,
    kinds: impl IntoIterator<Item = OperationKind>,
) -> Outcome<IonosCloudMachineStatus> {
    kinds.into_iter().fold(outcome, |outcome, kind| outcome.settle(kind))
}
