//! Deleting phase handler
//!
//! Lets outstanding provisioning requests settle so their resources are
//! known, deletes the server and releases the IP block in parallel, and only
//! then lets the finalizer go. Anything already gone counts as released.

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use capic_cloud::CloudClient;
use capic_common::crd::{IonosCloudMachine, IonosCloudMachineStatus, MachinePhase, OperationKind};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, Outcome};
use capic_tracker::{ProvisioningRequest, Step};

use super::{cloud_access, cloud_name, in_flight, request_key, settle_all, waiting, Access};
use crate::controller::Context;

/// Requests whose resources must be known before teardown
const PROVISIONING: [OperationKind; 3] = [
    OperationKind::CreateServer,
    OperationKind::AttachNic,
    OperationKind::AllocateIp,
];

const ALL_KINDS: [OperationKind; 5] = [
    OperationKind::CreateServer,
    OperationKind::AttachNic,
    OperationKind::AllocateIp,
    OperationKind::DeleteServer,
    OperationKind::ReleaseIp,
];

/// Handle a machine with a deletion timestamp
pub async fn handle_deleting(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let current = machine.status.clone().unwrap_or_default();

    if current.phase == MachinePhase::Deleted {
        return Ok(Outcome::await_change().finalize());
    }

    let mut status = if current.phase == MachinePhase::Deleting {
        current
    } else {
        info!("machine deletion started");
        ctx.events
            .publish(
                &object_ref(machine),
                EventType::Normal,
                reasons::DELETION_STARTED,
                actions::DELETE,
                None,
            )
            .await;
        let mut next = current.transition(MachinePhase::Deleting);
        next.ready = false;
        next
    };

    let key = request_key(machine);
    let access = match cloud_access(machine, ctx).await? {
        Access::Granted(access) => access,
        Access::Missing(missing) => {
            let recorded = status.instance_id.is_some()
                || status.ip_block_id.is_some()
                || !ctx.tracker.outstanding(&key).await?.is_empty();
            if recorded {
                return Ok(waiting(status, ctx, missing));
            }
            warn!(reason = %missing, "no cloud access and nothing recorded, skipping cloud cleanup");
            return Ok(deleted(machine, ctx, status).await);
        }
    };
    let cloud = access.cloud.as_ref();

    let mut settled = Vec::new();
    for kind in PROVISIONING {
        let Some(request) = ctx.tracker.lookup(&key, kind).await? else {
            continue;
        };
        match ctx.tracker.resolve(cloud, &request).await {
            Ok(Step::Waiting { request }) => {
                let outcome = in_flight(
                    machine,
                    ctx,
                    status,
                    &request,
                    "waiting for in-flight requests to settle",
                )
                .await;
                return Ok(settle_all(outcome, settled));
            }
            Ok(Step::Done { resource_id }) => {
                match kind {
                    OperationKind::CreateServer if status.instance_id.is_none() => {
                        status.instance_id = resource_id;
                    }
                    OperationKind::AllocateIp if status.ip_block_id.is_none() => {
                        status.ip_block_id = resource_id;
                    }
                    _ => {}
                }
                settled.push(kind);
            }
            Err(e) if e.is_permanent() || e.is_not_found() => {
                debug!(kind = %kind, error = %e, "in-flight request failed, nothing to release");
            }
            Err(e) => return Err(e),
        }
    }

    sweep(machine, cloud, &access.cluster.spec.location, &mut status).await?;

    let datacenter = machine.spec.datacenter_id.as_str();
    let server = async {
        match status.instance_id.as_deref() {
            Some(id) => released(
                ctx.tracker
                    .drive(cloud, &key, OperationKind::DeleteServer, || {
                        cloud.delete_server(datacenter, id)
                    })
                    .await,
            ),
            None => Ok(None),
        }
    };
    let ip = async {
        match status.ip_block_id.as_deref() {
            Some(id) => released(
                ctx.tracker
                    .drive(cloud, &key, OperationKind::ReleaseIp, || cloud.release_ip(id))
                    .await,
            ),
            None => Ok(None),
        }
    };
    let (server, ip) = tokio::join!(server, ip);

    if let Some(request) = server?.or(ip?) {
        let outcome = in_flight(machine, ctx, status, &request, "releasing cloud resources").await;
        return Ok(settle_all(outcome, settled));
    }

    info!(
        server = ?status.instance_id,
        ip_block = ?status.ip_block_id,
        "machine resources released"
    );
    Ok(deleted(machine, ctx, status).await)
}

/// Fill in ids of resources created before their requests were recorded
async fn sweep(
    machine: &IonosCloudMachine,
    cloud: &dyn CloudClient,
    location: &str,
    status: &mut IonosCloudMachineStatus,
) -> Result<(), Error> {
    let resource = resource_name(machine);
    let name = cloud_name(machine);
    if status.instance_id.is_none() {
        let found = cloud
            .find_server_by_name(&machine.spec.datacenter_id, &name)
            .await
            .map_err(|e| e.into_error(&resource, "find_server_by_name"))?;
        status.instance_id = found.map(|server| server.id);
    }
    if status.ip_block_id.is_none() {
        let found = cloud
            .find_ip_block_by_name(location, &name)
            .await
            .map_err(|e| e.into_error(&resource, "find_ip_block_by_name"))?;
        status.ip_block_id = found.map(|block| block.id);
    }
    Ok(())
}

/// `None` once the resource is gone, the request to wait on otherwise
fn released(step: Result<Step, Error>) -> Result<Option<ProvisioningRequest>, Error> {
    match step {
        Ok(Step::Done { .. }) => Ok(None),
        Ok(Step::Waiting { request }) => Ok(Some(request)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn deleted(
    machine: &IonosCloudMachine,
    ctx: &Context,
    status: IonosCloudMachineStatus,
) -> Outcome<IonosCloudMachineStatus> {
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::DELETED,
            actions::DELETE,
            None,
        )
        .await;

    let mut done = status.transition(MachinePhase::Deleted);
    done.instance_id = None;
    done.nic_id = None;
    done.ip_block_id = None;
    done.addresses.clear();
    done.ready = false;
    settle_all(Outcome::await_change().with_status(done), ALL_KINDS).finalize()
}
