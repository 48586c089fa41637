//! Deleting phase handler
//!
//! Waits for every machine of the cluster to be gone, releases the endpoint
//! IP block (if one was ever reserved) and only then lets the finalizer go.

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use capic_cloud::CloudClient;
use capic_common::crd::{
    ClusterPhase, IonosCloudCluster, IonosCloudClusterStatus, OperationKind,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{ClusterKey, Error, Outcome};
use capic_tracker::{PollResult, Step};

use super::{cloud_client, endpoint_block_name, in_flight, request_key, waiting_for_credentials};
use crate::controller::Context;

const WAITING_FOR_MACHINES: &str = "waiting for machines to be deleted";

/// Handle a cluster with a deletion timestamp
///
/// Safe to run any number of times: a cluster already marked Deleted only
/// has its finalizer removed again.
pub async fn handle_deleting(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Outcome<IonosCloudClusterStatus>, Error> {
    let current = cluster.status.clone().unwrap_or_default();

    if current.phase == ClusterPhase::Deleted {
        return Ok(Outcome::await_change().finalize());
    }

    let mut status = if current.phase == ClusterPhase::Deleting {
        current
    } else {
        info!("cluster deletion started");
        ctx.events
            .publish(
                &object_ref(cluster),
                EventType::Normal,
                reasons::DELETION_STARTED,
                actions::DELETE,
                None,
            )
            .await;
        let mut next = current.transition(ClusterPhase::Deleting);
        next.ready = false;
        next
    };

    let key = ClusterKey::new(cluster.namespace().unwrap_or_default(), cluster.name_any());
    if !ctx.teardown.can_delete(&key).await? {
        if status.message.as_deref() != Some(WAITING_FOR_MACHINES) {
            ctx.events
                .publish(
                    &object_ref(cluster),
                    EventType::Normal,
                    reasons::WAITING_FOR_MACHINES,
                    actions::DELETE,
                    None,
                )
                .await;
        }
        return Ok(
            Outcome::requeue(ctx.config.waiting_interval).with_status(status.message(WAITING_FOR_MACHINES))
        );
    }

    if let Some(waiting) = release_endpoint(cluster, ctx, &mut status).await? {
        return Ok(waiting);
    }

    info!("cluster resources released");
    ctx.events
        .publish(
            &object_ref(cluster),
            EventType::Normal,
            reasons::DELETED,
            actions::DELETE,
            None,
        )
        .await;

    let mut done = status.transition(ClusterPhase::Deleted);
    done.control_plane_ip_block_id = None;
    Ok(Outcome::await_change()
        .with_status(done)
        .settle(OperationKind::AllocateIp)
        .settle(OperationKind::ReleaseIp)
        .finalize())
}

/// Release the endpoint IP block
///
/// Returns an outcome to wait with while anything is still in flight, `None`
/// once nothing is left to release.
async fn release_endpoint(
    cluster: &IonosCloudCluster,
    ctx: &Context,
    status: &mut IonosCloudClusterStatus,
) -> Result<Option<Outcome<IonosCloudClusterStatus>>, Error> {
    let key = request_key(cluster);
    let derived = !cluster.spec.control_plane_endpoint.is_set();
    let reservation = ctx.tracker.lookup(&key, OperationKind::AllocateIp).await?;

    if status.control_plane_ip_block_id.is_none() && reservation.is_none() && !derived {
        return Ok(None);
    }

    let Some(cloud) = cloud_client(cluster, ctx).await? else {
        if status.control_plane_ip_block_id.is_none() && reservation.is_none() {
            warn!("no credentials to sweep for an unrecorded IP block, skipping");
            return Ok(None);
        }
        return Ok(Some(waiting_for_credentials(cluster, status.clone(), ctx)));
    };

    // A reservation still in flight must land before its block can be released
    if let Some(request) = reservation {
        let polled = ctx.tracker.poll(cloud.as_ref(), &request).await?;
        match polled.result {
            PollResult::Pending => {
                return Ok(Some(
                    in_flight(
                        cluster,
                        ctx,
                        status.clone(),
                        &polled.request,
                        "waiting for the IP reservation to settle",
                    )
                    .await,
                ));
            }
            PollResult::Succeeded { resource_id } => {
                if status.control_plane_ip_block_id.is_none() {
                    status.control_plane_ip_block_id = resource_id;
                }
            }
            PollResult::Failed { .. } => {}
        }
    }

    let block_id = match status.control_plane_ip_block_id.clone() {
        Some(id) => Some(id),
        None if derived => find_block(cluster, cloud.as_ref()).await?,
        None => None,
    };
    let Some(block_id) = block_id else {
        return Ok(None);
    };
    status.control_plane_ip_block_id = Some(block_id.clone());

    let step = ctx
        .tracker
        .drive(cloud.as_ref(), &key, OperationKind::ReleaseIp, || {
            cloud.release_ip(&block_id)
        })
        .await;
    match step {
        Ok(Step::Done { .. }) => {
            info!(ip_block = %block_id, "control-plane IP block released");
            Ok(None)
        }
        Err(e) if e.is_not_found() => {
            info!(ip_block = %block_id, "control-plane IP block already gone");
            Ok(None)
        }
        Ok(Step::Waiting { request }) => Ok(Some(
            in_flight(
                cluster,
                ctx,
                status.clone(),
                &request,
                "releasing control-plane IP",
            )
            .await,
        )),
        Err(e) => Err(e),
    }
}

async fn find_block(
    cluster: &IonosCloudCluster,
    cloud: &dyn CloudClient,
) -> Result<Option<String>, Error> {
    let found = cloud
        .find_ip_block_by_name(&cluster.spec.location, &endpoint_block_name(cluster))
        .await
        .map_err(|e| e.into_error(&resource_name(cluster), "find_ip_block_by_name"))?;
    Ok(found.map(|block| block.id))
}
