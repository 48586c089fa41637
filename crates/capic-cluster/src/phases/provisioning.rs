//! Provisioning phase handler
//!
//! Publishes the control-plane endpoint. A host in the spec is published as
//! is; otherwise an IP block is reserved through the request tracker and its
//! first address becomes the endpoint on the default API server port.

use kube::runtime::events::EventType;
use tracing::{debug, info};

use capic_cloud::{ensure_ip_block, CloudClient, IpBlockSpec};
use capic_common::crd::{
    clear_condition, condition_types, ApiEndpoint, ClusterPhase, Condition, ConditionStatus,
    IonosCloudCluster, IonosCloudClusterStatus, OperationKind,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, Outcome, DEFAULT_API_SERVER_PORT};
use capic_tracker::Step;

use super::{cloud_client, endpoint_block_name, in_flight, request_key, waiting_for_credentials};
use crate::controller::Context;

/// Handle a cluster in the Provisioning phase
pub async fn handle_provisioning(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Outcome<IonosCloudClusterStatus>, Error> {
    let current = cluster.status.clone().unwrap_or_default();

    let requested = &cluster.spec.control_plane_endpoint;
    if requested.is_set() {
        let endpoint = ApiEndpoint::new(requested.host.clone(), requested.effective_port());
        return Ok(publish_endpoint(cluster, ctx, current, endpoint).await);
    }

    let Some(cloud) = cloud_client(cluster, ctx).await? else {
        return Ok(waiting_for_credentials(cluster, current, ctx));
    };

    let mut status = current;
    let mut settled = None;
    let block_id = match status.control_plane_ip_block_id.clone() {
        Some(id) => id,
        None => match reserve_block(cluster, ctx, cloud.as_ref()).await? {
            Step::Waiting { request } => {
                return Ok(in_flight(
                    cluster,
                    ctx,
                    status,
                    &request,
                    "reserving control-plane IP",
                )
                .await);
            }
            Step::Done {
                resource_id: Some(id),
            } => {
                info!(ip_block = %id, "control-plane IP block reserved");
                status.control_plane_ip_block_id = Some(id.clone());
                settled = Some(OperationKind::AllocateIp);
                id
            }
            Step::Done { resource_id: None } => {
                // The next pass adopts the block by name
                ctx.tracker
                    .clear(&request_key(cluster), OperationKind::AllocateIp)
                    .await?;
                return Err(Error::internal_with_context(
                    resource_name(cluster),
                    "IP block request succeeded without a block id",
                ));
            }
        },
    };

    let resource = resource_name(cluster);
    let block = match cloud.describe_ip_block(&block_id).await {
        Ok(block) => block,
        Err(e) if e.is_not_found() => return Err(Error::external_deletion(resource, block_id)),
        Err(e) => return Err(e.into_error(&resource, "describe_ip_block")),
    };

    let outcome = match block.ips.first() {
        Some(ip) => {
            let endpoint = ApiEndpoint::new(ip.clone(), i32::from(DEFAULT_API_SERVER_PORT));
            publish_endpoint(cluster, ctx, status, endpoint).await
        }
        None => {
            debug!(ip_block = %block.id, "IP block has no address yet");
            Outcome::requeue(ctx.config.poll_interval)
                .with_status(status.message("waiting for the IP block to be populated"))
        }
    };

    Ok(match settled {
        Some(kind) => outcome.settle(kind),
        None => outcome,
    })
}

async fn reserve_block(
    cluster: &IonosCloudCluster,
    ctx: &Context,
    cloud: &dyn CloudClient,
) -> Result<Step, Error> {
    let spec = IpBlockSpec {
        name: endpoint_block_name(cluster),
        location: cluster.spec.location.clone(),
        size: 1,
    };
    ctx.tracker
        .drive(cloud, &request_key(cluster), OperationKind::AllocateIp, || {
            ensure_ip_block(cloud, &spec)
        })
        .await
}

async fn publish_endpoint(
    cluster: &IonosCloudCluster,
    ctx: &Context,
    status: IonosCloudClusterStatus,
    endpoint: ApiEndpoint,
) -> Outcome<IonosCloudClusterStatus> {
    info!(endpoint = %endpoint, "control-plane endpoint published, cluster Ready");
    ctx.events
        .publish(
            &object_ref(cluster),
            EventType::Normal,
            reasons::CLUSTER_READY,
            actions::RECONCILE,
            Some(format!("Control-plane endpoint {}", endpoint)),
        )
        .await;

    let mut next = status
        .transition(ClusterPhase::Ready)
        .condition(Condition::new(
            condition_types::ENDPOINT_PUBLISHED,
            ConditionStatus::True,
            "Published",
            endpoint.to_string(),
        ))
        .condition(Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "Ready",
            "",
        ));
    clear_condition(&mut next.conditions, condition_types::REQUEST_STALE);
    next.control_plane_endpoint = Some(endpoint);
    next.ready = true;
    Outcome::requeue(ctx.config.ready_resync).with_status(next)
}
