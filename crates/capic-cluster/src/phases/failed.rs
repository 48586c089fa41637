//! Failed phase handler

use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::{debug, info};

use capic_common::crd::{ClusterPhase, IonosCloudCluster, IonosCloudClusterStatus};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::object_ref;
use capic_common::{Error, Outcome};

use crate::controller::Context;

/// Handle a cluster in the Failed phase
///
/// Nothing is retried until the spec changes. A newer generation resets the
/// cluster to Pending; the id of an already reserved endpoint block is kept so
/// it is reused rather than reserved again.
pub async fn handle_failed(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Outcome<IonosCloudClusterStatus>, Error> {
    let current = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;

    if generation <= current.observed_generation {
        debug!(reason = ?current.failure_reason, "cluster failed, waiting for a spec change");
        return Ok(Outcome::await_change());
    }

    info!(
        generation = ?generation,
        observed = ?current.observed_generation,
        "spec changed after failure, resetting cluster"
    );
    ctx.events
        .publish(
            &object_ref(cluster),
            EventType::Normal,
            reasons::RESET,
            actions::RECONCILE,
            current.failure_reason.clone(),
        )
        .await;

    let mut next = IonosCloudClusterStatus::with_phase(ClusterPhase::Pending).observed(generation);
    next.control_plane_ip_block_id = current.control_plane_ip_block_id.clone();
    Ok(Outcome::requeue(Duration::from_secs(1)).with_status(next))
}
