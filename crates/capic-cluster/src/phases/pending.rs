//! Pending phase handler
//!
//! Validates the spec, resolves credentials and confirms the location with
//! the cloud before anything is provisioned.

use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::info;

use capic_common::crd::{
    condition_types, ClusterPhase, Condition, ConditionStatus, IonosCloudCluster,
    IonosCloudClusterStatus,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, ErrorClass, Outcome};

use super::{cloud_client, waiting_for_credentials};
use crate::controller::Context;

/// Handle a cluster in the Pending phase
///
/// A missing credentials Secret keeps the cluster Pending and requeues; an
/// invalid spec or an unknown location fails it.
pub async fn handle_pending(
    cluster: &IonosCloudCluster,
    ctx: &Context,
) -> Result<Outcome<IonosCloudClusterStatus>, Error> {
    let resource = resource_name(cluster);
    let current = cluster.status.clone().unwrap_or_default();

    cluster.spec.validate(&resource)?;

    let Some(cloud) = cloud_client(cluster, ctx).await? else {
        return Ok(waiting_for_credentials(cluster, current, ctx));
    };

    let location = &cluster.spec.location;
    match cloud.verify_location(location).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            return Err(Error::cloud(
                &resource,
                "verify_location",
                ErrorClass::Permanent,
                format!("location {} not found", location),
            ));
        }
        Err(e) => return Err(e.into_error(&resource, "verify_location")),
    }

    info!(location = %location, "credentials and location verified");
    ctx.events
        .publish(
            &object_ref(cluster),
            EventType::Normal,
            reasons::CLUSTER_PROVISIONING,
            actions::RECONCILE,
            Some(format!("Provisioning in {}", location)),
        )
        .await;

    let mut next = current
        .transition(ClusterPhase::Provisioning)
        .observed(cluster.metadata.generation)
        .condition(Condition::new(
            condition_types::CREDENTIALS_RESOLVED,
            ConditionStatus::True,
            "Resolved",
            "",
        ))
        .condition(Condition::new(
            condition_types::LOCATION_VERIFIED,
            ConditionStatus::True,
            "Verified",
            format!("location {} is available", location),
        ));
    next.failure_reason = None;
    next.failure_message = None;

    Ok(Outcome::requeue(Duration::from_secs(1)).with_status(next))
}
