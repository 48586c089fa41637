//! Pending phase handler
//!
//! A machine waits here until its cluster is Ready and its bootstrap data
//! exists. The datacenter is confirmed with the cloud before the create is
//! issued.

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::info;

use capic_common::crd::{
    condition_types, Condition, ConditionStatus, IonosCloudMachine, IonosCloudMachineStatus,
    MachinePhase,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, ErrorClass, Outcome};

use super::creating::{advance, issue_create, WAITING_FOR_BOOTSTRAP};
use super::{cloud_for, owning_cluster, waiting};
use crate::controller::Context;

/// Handle a machine in the Pending phase
pub async fn handle_pending(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let resource = resource_name(machine);
    let current = machine.status.clone().unwrap_or_default();

    machine.spec.validate(&resource)?;

    let cluster = match owning_cluster(machine, ctx).await? {
        Ok(cluster) => cluster,
        Err(missing) => return Ok(waiting(current, ctx, missing)),
    };
    if !cluster.status.as_ref().is_some_and(|s| s.ready) {
        return Ok(waiting(
            current,
            ctx,
            format!("waiting for IonosCloudCluster {} to be Ready", cluster.name_any()),
        ));
    }
    let Some(cloud) = cloud_for(machine, &cluster, ctx).await? else {
        return Ok(waiting(
            current,
            ctx,
            format!(
                "waiting for credentials Secret {}",
                cluster.spec.credentials_ref.name
            ),
        ));
    };

    let datacenter = &machine.spec.datacenter_id;
    match cloud.verify_datacenter(datacenter).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            return Err(Error::cloud(
                &resource,
                "verify_datacenter",
                ErrorClass::Permanent,
                format!("datacenter {} not found", datacenter),
            ));
        }
        Err(e) => return Err(e.into_error(&resource, "verify_datacenter")),
    }

    let Some(step) = issue_create(machine, ctx, cloud.as_ref()).await? else {
        return Ok(waiting(current, ctx, WAITING_FOR_BOOTSTRAP));
    };

    info!(datacenter = %datacenter, "server creation requested");
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::SERVER_CREATING,
            actions::PROVISION,
            Some(format!("Creating server in datacenter {}", datacenter)),
        )
        .await;

    let mut next = current
        .transition(MachinePhase::Creating)
        .observed(machine.metadata.generation)
        .condition(Condition::new(
            condition_types::SERVER_PROVISIONED,
            ConditionStatus::False,
            "Creating",
            "",
        ));
    next.failure_reason = None;
    next.failure_message = None;

    advance(machine, ctx, cloud.as_ref(), next, step).await
}
