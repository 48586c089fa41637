//! Bootstrapping phase handler

use kube::runtime::events::EventType;
use tracing::{debug, info};

use capic_common::crd::{
    condition_types, Condition, ConditionStatus, IonosCloudMachine, IonosCloudMachineStatus,
    MachinePhase,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::object_ref;
use capic_common::{Error, Outcome};

use crate::controller::Context;

const WAITING_FOR_NODE: &str = "waiting for the node to join the cluster";

/// Handle a machine in the Bootstrapping phase
///
/// The machine is Running once its owning Machine reports a node reference.
pub async fn handle_bootstrapping(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let current = machine.status.clone().unwrap_or_default();

    if !ctx.kube.bootstrap_complete(machine).await? {
        debug!("node has not joined yet");
        return Ok(Outcome::requeue(ctx.config.waiting_interval)
            .with_status(current.message(WAITING_FOR_NODE)));
    }

    info!("node joined, machine running");
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::MACHINE_RUNNING,
            actions::PROVISION,
            None,
        )
        .await;

    let mut next = current
        .transition(MachinePhase::Running)
        .condition(Condition::new(
            condition_types::BOOTSTRAPPED,
            ConditionStatus::True,
            "NodeJoined",
            "",
        ))
        .condition(Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "Running",
            "",
        ));
    next.ready = true;
    Ok(Outcome::requeue(ctx.config.ready_resync).with_status(next))
}
