//! Failed phase handler

use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::{debug, info};

use capic_common::crd::{IonosCloudMachine, IonosCloudMachineStatus, MachinePhase};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::object_ref;
use capic_common::{Error, Outcome};

use crate::controller::Context;

/// Handle a machine in the Failed phase
///
/// Nothing is retried until the spec changes. A reset starts over from
/// Pending with no recorded ids; a server or IP block that survived the
/// failure is adopted again by name.
pub async fn handle_failed(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let current = machine.status.clone().unwrap_or_default();
    let generation = machine.metadata.generation;

    if generation <= current.observed_generation {
        debug!(reason = ?current.failure_reason, "machine failed, waiting for a spec change");
        return Ok(Outcome::await_change());
    }

    info!(
        generation = ?generation,
        observed = ?current.observed_generation,
        "spec changed after failure, resetting machine"
    );
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::RESET,
            actions::RECONCILE,
            current.failure_reason.clone(),
        )
        .await;

    let next = IonosCloudMachineStatus::with_phase(MachinePhase::Pending).observed(generation);
    Ok(Outcome::requeue(Duration::from_secs(1)).with_status(next))
}
