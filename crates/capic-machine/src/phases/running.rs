//! Running phase handler
//!
//! Periodically confirms the server still exists. A server that vanished
//! outside of the provider fails the machine; it is not re-created.

use kube::runtime::events::EventType;
use tracing::{debug, warn};

use capic_common::crd::{IonosCloudMachine, IonosCloudMachineStatus};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, ErrorClass, Outcome};

use super::{cloud_access, Access};
use crate::controller::Context;

/// Handle a machine in the Running phase
pub async fn handle_running(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let resource = resource_name(machine);
    let current = machine.status.clone().unwrap_or_default();
    let Some(server_id) = current.instance_id.clone() else {
        return Ok(Outcome::requeue(ctx.config.ready_resync));
    };

    let cloud = match cloud_access(machine, ctx).await? {
        Access::Granted(access) => access.cloud,
        Access::Missing(missing) => {
            debug!(reason = %missing, "skipping drift check");
            return Ok(Outcome::requeue(ctx.config.ready_resync));
        }
    };

    match cloud
        .describe_server(&machine.spec.datacenter_id, &server_id)
        .await
    {
        Ok(server) => {
            debug!(server = %server.id, state = ?server.state, "server present");
            Ok(Outcome::requeue(ctx.config.ready_resync))
        }
        Err(e) if e.is_not_found() => {
            warn!(server = %server_id, "server deleted outside of the provider");
            ctx.events
                .publish(
                    &object_ref(machine),
                    EventType::Warning,
                    reasons::EXTERNAL_DELETION,
                    actions::RECONCILE,
                    Some(format!("Server {} no longer exists", server_id)),
                )
                .await;
            Err(Error::external_deletion(resource, server_id))
        }
        Err(e) if e.class == ErrorClass::Transient => Err(e.into_error(&resource, "describe_server")),
        Err(e) => {
            warn!(error = %e, "drift check rejected, retrying at next resync");
            Ok(Outcome::requeue(ctx.config.ready_resync))
        }
    }
}
