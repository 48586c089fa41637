//! Creating phase handler
//!
//! Polls the outstanding create request. Once the server id is known it is
//! recorded in status and as `spec.providerId`, and the machine moves on to
//! network attachment.

use std::time::Duration;

use base64::prelude::*;
use kube::runtime::events::EventType;
use tracing::info;

use capic_cloud::{ensure_server, CloudClient, ServerSpec};
use capic_common::crd::{
    clear_condition, condition_types, provider_id, Condition, ConditionStatus, IonosCloudMachine,
    IonosCloudMachineStatus, MachinePhase, OperationKind,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, Outcome};
use capic_tracker::Step;

use super::{cloud_access, cloud_name, in_flight, request_key, waiting, Access};
use crate::controller::Context;

pub(crate) const WAITING_FOR_BOOTSTRAP: &str = "waiting for bootstrap data";

/// Handle a machine in the Creating phase
pub async fn handle_creating(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let current = machine.status.clone().unwrap_or_default();
    let cloud = match cloud_access(machine, ctx).await? {
        Access::Granted(access) => access.cloud,
        Access::Missing(missing) => return Ok(waiting(current, ctx, missing)),
    };

    let key = request_key(machine);
    let step = match ctx.tracker.lookup(&key, OperationKind::CreateServer).await? {
        Some(request) => ctx.tracker.resolve(cloud.as_ref(), &request).await?,
        None => match current.instance_id.clone() {
            Some(id) => Step::Done {
                resource_id: Some(id),
            },
            // Request lost after a failure was cleared: adopt by name or create again
            None => match issue_create(machine, ctx, cloud.as_ref()).await? {
                Some(step) => step,
                None => return Ok(waiting(current, ctx, WAITING_FOR_BOOTSTRAP)),
            },
        },
    };

    advance(machine, ctx, cloud.as_ref(), current, step).await
}

/// Submit-or-find the create request; `None` while bootstrap data is missing
pub(crate) async fn issue_create(
    machine: &IonosCloudMachine,
    ctx: &Context,
    cloud: &dyn CloudClient,
) -> Result<Option<Step>, Error> {
    let Some(user_data) = ctx.kube.bootstrap_data(machine).await? else {
        return Ok(None);
    };
    let spec = server_spec(machine, &user_data);
    let step = ctx
        .tracker
        .drive(cloud, &request_key(machine), OperationKind::CreateServer, || {
            ensure_server(cloud, &spec)
        })
        .await?;
    Ok(Some(step))
}

fn server_spec(machine: &IonosCloudMachine, user_data: &str) -> ServerSpec {
    let spec = &machine.spec;
    ServerSpec {
        name: cloud_name(machine),
        datacenter_id: spec.datacenter_id.clone(),
        cores: spec.num_cores,
        ram_mb: spec.memory_mb,
        availability_zone: spec.availability_zone.clone(),
        image: spec.disk.image.clone(),
        disk_size_gb: spec.disk.size_gb,
        user_data: Some(BASE64_STANDARD.encode(user_data)),
    }
}

/// Turn the state of the create request into the next status
pub(crate) async fn advance(
    machine: &IonosCloudMachine,
    ctx: &Context,
    cloud: &dyn CloudClient,
    status: IonosCloudMachineStatus,
    step: Step,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let resource = resource_name(machine);
    let server_id = match step {
        Step::Waiting { request } => {
            return Ok(in_flight(machine, ctx, status, &request, "creating server").await);
        }
        Step::Done {
            resource_id: Some(id),
        } => id,
        Step::Done { resource_id: None } => {
            let found = cloud
                .find_server_by_name(&machine.spec.datacenter_id, &cloud_name(machine))
                .await
                .map_err(|e| e.into_error(&resource, "find_server_by_name"))?;
            match found {
                Some(server) => server.id,
                None => {
                    ctx.tracker
                        .clear(&request_key(machine), OperationKind::CreateServer)
                        .await?;
                    return Err(Error::internal_with_context(
                        resource,
                        "server request succeeded without a server id",
                    ));
                }
            }
        }
    };

    let generation = ctx
        .kube
        .set_provider_id(machine, &provider_id(&server_id))
        .await?;
    info!(server = %server_id, "server created");
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::NETWORK_ATTACHING,
            actions::PROVISION,
            Some(format!("Server {} created, attaching network", server_id)),
        )
        .await;

    let mut next = status
        .transition(MachinePhase::NetworkAttaching)
        .observed(generation.or(machine.metadata.generation))
        .condition(Condition::new(
            condition_types::SERVER_PROVISIONED,
            ConditionStatus::True,
            "Created",
            format!("server {}", server_id),
        ));
    clear_condition(&mut next.conditions, condition_types::REQUEST_STALE);
    next.instance_id = Some(server_id);

    Ok(Outcome::requeue(Duration::from_secs(1))
        .with_status(next)
        .settle(OperationKind::CreateServer))
}
