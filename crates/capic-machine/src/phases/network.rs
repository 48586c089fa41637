//! NetworkAttaching phase handler
//!
//! Attaches a DHCP NIC on the machine's LAN and reserves a single-address IP
//! block in the cluster location. Both requests are driven concurrently; the
//! machine moves to Bootstrapping once both have landed and it has at least
//! one address.

use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::{debug, info};

use capic_cloud::{ensure_ip_block, IpBlockSpec, NicSpec, ServerInfo};
use capic_common::crd::{
    clear_condition, condition_types, Condition, ConditionStatus, IonosCloudMachine,
    IonosCloudMachineStatus, MachineAddress, MachinePhase, OperationKind, ProvisioningRequest,
};
use capic_common::events::{actions, reasons};
use capic_common::kube_utils::{object_ref, resource_name};
use capic_common::{Error, Outcome};
use capic_tracker::Step;

use super::{cloud_access, cloud_name, in_flight, nic_name, request_key, settle_all, waiting, Access};
use crate::controller::Context;

/// Handle a machine in the NetworkAttaching phase
pub async fn handle_network(
    machine: &IonosCloudMachine,
    ctx: &Context,
) -> Result<Outcome<IonosCloudMachineStatus>, Error> {
    let resource = resource_name(machine);
    let current = machine.status.clone().unwrap_or_default();
    let Some(server_id) = current.instance_id.clone() else {
        return Err(Error::internal_with_context(
            resource,
            "network attachment without a recorded server",
        ));
    };
    let access = match cloud_access(machine, ctx).await? {
        Access::Granted(access) => access,
        Access::Missing(missing) => return Ok(waiting(current, ctx, missing)),
    };
    let cloud = access.cloud.as_ref();
    let datacenter = machine.spec.datacenter_id.as_str();
    let key = request_key(machine);

    let server = match cloud.describe_server(datacenter, &server_id).await {
        Ok(server) => server,
        Err(e) if e.is_not_found() => return Err(Error::external_deletion(resource, server_id)),
        Err(e) => return Err(e.into_error(&resource, "describe_server")),
    };

    let nic_spec = NicSpec {
        name: nic_name(machine),
        lan_id: machine.spec.lan_id,
        dhcp: true,
    };
    let attached = current
        .nic_id
        .clone()
        .or_else(|| attached_nic(&server, &nic_spec.name));
    if attached.is_none()
        && server.is_busy()
        && ctx.tracker.lookup(&key, OperationKind::AttachNic).await?.is_none()
    {
        debug!(server = %server_id, "server busy, deferring NIC attachment");
        return Ok(Outcome::requeue(ctx.config.poll_interval)
            .with_status(current.message("waiting for the server to become available")));
    }

    let ip_spec = IpBlockSpec {
        name: cloud_name(machine),
        location: access.cluster.spec.location.clone(),
        size: 1,
    };

    let nic = async {
        if let Some(id) = attached.clone() {
            return Ok(Step::Done {
                resource_id: Some(id),
            });
        }
        ctx.tracker
            .drive(cloud, &key, OperationKind::AttachNic, || {
                cloud.attach_nic(datacenter, &server_id, &nic_spec)
            })
            .await
    };
    let ip = async {
        if let Some(id) = current.ip_block_id.clone() {
            return Ok(Step::Done {
                resource_id: Some(id),
            });
        }
        ctx.tracker
            .drive(cloud, &key, OperationKind::AllocateIp, || {
                ensure_ip_block(cloud, &ip_spec)
            })
            .await
    };
    let (nic, ip) = tokio::join!(nic, ip);

    let mut status = current.clone();
    let mut settled = Vec::new();
    let mut pending: Option<ProvisioningRequest> = None;

    match nic? {
        Step::Done {
            resource_id: Some(id),
        } => {
            status.nic_id = Some(id);
            settled.push(OperationKind::AttachNic);
        }
        Step::Done { resource_id: None } => {
            ctx.tracker.clear(&key, OperationKind::AttachNic).await?;
            return Err(Error::internal_with_context(
                resource,
                "NIC request succeeded without a NIC id",
            ));
        }
        Step::Waiting { request } => pending = Some(request),
    }
    match ip? {
        Step::Done {
            resource_id: Some(id),
        } => {
            status.ip_block_id = Some(id);
            settled.push(OperationKind::AllocateIp);
        }
        Step::Done { resource_id: None } => {
            ctx.tracker.clear(&key, OperationKind::AllocateIp).await?;
            return Err(Error::internal_with_context(
                resource,
                "IP block request succeeded without a block id",
            ));
        }
        Step::Waiting { request } => pending = pending.or(Some(request)),
    }

    if let Some(request) = pending {
        let outcome = in_flight(machine, ctx, status, &request, "attaching network").await;
        return Ok(settle_all(outcome, settled));
    }

    let block_id = status.ip_block_id.clone().unwrap_or_default();
    let block = match cloud.describe_ip_block(&block_id).await {
        Ok(block) => block,
        Err(e) if e.is_not_found() => return Err(Error::external_deletion(resource, block_id)),
        Err(e) => return Err(e.into_error(&resource, "describe_ip_block")),
    };

    let addresses = addresses(&server, status.nic_id.as_deref(), &block.ips);
    if addresses.is_empty() {
        debug!(ip_block = %block.id, "no address assigned yet");
        let outcome = Outcome::requeue(ctx.config.poll_interval)
            .with_status(status.message("waiting for addresses"));
        return Ok(settle_all(outcome, settled));
    }

    info!(addresses = ?addresses, "network attached");
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Normal,
            reasons::BOOTSTRAPPING,
            actions::PROVISION,
            Some(format!("Network attached to server {}", server_id)),
        )
        .await;

    // Infrastructure is ready from here on; the node joining is tracked separately
    let mut next = status
        .transition(MachinePhase::Bootstrapping)
        .condition(Condition::new(
            condition_types::NETWORK_ATTACHED,
            ConditionStatus::True,
            "Attached",
            "",
        ))
        .condition(Condition::new(
            condition_types::BOOTSTRAPPED,
            ConditionStatus::False,
            "WaitingForNode",
            "",
        ));
    clear_condition(&mut next.conditions, condition_types::REQUEST_STALE);
    next.addresses = addresses;
    next.ready = true;

    let outcome = Outcome::requeue(Duration::from_secs(1)).with_status(next);
    Ok(settle_all(
        outcome,
        [OperationKind::AttachNic, OperationKind::AllocateIp],
    ))
}

fn attached_nic(server: &ServerInfo, name: &str) -> Option<String> {
    server
        .nics
        .iter()
        .find(|nic| nic.name == name)
        .map(|nic| nic.id.clone())
}

/// LAN addresses of the machine's NIC followed by its reserved addresses
fn addresses(server: &ServerInfo, nic_id: Option<&str>, reserved: &[String]) -> Vec<MachineAddress> {
    let mut addresses: Vec<MachineAddress> = server
        .nics
        .iter()
        .filter(|nic| Some(nic.id.as_str()) == nic_id)
        .flat_map(|nic| nic.ips.iter().map(MachineAddress::internal))
        .collect();
    for ip in reserved {
        if !addresses.iter().any(|a| &a.address == ip) {
            addresses.push(MachineAddress::external(ip));
        }
    }
    addresses
}
