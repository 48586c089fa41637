//! Create-or-adopt helpers
//!
//! Servers and IP blocks carry deterministic names. Before issuing a create
//! these helpers look for an existing resource with that name, so a create
//! that succeeded before its request was recorded is adopted instead of
//! duplicated.

use tracing::info;

use crate::client::CloudClient;
use crate::error::CloudResult;
use crate::types::{IpBlockSpec, MutationOutcome, ServerSpec};

/// Adopt the server named `spec.name`, or create it
pub async fn ensure_server(cloud: &dyn CloudClient, spec: &ServerSpec) -> CloudResult<MutationOutcome> {
    if let Some(existing) = cloud
        .find_server_by_name(&spec.datacenter_id, &spec.name)
        .await?
    {
        info!(server = %existing.id, name = %spec.name, "Adopting existing server");
        return Ok(MutationOutcome::Completed {
            resource_id: Some(existing.id),
        });
    }
    cloud.create_server(spec).await
}

/// Adopt the IP block named `spec.name`, or reserve it
pub async fn ensure_ip_block(
    cloud: &dyn CloudClient,
    spec: &IpBlockSpec,
) -> CloudResult<MutationOutcome> {
    if let Some(existing) = cloud
        .find_ip_block_by_name(&spec.location, &spec.name)
        .await?
    {
        info!(ip_block = %existing.id, name = %spec.name, "Adopting existing IP block");
        return Ok(MutationOutcome::Completed {
            resource_id: Some(existing.id),
        });
    }
    cloud.allocate_ip(spec).await
}
