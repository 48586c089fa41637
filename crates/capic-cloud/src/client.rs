//! The provisioning client seam
//!
//! Reconcilers only see these traits. Mutations return a [`MutationOutcome`];
//! deduplication of repeated calls is the request tracker's job, not the
//! client's.

use std::sync::Arc;

use async_trait::async_trait;
use capic_common::credentials::CloudCredentials;

use crate::error::CloudResult;
use crate::types::{
    IpBlockInfo, IpBlockSpec, MutationOutcome, NicSpec, RequestStatus, ServerInfo, ServerSpec,
};

/// Cloud operations used by the reconcilers
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create a server with its boot volume
    async fn create_server(&self, spec: &ServerSpec) -> CloudResult<MutationOutcome>;

    /// Look a server up by its (deterministic) name
    async fn find_server_by_name(
        &self,
        datacenter_id: &str,
        name: &str,
    ) -> CloudResult<Option<ServerInfo>>;

    /// Observed state of a server; NotFound when it does not exist
    async fn describe_server(&self, datacenter_id: &str, server_id: &str) -> CloudResult<ServerInfo>;

    /// Delete a server and its volumes
    async fn delete_server(&self, datacenter_id: &str, server_id: &str)
        -> CloudResult<MutationOutcome>;

    /// Attach a NIC to a server
    async fn attach_nic(
        &self,
        datacenter_id: &str,
        server_id: &str,
        nic: &NicSpec,
    ) -> CloudResult<MutationOutcome>;

    /// Reserve an IP block
    async fn allocate_ip(&self, block: &IpBlockSpec) -> CloudResult<MutationOutcome>;

    /// Observed state of an IP block; NotFound when it does not exist
    async fn describe_ip_block(&self, ip_block_id: &str) -> CloudResult<IpBlockInfo>;

    /// Look an IP block up by its (deterministic) name within a location
    async fn find_ip_block_by_name(
        &self,
        location: &str,
        name: &str,
    ) -> CloudResult<Option<IpBlockInfo>>;

    /// Release an IP block
    async fn release_ip(&self, ip_block_id: &str) -> CloudResult<MutationOutcome>;

    /// Status of an asynchronous request; NotFound for unknown ids
    async fn request_status(&self, request_id: &str) -> CloudResult<RequestStatus>;

    /// Confirm that a location exists and is usable
    async fn verify_location(&self, location: &str) -> CloudResult<()>;

    /// Confirm that a datacenter exists and is accessible
    async fn verify_datacenter(&self, datacenter_id: &str) -> CloudResult<()>;
}

/// Builds clients from resolved credentials
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait CloudClientFactory: Send + Sync {
    /// Create a client authenticated with `credentials`
    fn build(&self, credentials: &CloudCredentials) -> CloudResult<Arc<dyn CloudClient>>;
}
