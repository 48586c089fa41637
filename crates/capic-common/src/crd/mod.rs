//! Custom Resource Definitions served by the provider

mod cluster;
mod machine;
mod request;
mod types;

pub use cluster::{ClusterPhase, IonosCloudCluster, IonosCloudClusterSpec, IonosCloudClusterStatus};
pub use machine::{
    provider_id, DiskSpec, IonosCloudMachine, IonosCloudMachineSpec, IonosCloudMachineStatus,
    MachinePhase,
};
pub use request::{OperationKind, ProvisioningRequest, RequestState, ResourceKey, ResourceKind};
pub use types::{
    clear_condition, condition_types, find_condition, set_condition, ApiEndpoint, Condition,
    ConditionStatus, MachineAddress, MachineAddressType, SecretRef,
};
