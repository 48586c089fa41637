//! IonosCloudMachine Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::request::ProvisioningRequest;
use super::types::{condition_types, is_false, set_condition, Condition, ConditionStatus, MachineAddress};
use crate::outcome::ResourceStatus;
use crate::{Error, PROVIDER_ID_PREFIX};

/// Boot volume of a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Image id or alias to boot from
    pub image: String,
    /// Volume size in GB
    pub size_gb: u32,
}

/// Specification for an IonosCloudMachine
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "IonosCloudMachine",
    plural = "ionoscloudmachines",
    shortname = "icm",
    status = "IonosCloudMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IonosCloudMachineSpec {
    /// Datacenter the server is created in
    pub datacenter_id: String,

    /// Number of CPU cores
    pub num_cores: u32,

    /// Memory in MB (multiple of 256)
    pub memory_mb: u32,

    /// Boot volume
    pub disk: DiskSpec,

    /// LAN the NIC is attached to
    pub lan_id: u32,

    /// Availability zone of the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    /// Set by the provider once the server exists: `ionos://<serverId>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl IonosCloudMachineSpec {
    /// Validate the spec
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if self.datacenter_id.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.datacenterId",
                "datacenter id must not be empty",
            ));
        }
        if self.num_cores == 0 {
            return Err(Error::validation_for_field(
                resource,
                "spec.numCores",
                "numCores must be at least 1",
            ));
        }
        if self.memory_mb < 256 || self.memory_mb % 256 != 0 {
            return Err(Error::validation_for_field(
                resource,
                "spec.memoryMb",
                format!("memoryMb {} must be a positive multiple of 256", self.memory_mb),
            ));
        }
        if self.disk.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.disk.image",
                "disk image must not be empty",
            ));
        }
        if self.disk.size_gb == 0 {
            return Err(Error::validation_for_field(
                resource,
                "spec.disk.sizeGb",
                "disk size must be at least 1 GB",
            ));
        }
        Ok(())
    }
}

/// Format a provider id for a server
pub fn provider_id(server_id: &str) -> String {
    format!("{}{}", PROVIDER_ID_PREFIX, server_id)
}

/// Machine lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Waiting for the cluster and bootstrap data
    #[default]
    Pending,
    /// Server create request issued
    Creating,
    /// NIC attachment and IP reservation in progress
    NetworkAttaching,
    /// Addresses assigned, waiting for the node to join
    Bootstrapping,
    /// Node joined the cluster
    Running,
    /// Deletion requested, releasing cloud resources
    Deleting,
    /// All owned cloud resources released
    Deleted,
    /// Unrecoverable error; requires a spec change or deletion
    Failed,
}

impl MachinePhase {
    /// Position in the provisioning chain
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Creating => 1,
            Self::NetworkAttaching => 2,
            Self::Bootstrapping => 3,
            Self::Running => 4,
            Self::Deleting => 5,
            Self::Deleted => 6,
            Self::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Provisioning phases only move forward; Deleting is reachable from
    /// everything but Deleted, Failed from everything outside teardown.
    pub fn permits(&self, next: MachinePhase) -> bool {
        use MachinePhase::*;
        match (*self, next) {
            (a, b) if a == b => true,
            (Deleted, _) => false,
            (_, Deleting) => true,
            (Deleting, Deleted) => true,
            (Deleting, _) => false,
            (_, Deleted) => false,
            (_, Failed) => true,
            (Failed, _) => false,
            (a, b) => b.rank() >= a.rank(),
        }
    }

    /// Whether the machine is in teardown
    pub fn is_deleting(&self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::NetworkAttaching => write!(f, "NetworkAttaching"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Running => write!(f, "Running"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for an IonosCloudMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IonosCloudMachineStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase of the machine lifecycle
    #[serde(default)]
    pub phase: MachinePhase,

    /// Cluster API contract: infrastructure is ready
    #[serde(default, skip_serializing_if = "is_false")]
    pub ready: bool,

    /// Server id assigned by the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// NIC attached to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_id: Option<String>,

    /// IP block reserved for the machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block_id: Option<String>,

    /// Network addresses of the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Short cause of a permanent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Full description of a permanent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions representing the machine state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Outstanding cloud requests, keyed by operation kind
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provisioning_requests: BTreeMap<String, ProvisioningRequest>,
}

impl IonosCloudMachineStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: MachinePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Copy of this status moved to `phase`
    pub fn transition(&self, phase: MachinePhase) -> Self {
        Self {
            phase,
            message: None,
            ..self.clone()
        }
    }

    /// Set the message
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add or replace a condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Record the observed spec generation
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Move to Failed with the given cause
    pub fn failed(&self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        let reason = reason.into();
        let message = message.into();
        let mut next = self.transition(MachinePhase::Failed);
        next.ready = false;
        next.failure_reason = Some(reason.clone());
        next.failure_message = Some(message.clone());
        next.condition(Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "Failed",
            message,
        ))
        .message(reason)
    }

    /// Apply a proposed status on top of `current` unless it would move the
    /// phase backwards
    ///
    /// A proposal carrying a newer observed generation (a reset after a spec
    /// edit) is always accepted. Returns `None` when the proposal is stale.
    pub fn merge_forward(current: Option<&Self>, proposed: Self) -> Option<Self> {
        let Some(current) = current else {
            return Some(proposed);
        };
        let newer_generation = proposed.observed_generation > current.observed_generation
            && !current.phase.is_deleting();
        if newer_generation || current.phase.permits(proposed.phase) {
            Some(Self {
                provisioning_requests: current.provisioning_requests.clone(),
                ..proposed
            })
        } else {
            None
        }
    }
}

impl ResourceStatus for IonosCloudMachineStatus {
    fn set_message(&mut self, message: String) {
        self.message = Some(message);
    }

    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> IonosCloudMachineSpec {
        IonosCloudMachineSpec {
            datacenter_id: "dc-1".to_string(),
            num_cores: 2,
            memory_mb: 4096,
            disk: DiskSpec {
                image: "ubuntu-22.04".to_string(),
                size_gb: 20,
            },
            lan_id: 1,
            availability_zone: None,
            provider_id: None,
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().validate("default/m1").is_ok());
    }

    #[test]
    fn test_memory_must_be_multiple_of_256() {
        let mut s = spec();
        s.memory_mb = 1000;
        let err = s.validate("default/m1").expect_err("invalid memory");
        assert!(err.to_string().contains("multiple of 256"));
    }

    #[test]
    fn test_zero_cores_rejected() {
        let mut s = spec();
        s.num_cores = 0;
        assert!(s.validate("default/m1").is_err());
    }

    #[test]
    fn test_provider_id_format() {
        assert_eq!(provider_id("srv-1"), "ionos://srv-1");
    }

    /// Story: A stale reconcile pass must never regress a Running machine
    #[test]
    fn story_running_is_never_overwritten_by_creating() {
        let mut current = IonosCloudMachineStatus::with_phase(MachinePhase::Running);
        current.instance_id = Some("i1".to_string());
        let stale = IonosCloudMachineStatus::with_phase(MachinePhase::Creating);

        assert!(!MachinePhase::Running.permits(MachinePhase::Creating));
        assert!(IonosCloudMachineStatus::merge_forward(Some(&current), stale).is_none());
    }

    #[test]
    fn test_every_forward_step_is_permitted() {
        use MachinePhase::*;
        let chain = [Pending, Creating, NetworkAttaching, Bootstrapping, Running];
        for pair in chain.windows(2) {
            assert!(pair[0].permits(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].permits(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
        for phase in chain {
            assert!(phase.permits(Deleting));
            assert!(phase.permits(Failed));
        }
        assert!(Failed.permits(Deleting));
        assert!(!Deleting.permits(Failed));
        assert!(Deleting.permits(Deleted));
        assert!(!Deleted.permits(Pending));
    }

    #[test]
    fn test_reset_not_accepted_while_deleting() {
        let current = IonosCloudMachineStatus::with_phase(MachinePhase::Deleting).observed(Some(1));
        let reset = IonosCloudMachineStatus::with_phase(MachinePhase::Pending).observed(Some(2));
        assert!(IonosCloudMachineStatus::merge_forward(Some(&current), reset).is_none());
    }

    #[test]
    fn test_merge_keeps_request_ledger_of_current() {
        let mut current = IonosCloudMachineStatus::with_phase(MachinePhase::Creating);
        current.provisioning_requests.insert(
            "CreateServer".to_string(),
            ProvisioningRequest::new(
                crate::crd::ResourceKey::machine("default", "m1"),
                crate::crd::OperationKind::CreateServer,
                "req-1",
                None,
            ),
        );
        let proposed = IonosCloudMachineStatus::with_phase(MachinePhase::Creating);
        let merged = IonosCloudMachineStatus::merge_forward(Some(&current), proposed).expect("accepted");
        assert!(merged.provisioning_requests.contains_key("CreateServer"));
    }

    #[test]
    fn test_failed_sets_reason_and_ready_condition() {
        let status = IonosCloudMachineStatus::with_phase(MachinePhase::Creating)
            .failed("image not found", "create_server failed: image not found");
        assert_eq!(status.phase, MachinePhase::Failed);
        assert_eq!(status.failure_reason.as_deref(), Some("image not found"));
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::False);
    }
}
