//! IonosCloudCluster Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::request::ProvisioningRequest;
use super::types::{condition_types, is_false, set_condition, ApiEndpoint, Condition, ConditionStatus, SecretRef};
use crate::outcome::ResourceStatus;
use crate::Error;

/// Specification for an IonosCloudCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "IonosCloudCluster",
    plural = "ionoscloudclusters",
    shortname = "icc",
    status = "IonosCloudClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IonosCloudClusterSpec {
    /// Cloud location of the cluster's resources, e.g. `de/txl`
    pub location: String,

    /// API server endpoint; an empty host asks the provider to reserve one
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Secret holding the cloud API credentials
    pub credentials_ref: SecretRef,

    /// Contract number for accounts with multiple contracts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_number: Option<String>,
}

impl IonosCloudClusterSpec {
    /// Validate the spec
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        let location = self.location.trim();
        if location.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.location",
                "location must not be empty",
            ));
        }
        if location.split('/').count() != 2 || location.split('/').any(|p| p.is_empty()) {
            return Err(Error::validation_for_field(
                resource,
                "spec.location",
                format!("location '{}' must have the form <country>/<city>", location),
            ));
        }
        if self.credentials_ref.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.credentialsRef.name",
                "credentials secret name must not be empty",
            ));
        }
        let port = self.control_plane_endpoint.port;
        if !(0..=65535).contains(&port) {
            return Err(Error::validation_for_field(
                resource,
                "spec.controlPlaneEndpoint.port",
                format!("port {} is out of range", port),
            ));
        }
        Ok(())
    }
}

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Waiting for credentials and location to be validated
    #[default]
    Pending,
    /// Control-plane endpoint is being published
    Provisioning,
    /// Endpoint and credentials resolved
    Ready,
    /// Deletion requested, waiting for machines and releasing resources
    Deleting,
    /// All owned cloud resources released
    Deleted,
    /// Unrecoverable error; requires a spec change
    Failed,
}

impl ClusterPhase {
    /// Position in the lifecycle; higher ranks are never overwritten by lower ones
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Provisioning => 1,
            Self::Ready => 2,
            Self::Deleting => 3,
            Self::Deleted => 4,
            Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn permits(&self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
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

    /// Ready, Deleted or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Deleted | Self::Failed)
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for an IonosCloudCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IonosCloudClusterStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Cluster API contract: infrastructure is ready
    #[serde(default, skip_serializing_if = "is_false")]
    pub ready: bool,

    /// Published API server endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// IP block reserved for a derived endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ip_block_id: Option<String>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Short cause of a permanent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Full description of a permanent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Outstanding cloud requests, keyed by operation kind
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provisioning_requests: BTreeMap<String, ProvisioningRequest>,
}

impl IonosCloudClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Copy of this status moved to `phase`
    pub fn transition(&self, phase: ClusterPhase) -> Self {
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
        let mut next = self.transition(ClusterPhase::Failed);
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
        let newer_generation = proposed.observed_generation > current.observed_generation;
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

impl ResourceStatus for IonosCloudClusterStatus {
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
