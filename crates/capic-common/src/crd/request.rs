//! Persisted form of tracked cloud requests
//!
//! Entries live in `status.provisioningRequests` of the resource that issued
//! them, keyed by operation kind, so at most one outstanding request exists
//! per resource and kind.

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ErrorClass, ReconcileConfig};

/// Which resource type issued a request
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// IonosCloudCluster
    Cluster,
    /// IonosCloudMachine
    Machine,
}

/// Identity of the resource a request belongs to
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// Resource type
    pub kind: ResourceKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ResourceKey {
    /// Key of an IonosCloudMachine
    pub fn machine(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Machine,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an IonosCloudCluster
    pub fn cluster(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Cluster,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Machine => "machine",
        };
        write!(f, "{}/{}/{}", kind, self.namespace, self.name)
    }
}

/// Cloud mutation being tracked
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    /// Create the VM
    CreateServer,
    /// Attach a NIC to the VM
    #[serde(rename = "AttachNIC")]
    AttachNic,
    /// Reserve an IP block
    #[serde(rename = "AllocateIP")]
    AllocateIp,
    /// Delete the VM
    DeleteServer,
    /// Release an IP block
    #[serde(rename = "ReleaseIP")]
    ReleaseIp,
}

impl OperationKind {
    /// All kinds, in issue order
    pub const ALL: [OperationKind; 5] = [
        OperationKind::CreateServer,
        OperationKind::AttachNic,
        OperationKind::AllocateIp,
        OperationKind::DeleteServer,
        OperationKind::ReleaseIp,
    ];

    /// Stable name, also used as the ledger map key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateServer => "CreateServer",
            Self::AttachNic => "AttachNIC",
            Self::AllocateIp => "AllocateIP",
            Self::DeleteServer => "DeleteServer",
            Self::ReleaseIp => "ReleaseIP",
        }
    }

    /// Whether the operation creates cloud resources (as opposed to removing them)
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::CreateServer | Self::AttachNic | Self::AllocateIp
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind: {s}"))
    }
}

/// Last observed state of a tracked request
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RequestState {
    /// Queued or running on the cloud side
    #[default]
    Pending,
    /// Completed successfully
    Succeeded,
    /// Completed with an error
    Failed,
}

impl RequestState {
    /// Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Handle for one outstanding asynchronous cloud mutation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    /// Resource that issued the request
    pub resource_key: ResourceKey,
    /// Mutation being tracked
    pub operation_kind: OperationKind,
    /// Cloud-side request id (empty for synchronously completed mutations)
    #[serde(default)]
    pub cloud_request_id: String,
    /// Cloud resource the request creates or acts on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// State seen on the last poll
    #[serde(default)]
    pub last_observed_state: RequestState,
    /// Failure classification, set when the request failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<ErrorClass>,
    /// Failure message reported by the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// When the request was issued
    pub created_at: DateTime<Utc>,
    /// When the request was last polled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Number of polls so far
    #[serde(default)]
    pub poll_count: u32,
}

impl ProvisioningRequest {
    /// New pending request issued now
    pub fn new(
        resource_key: ResourceKey,
        operation_kind: OperationKind,
        cloud_request_id: impl Into<String>,
        target_id: Option<String>,
    ) -> Self {
        Self {
            resource_key,
            operation_kind,
            cloud_request_id: cloud_request_id.into(),
            target_id,
            last_observed_state: RequestState::Pending,
            failure_class: None,
            failure_message: None,
            created_at: Utc::now(),
            last_polled_at: None,
            poll_count: 0,
        }
    }

    /// Whether the last observed state is Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        self.last_observed_state.is_terminal()
    }

    /// Whether this request is still pending and older than `threshold`
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        age.to_std().map(|age| age > threshold).unwrap_or(false)
    }

    /// Delay until the next poll, and whether the request has gone stale
    ///
    /// Stale requests are polled on the backoff schedule instead of the
    /// regular poll interval.
    pub fn next_poll(&self, config: &ReconcileConfig, now: DateTime<Utc>) -> (Duration, bool) {
        if self.is_stale(config.staleness_threshold, now) {
            (config.backoff.delay_for(self.poll_count), true)
        } else {
            (config.poll_interval, false)
        }
    }
}
