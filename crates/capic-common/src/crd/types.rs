//! Types shared by the IonosCloudCluster and IonosCloudMachine resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known condition types
pub mod condition_types {
    /// Overall readiness of the resource
    pub const READY: &str = "Ready";
    /// Credentials Secret resolved and parsed
    pub const CREDENTIALS_RESOLVED: &str = "CredentialsResolved";
    /// Target location (or datacenter) confirmed by the cloud
    pub const LOCATION_VERIFIED: &str = "LocationVerified";
    /// Control-plane endpoint known and published
    pub const ENDPOINT_PUBLISHED: &str = "EndpointPublished";
    /// Server exists in the cloud
    pub const SERVER_PROVISIONED: &str = "ServerProvisioned";
    /// NIC attached and IP reserved
    pub const NETWORK_ATTACHED: &str = "NetworkAttached";
    /// Node registered with the workload cluster
    pub const BOOTSTRAPPED: &str = "Bootstrapped";
    /// A tracked cloud request has exceeded the staleness threshold
    pub const REQUEST_STALE: &str = "RequestStale";
    /// Last reconcile hit a transient error
    pub const DEGRADED: &str = "Degraded";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, NetworkAttached)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace the condition of the same type
///
/// The transition time of the existing condition is kept when its status
/// does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Remove a condition by type
pub fn clear_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Host/port pair where the workload cluster's API server is reachable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Hostname or IP address; empty means "derive one"
    #[serde(default)]
    pub host: String,
    /// Port; 0 means the default API server port
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether a host has been supplied
    pub fn is_set(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Port with the default applied
    pub fn effective_port(&self) -> i32 {
        if self.port > 0 {
            self.port
        } else {
            i32::from(crate::DEFAULT_API_SERVER_PORT)
        }
    }
}

impl std::fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.effective_port())
    }
}

/// Reference to a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

/// Kind of a machine address, as understood by Cluster API
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// Address reachable inside the LAN
    InternalIP,
    /// Publicly reachable address
    ExternalIP,
    /// Hostname
    Hostname,
}

/// One network address of a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    /// The address
    pub address: String,
}

impl MachineAddress {
    /// Internal (LAN) address
    pub fn internal(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::InternalIP,
            address: address.into(),
        }
    }

    /// External (reserved) address
    pub fn external(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::ExternalIP,
            address: address.into(),
        }
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}
