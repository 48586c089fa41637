//! Request and response types of the provisioning client

/// Desired server, as sent to `create_server`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
    /// Deterministic server name, used for adoption after a crash
    pub name: String,
    /// Datacenter to create the server in
    pub datacenter_id: String,
    /// CPU cores
    pub cores: u32,
    /// Memory in MB
    pub ram_mb: u32,
    /// Availability zone, `AUTO` when unset
    pub availability_zone: Option<String>,
    /// Boot image id or alias
    pub image: String,
    /// Boot volume size in GB
    pub disk_size_gb: u32,
    /// Base64-encoded cloud-init user data
    pub user_data: Option<String>,
}

/// Lifecycle state of a cloud resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// A request is currently modifying the resource
    Busy,
    /// Ready for use
    Available,
    /// Exists but stopped or deactivated
    Inactive,
    /// Being removed
    Deprovisioning,
    /// Anything the client does not know about
    Unknown,
}

impl ResourceState {
    /// Parse the platform's `metadata.state` value
    pub fn parse(state: &str) -> Self {
        match state {
            "BUSY" => Self::Busy,
            "AVAILABLE" => Self::Available,
            "INACTIVE" => Self::Inactive,
            "DEPROVISIONING" => Self::Deprovisioning,
            _ => Self::Unknown,
        }
    }
}

/// NIC attached to a server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicInfo {
    /// NIC id
    pub id: String,
    /// NIC name
    pub name: String,
    /// LAN the NIC is connected to
    pub lan_id: u32,
    /// IPs assigned to the NIC
    pub ips: Vec<String>,
}

/// Observed server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server id
    pub id: String,
    /// Server name
    pub name: String,
    /// Resource state
    pub state: ResourceState,
    /// Hypervisor state (`RUNNING`, `SHUTOFF`, ...)
    pub vm_state: Option<String>,
    /// Attached NICs
    pub nics: Vec<NicInfo>,
}

impl ServerInfo {
    /// Whether a request is still working on the server
    pub fn is_busy(&self) -> bool {
        self.state == ResourceState::Busy
    }
}

/// NIC to attach
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicSpec {
    /// NIC name
    pub name: String,
    /// LAN to connect to
    pub lan_id: u32,
    /// Obtain the address via DHCP
    pub dhcp: bool,
}

/// IP block to reserve
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpBlockSpec {
    /// Deterministic block name, used for adoption after a crash
    pub name: String,
    /// Location the block is reserved in
    pub location: String,
    /// Number of addresses
    pub size: u32,
}

/// Observed IP block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpBlockInfo {
    /// Block id
    pub id: String,
    /// Block name
    pub name: String,
    /// Location
    pub location: String,
    /// Reserved addresses
    pub ips: Vec<String>,
    /// Resource state
    pub state: ResourceState,
}

/// Status of an asynchronous cloud request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Accepted, not started
    Queued,
    /// Being executed
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed {
        /// Message reported by the platform
        message: String,
    },
}

impl RequestStatus {
    /// Map the platform's status string and message
    pub fn parse(status: &str, message: Option<&str>) -> Self {
        match status {
            "QUEUED" => Self::Queued,
            "RUNNING" => Self::Running,
            "DONE" => Self::Done,
            _ => Self::Failed {
                message: message
                    .filter(|m| !m.is_empty())
                    .unwrap_or("request failed without a message")
                    .to_string(),
            },
        }
    }
}

/// Result of a mutating call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Accepted for asynchronous execution; poll `request_id`
    Accepted {
        /// Cloud request id
        request_id: String,
        /// Resource created or acted on, when the platform reports it up front
        resource_id: Option<String>,
    },
    /// Already finished
    Completed {
        /// Resource created or acted on
        resource_id: Option<String>,
    },
}

impl MutationOutcome {
    /// Resource id carried by either variant
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::Accepted { resource_id, .. } | Self::Completed { resource_id } => {
                resource_id.as_deref()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_status_parsing() {
        assert_eq!(RequestStatus::parse("QUEUED", None), RequestStatus::Queued);
        assert_eq!(RequestStatus::parse("RUNNING", None), RequestStatus::Running);
        assert_eq!(RequestStatus::parse("DONE", Some("ok")), RequestStatus::Done);
        assert_eq!(
            RequestStatus::parse("FAILED", Some("image not found")),
            RequestStatus::Failed {
                message: "image not found".to_string()
            }
        );
        assert!(matches!(
            RequestStatus::parse("FAILED", Some("")),
            RequestStatus::Failed { .. }
        ));
    }

    #[test]
    fn test_resource_state_parsing() {
        assert_eq!(ResourceState::parse("BUSY"), ResourceState::Busy);
        assert_eq!(ResourceState::parse("AVAILABLE"), ResourceState::Available);
        assert_eq!(ResourceState::parse("weird"), ResourceState::Unknown);
    }

    #[test]
    fn test_outcome_resource_id() {
        let accepted = MutationOutcome::Accepted {
            request_id: "r".to_string(),
            resource_id: Some("srv".to_string()),
        };
        assert_eq!(accepted.resource_id(), Some("srv"));
        assert_eq!(MutationOutcome::Completed { resource_id: None }.resource_id(), None);
    }
}
