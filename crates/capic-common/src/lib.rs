//! Common types for capic: CRDs, errors, and controller utilities
//!
//! Everything the cluster and machine controllers share lives here: the
//! resource definitions, the error taxonomy the reconcilers branch on,
//! backoff/configuration, logging setup, Kubernetes events, finalizer and
//! status-write helpers, credential parsing, and the teardown coordinator.

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod outcome;
pub mod retry;
pub mod teardown;
pub mod telemetry;

pub use config::{BackoffConfig, ReconcileConfig};
pub use error::{Error, ErrorClass};
pub use outcome::{Outcome, ResourceStatus};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer claimed on IonosCloudCluster resources
pub const CLUSTER_FINALIZER: &str = "ionoscloudcluster.infrastructure.cluster.x-k8s.io";

/// Finalizer claimed on IonosCloudMachine resources
pub const MACHINE_FINALIZER: &str = "ionoscloudmachine.infrastructure.cluster.x-k8s.io";

/// Label linking machines (and CAPI objects) to the cluster they belong to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Field manager used for every patch issued by the provider
pub const FIELD_MANAGER: &str = "capic-controller";

/// Prefix of `spec.providerID` values written to machines
pub const PROVIDER_ID_PREFIX: &str = "ionos://";

/// Default port of a derived control-plane endpoint
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Namespaced name of an IonosCloudCluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// Namespace of the IonosCloudCluster
    pub namespace: String,
    /// Name of the IonosCloudCluster
    pub name: String,
}

impl ClusterKey {
    /// Create a new cluster key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
