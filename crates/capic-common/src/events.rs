//! Kubernetes Event recording for the capic controllers
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events on provider resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Cluster credentials and location were validated
    pub const CLUSTER_PROVISIONING: &str = "ClusterProvisioning";
    /// Control-plane endpoint published, cluster Ready
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Cluster deletion is waiting on machines
    pub const WAITING_FOR_MACHINES: &str = "WaitingForMachines";
    /// Server create request issued
    pub const SERVER_CREATING: &str = "ServerCreating";
    /// Server exists, network attachment started
    pub const NETWORK_ATTACHING: &str = "NetworkAttaching";
    /// Addresses assigned, waiting for the node to join
    pub const BOOTSTRAPPING: &str = "Bootstrapping";
    /// Node joined, machine Running
    pub const MACHINE_RUNNING: &str = "MachineRunning";
    /// A cloud request has been pending longer than the staleness threshold
    pub const REQUEST_STALE: &str = "RequestStale";
    /// Server vanished without the provider deleting it
    pub const EXTERNAL_DELETION: &str = "ExternalDeletion";
    /// Deletion started
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// Cloud resources released, finalizer removed
    pub const DELETED: &str = "Deleted";
    /// Resource moved to Failed
    pub const FAILED: &str = "Failed";
    /// Spec changed after failure, resource reset to Pending
    pub const RESET: &str = "Reset";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating or attaching cloud resources
    pub const PROVISION: &str = "Provision";
    /// Releasing cloud resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::EXTERNAL_DELETION,
                actions::RECONCILE,
                Some("server srv-1 is gone".to_string()),
            )
            .await;
    }
}
