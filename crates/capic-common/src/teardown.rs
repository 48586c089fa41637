//! Ordering of cluster teardown after machine teardown
//!
//! A cluster may only release its own resources and drop its finalizer once
//! no IonosCloudMachine labelled with its name exists any more. Machines that
//! finish deleting nudge their cluster through a channel so the cluster
//! controller re-evaluates right away instead of on its next resync.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::sync::mpsc;
use tracing::debug;

use crate::crd::IonosCloudMachine;
use crate::{ClusterKey, Error, CLUSTER_NAME_LABEL};

/// Counts the machines that still reference a cluster
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MachineLister: Send + Sync {
    /// Number of IonosCloudMachines (including ones still deleting) labelled with the cluster
    async fn count_machines(&self, cluster: &ClusterKey) -> Result<usize, Error>;
}

/// [`MachineLister`] backed by the API server
pub struct KubeMachineLister {
    client: Client,
}

impl KubeMachineLister {
    /// Create a lister using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineLister for KubeMachineLister {
    async fn count_machines(&self, cluster: &ClusterKey) -> Result<usize, Error> {
        let api: Api<IonosCloudMachine> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, cluster.name));
        let list = api.list(&params).await?;
        Ok(list.items.len())
    }
}

/// Decides when a cluster may be torn down and re-triggers it when machines go away
#[derive(Clone)]
pub struct TeardownCoordinator {
    lister: Arc<dyn MachineLister>,
    trigger: mpsc::UnboundedSender<ClusterKey>,
}

impl TeardownCoordinator {
    /// Create a coordinator and the receiving end of its re-trigger channel
    pub fn new(lister: Arc<dyn MachineLister>) -> (Self, mpsc::UnboundedReceiver<ClusterKey>) {
        let (trigger, rx) = mpsc::unbounded_channel();
        (Self { lister, trigger }, rx)
    }

    /// True iff no machine references the cluster
    pub async fn can_delete(&self, cluster: &ClusterKey) -> Result<bool, Error> {
        let remaining = self.lister.count_machines(cluster).await?;
        if remaining > 0 {
            debug!(cluster = %cluster, remaining, "Cluster teardown blocked by machines");
        }
        Ok(remaining == 0)
    }

    /// Ask for the cluster to be reconciled again
    ///
    /// Never fails: with no consumer listening the next periodic resync
    /// picks the cluster up instead.
    pub fn on_machine_removed(&self, cluster: &ClusterKey) {
        if self.trigger.send(cluster.clone()).is_err() {
            debug!(cluster = %cluster, "No cluster trigger consumer, relying on resync");
        }
    }
}
