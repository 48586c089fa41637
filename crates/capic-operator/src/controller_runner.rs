//! Controller runner - builds the controller futures
//!
//! Both controllers share one [`TeardownCoordinator`]: the machine controller
//! signals through it when a machine's finalizer is released, and the
//! cluster controller re-reconciles the named cluster from that channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_stream::wrappers::UnboundedReceiverStream;

use capic_cloud::{CloudClientFactory, HttpClientFactory, HttpConfig};
use capic_common::crd::{IonosCloudCluster, IonosCloudMachine};
use capic_common::teardown::{KubeMachineLister, TeardownCoordinator};
use capic_common::{ClusterKey, ReconcileConfig};

/// Watcher timeout (seconds) - must be less than the client read timeout
/// so the API server closes idle watches first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn cluster_ref(key: &ClusterKey) -> ObjectRef<IonosCloudCluster> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Build the IonosCloudCluster and IonosCloudMachine controller futures
pub fn build_controllers(
    client: Client,
    config: ReconcileConfig,
    http: HttpConfig,
    namespace: Option<String>,
) -> Vec<ControllerFuture> {
    let cloud: Arc<dyn CloudClientFactory> = Arc::new(HttpClientFactory::new(http));
    let (teardown, machine_removed) =
        TeardownCoordinator::new(Arc::new(KubeMachineLister::new(client.clone())));
    let controller_config = ControllerConfig::default().concurrency(config.concurrency);
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let ns = namespace.as_deref();

    let cluster_ctx = Arc::new(
        capic_cluster::Context::builder(client.clone())
            .cloud_factory(cloud.clone())
            .teardown(teardown.clone())
            .config(config.clone())
            .build(),
    );
    let machine_ctx = Arc::new(
        capic_machine::Context::builder(client.clone())
            .cloud_factory(cloud)
            .teardown(teardown)
            .config(config)
            .build(),
    );

    let removed = UnboundedReceiverStream::new(machine_removed).map(|key| cluster_ref(&key));
    let cluster_ctrl = Controller::new(api::<IonosCloudCluster>(&client, ns), watcher())
        .with_config(controller_config.clone())
        .watches(
            api::<IonosCloudMachine>(&client, ns),
            watcher(),
            |machine| capic_machine::cluster_of(&machine).map(|key| cluster_ref(&key)),
        )
        .reconcile_on(removed)
        .shutdown_on_signal()
        .run(
            capic_cluster::reconcile,
            capic_cluster::error_policy,
            cluster_ctx,
        )
        .for_each(log_reconcile_result("IonosCloudCluster"));

    let machine_ctrl = Controller::new(api::<IonosCloudMachine>(&client, ns), watcher())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(
            capic_machine::reconcile,
            capic_machine::error_policy,
            machine_ctx,
        )
        .for_each(log_reconcile_result("IonosCloudMachine"));

    tracing::info!(namespace = ns.unwrap_or("<all>"), "- IonosCloudCluster controller");
    tracing::info!(namespace = ns.unwrap_or("<all>"), "- IonosCloudMachine controller");

    vec![Box::pin(cluster_ctrl), Box::pin(machine_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_ref_is_namespaced() {
        let reference = cluster_ref(&ClusterKey::new("capi-system", "c1"));
        assert_eq!(reference.name, "c1");
        assert_eq!(reference.namespace.as_deref(), Some("capi-system"));
    }
}
