//! IonosCloudCluster controller implementation
//!
//! Phase handlers decide; this module applies. Each pass produces an
//! [`Outcome`] which is written back in a fixed order: status (merged
//! forward over the live object), then ledger cleanup, then the finalizer.
//! Permanent errors become the Failed phase here, transient ones go to
//! [`error_policy`] for backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use capic_cloud::{CloudClientFactory, HttpClientFactory, HttpConfig};
use capic_common::crd::{
    clear_condition, condition_types, find_condition, ClusterPhase, Condition, ConditionStatus,
    IonosCloudCluster, IonosCloudClusterStatus, ResourceKey,
};
use capic_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use capic_common::kube_utils::{
    self, has_finalizer, object_ref, patch_status_guarded, resource_name, retry_on_conflict,
    status_patch_body,
};
use capic_common::teardown::{KubeMachineLister, TeardownCoordinator};
use capic_common::{Error, Outcome, ReconcileConfig, CLUSTER_FINALIZER};
use capic_tracker::{KubeRequestStore, RequestTracker};

use crate::phases;

/// Name reported on Events published by this controller
pub const CONTROLLER_NAME: &str = "ionoscloudcluster-controller";

/// Trait abstracting Kubernetes operations for IonosCloudCluster
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Write a proposed status over the live one
    ///
    /// On a resourceVersion conflict the live object is re-read and the
    /// proposal merged forward onto it. Returns `false` when the write was
    /// dropped because the live phase is already further along, or the
    /// object no longer exists.
    async fn write_status(
        &self,
        cluster: &IonosCloudCluster,
        status: &IonosCloudClusterStatus,
    ) -> Result<bool, Error>;

    /// Claim the cluster finalizer
    async fn add_finalizer(&self, cluster: &IonosCloudCluster) -> Result<(), Error>;

    /// Release the cluster finalizer
    async fn remove_finalizer(&self, cluster: &IonosCloudCluster) -> Result<(), Error>;

    /// Get a secret by name and namespace
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    conflict_retries: u32,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client, conflict_retries: u32) -> Self {
        Self {
            client,
            conflict_retries,
        }
    }

    fn api(&self, namespace: &str) -> Api<IonosCloudCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn write_status(
        &self,
        cluster: &IonosCloudCluster,
        status: &IonosCloudClusterStatus,
    ) -> Result<bool, Error> {
        let api = self.api(&cluster.namespace().unwrap_or_default());
        let name = cluster.name_any();
        let resource = resource_name(cluster);

        retry_on_conflict(self.conflict_retries, &resource, |attempt| {
            let api = api.clone();
            let name = name.clone();
            let proposed = status.clone();
            let seen = cluster.clone();
            async move {
                let current = if attempt == 0 {
                    seen
                } else {
                    match api.get_opt(&name).await? {
                        Some(live) => live,
                        None => return Ok(false),
                    }
                };
                let Some(merged) =
                    IonosCloudClusterStatus::merge_forward(current.status.as_ref(), proposed)
                else {
                    debug!(
                        live = ?current.status.as_ref().map(|s| s.phase),
                        "live status is further along, dropping write"
                    );
                    return Ok(false);
                };
                let body = status_patch_body(current.status.as_ref(), &merged)?;
                let version = current.resource_version();
                match patch_status_guarded(&api, &name, version.as_deref(), body).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    async fn add_finalizer(&self, cluster: &IonosCloudCluster) -> Result<(), Error> {
        let api = self.api(&cluster.namespace().unwrap_or_default());
        kube_utils::add_finalizer(&api, cluster, CLUSTER_FINALIZER).await
    }

    async fn remove_finalizer(&self, cluster: &IonosCloudCluster) -> Result<(), Error> {
        let api = self.api(&cluster.namespace().unwrap_or_default());
        kube_utils::remove_finalizer(&api, cluster, CLUSTER_FINALIZER).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        kube_utils::get_secret(&self.client, namespace, name).await
    }
}

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Builds cloud clients from resolved credentials
    pub cloud: Arc<dyn CloudClientFactory>,
    /// Deduplicates asynchronous cloud requests
    pub tracker: RequestTracker,
    /// Gates teardown on remaining machines
    pub teardown: TeardownCoordinator,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Timing policy
    pub config: ReconcileConfig,
    /// Consecutive failures per cluster, reset on the first successful pass
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    ///
    /// This is a convenience method equivalent to `Context::builder(client).build()`.
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        cloud: Arc<dyn CloudClientFactory>,
        tracker: RequestTracker,
        teardown: TeardownCoordinator,
    ) -> Self {
        Self {
            kube,
            cloud,
            tracker,
            teardown,
            events: Arc::new(capic_common::events::NoopEventPublisher),
            config: ReconcileConfig::for_testing(),
            failures: DashMap::new(),
        }
    }

    /// Count a failed pass; returns the number of failures before this one
    pub fn record_failure(&self, resource: &str) -> u32 {
        let mut entry = self.failures.entry(resource.to_string()).or_insert(0);
        let previous = *entry;
        *entry = previous.saturating_add(1);
        previous
    }

    /// Forget the failures of a resource
    pub fn reset_failures(&self, resource: &str) {
        self.failures.remove(resource);
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let (teardown, machine_removed) = TeardownCoordinator::new(lister);
/// let ctx = Context::builder(client)
///     .config(config)
///     .teardown(teardown)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    cloud: Option<Arc<dyn CloudClientFactory>>,
    tracker: Option<RequestTracker>,
    teardown: Option<TeardownCoordinator>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<ReconcileConfig>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            cloud: None,
            tracker: None,
            teardown: None,
            events: None,
            config: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the cloud client factory
    pub fn cloud_factory(mut self, cloud: Arc<dyn CloudClientFactory>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Override the request tracker
    pub fn tracker(mut self, tracker: RequestTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Use a shared teardown coordinator
    ///
    /// Without one the machine-removed trigger has no consumer and teardown
    /// relies on periodic requeues.
    pub fn teardown(mut self, teardown: TeardownCoordinator) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the timing policy
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let config = self.config.unwrap_or_default();
        let client = self.client;
        Context {
            kube: self.kube.unwrap_or_else(|| {
                Arc::new(KubeClientImpl::new(client.clone(), config.conflict_retries))
            }),
            cloud: self
                .cloud
                .unwrap_or_else(|| Arc::new(HttpClientFactory::new(HttpConfig::default()))),
            tracker: self.tracker.unwrap_or_else(|| {
                RequestTracker::new(Arc::new(KubeRequestStore::new(client.clone())))
            }),
            teardown: self.teardown.unwrap_or_else(|| {
                TeardownCoordinator::new(Arc::new(KubeMachineLister::new(client.clone()))).0
            }),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME))),
            config,
            failures: DashMap::new(),
        }
    }
}

/// Reconcile an IonosCloudCluster resource
///
/// Deletion is checked first, then the finalizer is claimed, then the
/// handler for the current phase runs.
#[instrument(
    skip(cluster, ctx),
    fields(cluster = %cluster.name_any(), namespace = %cluster.namespace().unwrap_or_default())
)]
pub async fn reconcile(cluster: Arc<IonosCloudCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let resource = resource_name(cluster.as_ref());
    debug!("reconciling cluster");

    match reconcile_cluster(&cluster, &ctx).await {
        Ok(action) => {
            ctx.reset_failures(&resource);
            Ok(action)
        }
        Err(e) if e.is_permanent() => fail(&cluster, &ctx, e).await,
        Err(e) => {
            mark_degraded(&cluster, &ctx, &e).await;
            Err(e)
        }
    }
}

async fn reconcile_cluster(cluster: &IonosCloudCluster, ctx: &Context) -> Result<Action, Error> {
    if cluster.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(cluster, CLUSTER_FINALIZER) {
            return Ok(Action::await_change());
        }
        let outcome = phases::handle_deleting(cluster, ctx).await?;
        return apply(cluster, ctx, outcome).await;
    }

    if !has_finalizer(cluster, CLUSTER_FINALIZER) {
        info!("adding finalizer");
        ctx.kube.add_finalizer(cluster).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let phase = cluster
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();

    let outcome = match phase {
        ClusterPhase::Pending => phases::handle_pending(cluster, ctx).await?,
        ClusterPhase::Provisioning => phases::handle_provisioning(cluster, ctx).await?,
        ClusterPhase::Ready => phases::handle_ready(cluster, ctx).await?,
        ClusterPhase::Failed => phases::handle_failed(cluster, ctx).await?,
        // Reached only together with a deletion timestamp
        ClusterPhase::Deleting | ClusterPhase::Deleted => Outcome::await_change(),
    };
    apply(cluster, ctx, outcome).await
}

/// Write the outcome of a pass: status, then ledger cleanup, then finalizer
async fn apply(
    cluster: &IonosCloudCluster,
    ctx: &Context,
    outcome: Outcome<IonosCloudClusterStatus>,
) -> Result<Action, Error> {
    // A successful pass also clears a Degraded condition left by an earlier failure
    let proposed = outcome.status.or_else(|| {
        cluster
            .status
            .clone()
            .filter(|s| find_condition(&s.conditions, condition_types::DEGRADED).is_some())
    });

    if let Some(mut status) = proposed {
        clear_condition(&mut status.conditions, condition_types::DEGRADED);
        if cluster.status.as_ref() != Some(&status) {
            let written = ctx.kube.write_status(cluster, &status).await?;
            if !written {
                debug!(phase = %status.phase, "status write superseded");
            }
        }
    }

    let key = ResourceKey::cluster(
        cluster.namespace().unwrap_or_default(),
        cluster.name_any(),
    );
    for kind in &outcome.settled {
        ctx.tracker.clear(&key, *kind).await?;
    }

    if outcome.remove_finalizer {
        ctx.kube.remove_finalizer(cluster).await?;
        info!("finalizer removed");
    }

    Ok(outcome.action)
}

/// Record a permanent error
///
/// Outside of deletion the cluster moves to Failed and waits for a spec
/// change. During deletion the phase stays Deleting, the cause is recorded
/// and the error goes to [`error_policy`] so teardown keeps retrying.
async fn fail(cluster: &IonosCloudCluster, ctx: &Context, err: Error) -> Result<Action, Error> {
    let current = cluster.status.clone().unwrap_or_default();

    if cluster.metadata.deletion_timestamp.is_some() {
        error!(error = %err, "permanent error during teardown");
        let mut status = current;
        status.failure_reason = Some(err.reason());
        status.failure_message = Some(err.to_string());
        if let Err(e) = ctx.kube.write_status(cluster, &status).await {
            warn!(error = %e, "failed to record teardown failure");
        }
        return Err(err);
    }

    error!(error = %err, reason = %err.reason(), "cluster failed permanently");
    ctx.events
        .publish(
            &object_ref(cluster),
            EventType::Warning,
            reasons::FAILED,
            actions::RECONCILE,
            Some(err.to_string()),
        )
        .await;

    let status = current
        .failed(err.reason(), err.to_string())
        .observed(cluster.metadata.generation);
    ctx.kube.write_status(cluster, &status).await?;
    Ok(Action::await_change())
}

/// Best-effort Degraded condition for a transient failure
async fn mark_degraded(cluster: &IonosCloudCluster, ctx: &Context, err: &Error) {
    let Some(current) = cluster.status.as_ref() else {
        return;
    };
    let status = current.clone().condition(Condition::new(
        condition_types::DEGRADED,
        ConditionStatus::True,
        err.kind_label(),
        err.to_string(),
    ));
    if &status == current {
        return;
    }
    if let Err(e) = ctx.kube.write_status(cluster, &status).await {
        debug!(error = %e, "failed to record degraded condition");
    }
}

/// Error policy for the controller
///
/// Backs off exponentially per cluster; the counter resets on the first
/// successful pass.
pub fn error_policy(cluster: Arc<IonosCloudCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let resource = resource_name(cluster.as_ref());
    let failures = ctx.record_failure(&resource);
    let delay = ctx.config.backoff.delay_for(failures);
    warn!(
        cluster = %resource,
        error = %error,
        kind = error.kind_label(),
        failures = failures + 1,
        retry_in = ?delay,
        "reconciliation failed, backing off"
    );
    Action::requeue(delay)
}
