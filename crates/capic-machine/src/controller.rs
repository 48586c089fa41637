//! IonosCloudMachine controller implementation
//!
//! Phase handlers return an [`Outcome`]; this module writes it back: status
//! first, then ledger cleanup, then the finalizer. A machine whose finalizer
//! is released nudges its cluster through the teardown coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use capic_cloud::{CloudClientFactory, HttpClientFactory, HttpConfig};
use capic_common::crd::{
    clear_condition, condition_types, find_condition, Condition, ConditionStatus,
    IonosCloudCluster, IonosCloudMachine, IonosCloudMachineStatus, MachinePhase, ResourceKey,
};
use capic_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use capic_common::kube_utils::{
    self, build_api_resource, has_finalizer, object_ref, patch_status_guarded, resource_name,
    retry_on_conflict, status_patch_body,
};
use capic_common::teardown::{KubeMachineLister, TeardownCoordinator};
use capic_common::{
    ClusterKey, Error, Outcome, ReconcileConfig, CLUSTER_NAME_LABEL, MACHINE_FINALIZER,
};
use capic_tracker::{KubeRequestStore, RequestTracker};

use crate::phases;

/// Name reported on Events published by this controller
pub const CONTROLLER_NAME: &str = "ionoscloudmachine-controller";

/// API group of the Cluster API Machine owning an IonosCloudMachine
const CAPI_GROUP: &str = "cluster.x-k8s.io/";

/// Secret key holding the bootstrap data
const BOOTSTRAP_DATA_KEY: &str = "value";

/// The cluster a machine belongs to, from its Cluster API label
pub fn cluster_of(machine: &IonosCloudMachine) -> Option<ClusterKey> {
    let name = machine.labels().get(CLUSTER_NAME_LABEL)?;
    Some(ClusterKey::new(
        machine.namespace().unwrap_or_default(),
        name.clone(),
    ))
}

/// Trait abstracting Kubernetes operations for IonosCloudMachine
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Write a proposed status over the live one, merged forward on conflict
    ///
    /// Returns `false` when the live phase is already further along or the
    /// machine no longer exists.
    async fn write_status(
        &self,
        machine: &IonosCloudMachine,
        status: &IonosCloudMachineStatus,
    ) -> Result<bool, Error>;

    /// Claim the machine finalizer
    async fn add_finalizer(&self, machine: &IonosCloudMachine) -> Result<(), Error>;

    /// Release the machine finalizer
    async fn remove_finalizer(&self, machine: &IonosCloudMachine) -> Result<(), Error>;

    /// Set `spec.providerId`; returns the generation after the write
    async fn set_provider_id(
        &self,
        machine: &IonosCloudMachine,
        provider_id: &str,
    ) -> Result<Option<i64>, Error>;

    /// Get an IonosCloudCluster by namespace and name
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IonosCloudCluster>, Error>;

    /// Get a secret by name and namespace
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Bootstrap data of the owning Machine, once its bootstrap provider has produced it
    async fn bootstrap_data(&self, machine: &IonosCloudMachine) -> Result<Option<String>, Error>;

    /// Whether the owning Machine reports a node reference
    async fn bootstrap_complete(&self, machine: &IonosCloudMachine) -> Result<bool, Error>;
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

    fn api(&self, namespace: &str) -> Api<IonosCloudMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// The Cluster API Machine listed as owner, read untyped
    async fn owner_machine(
        &self,
        machine: &IonosCloudMachine,
    ) -> Result<Option<DynamicObject>, Error> {
        let Some(owner) = machine
            .owner_references()
            .iter()
            .find(|o| o.kind == "Machine" && o.api_version.starts_with(CAPI_GROUP))
        else {
            debug!("no owner Machine yet");
            return Ok(None);
        };
        let ar = build_api_resource(&owner.api_version, &owner.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &machine.namespace().unwrap_or_default(),
            &ar,
        );
        Ok(api.get_opt(&owner.name).await?)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn write_status(
        &self,
        machine: &IonosCloudMachine,
        status: &IonosCloudMachineStatus,
    ) -> Result<bool, Error> {
        let api = self.api(&machine.namespace().unwrap_or_default());
        let name = machine.name_any();
        let resource = resource_name(machine);

        retry_on_conflict(self.conflict_retries, &resource, |attempt| {
            let api = api.clone();
            let name = name.clone();
            let proposed = status.clone();
            let seen = machine.clone();
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
                    IonosCloudMachineStatus::merge_forward(current.status.as_ref(), proposed)
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

    async fn add_finalizer(&self, machine: &IonosCloudMachine) -> Result<(), Error> {
        let api = self.api(&machine.namespace().unwrap_or_default());
        kube_utils::add_finalizer(&api, machine, MACHINE_FINALIZER).await
    }

    async fn remove_finalizer(&self, machine: &IonosCloudMachine) -> Result<(), Error> {
        let api = self.api(&machine.namespace().unwrap_or_default());
        kube_utils::remove_finalizer(&api, machine, MACHINE_FINALIZER).await
    }

    async fn set_provider_id(
        &self,
        machine: &IonosCloudMachine,
        provider_id: &str,
    ) -> Result<Option<i64>, Error> {
        if machine.spec.provider_id.as_deref() == Some(provider_id) {
            return Ok(machine.metadata.generation);
        }
        let api = self.api(&machine.namespace().unwrap_or_default());
        let patch = serde_json::json!({ "spec": { "providerId": provider_id } });
        let updated = api
            .patch(&machine.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated.metadata.generation)
    }

    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IonosCloudCluster>, Error> {
        let api: Api<IonosCloudCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        kube_utils::get_secret(&self.client, namespace, name).await
    }

    async fn bootstrap_data(&self, machine: &IonosCloudMachine) -> Result<Option<String>, Error> {
        let Some(owner) = self.owner_machine(machine).await? else {
            return Ok(None);
        };
        let Some(secret_name) = owner
            .data
            .pointer("/spec/bootstrap/dataSecretName")
            .and_then(|v| v.as_str())
        else {
            return Ok(None);
        };
        let namespace = machine.namespace().unwrap_or_default();
        let Some(secret) = kube_utils::get_secret(&self.client, &namespace, secret_name).await?
        else {
            return Ok(None);
        };
        let Some(bytes) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(BOOTSTRAP_DATA_KEY))
        else {
            return Ok(None);
        };
        String::from_utf8(bytes.0.clone()).map(Some).map_err(|_| {
            Error::validation_for(
                resource_name(machine),
                format!("bootstrap data in Secret {} is not valid UTF-8", secret_name),
            )
        })
    }

    async fn bootstrap_complete(&self, machine: &IonosCloudMachine) -> Result<bool, Error> {
        let Some(owner) = self.owner_machine(machine).await? else {
            return Ok(false);
        };
        Ok(owner
            .data
            .pointer("/status/nodeRef")
            .is_some_and(|node_ref| !node_ref.is_null()))
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
    /// Notified when a machine has released its finalizer
    pub teardown: TeardownCoordinator,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Timing policy
    pub config: ReconcileConfig,
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
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

    /// Share the cluster controller's teardown coordinator
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

/// Reconcile an IonosCloudMachine resource
#[instrument(
    skip(machine, ctx),
    fields(machine = %machine.name_any(), namespace = %machine.namespace().unwrap_or_default())
)]
pub async fn reconcile(machine: Arc<IonosCloudMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let resource = resource_name(machine.as_ref());
    debug!("reconciling machine");

    match reconcile_machine(&machine, &ctx).await {
        Ok(action) => {
            ctx.reset_failures(&resource);
            Ok(action)
        }
        Err(e) if e.is_permanent() => fail(&machine, &ctx, e).await,
        Err(e) => {
            mark_degraded(&machine, &ctx, &e).await;
            Err(e)
        }
    }
}

async fn reconcile_machine(machine: &IonosCloudMachine, ctx: &Context) -> Result<Action, Error> {
    if machine.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(machine, MACHINE_FINALIZER) {
            return Ok(Action::await_change());
        }
        let outcome = phases::handle_deleting(machine, ctx).await?;
        return apply(machine, ctx, outcome).await;
    }

    if !has_finalizer(machine, MACHINE_FINALIZER) {
        info!("adding finalizer");
        ctx.kube.add_finalizer(machine).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let phase = machine
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();

    let outcome = match phase {
        MachinePhase::Pending => phases::handle_pending(machine, ctx).await?,
        MachinePhase::Creating => phases::handle_creating(machine, ctx).await?,
        MachinePhase::NetworkAttaching => phases::handle_network(machine, ctx).await?,
        MachinePhase::Bootstrapping => phases::handle_bootstrapping(machine, ctx).await?,
        MachinePhase::Running => phases::handle_running(machine, ctx).await?,
        MachinePhase::Failed => phases::handle_failed(machine, ctx).await?,
        MachinePhase::Deleting | MachinePhase::Deleted => Outcome::await_change(),
    };
    apply(machine, ctx, outcome).await
}

/// Write the outcome of a pass: status, then ledger cleanup, then finalizer
async fn apply(
    machine: &IonosCloudMachine,
    ctx: &Context,
    outcome: Outcome<IonosCloudMachineStatus>,
) -> Result<Action, Error> {
    let proposed = outcome.status.or_else(|| {
        machine
            .status
            .clone()
            .filter(|s| find_condition(&s.conditions, condition_types::DEGRADED).is_some())
    });

    if let Some(mut status) = proposed {
        clear_condition(&mut status.conditions, condition_types::DEGRADED);
        if machine.status.as_ref() != Some(&status) {
            let written = ctx.kube.write_status(machine, &status).await?;
            if !written {
                debug!(phase = %status.phase, "status write superseded");
            }
        }
    }

    let key = ResourceKey::machine(
        machine.namespace().unwrap_or_default(),
        machine.name_any(),
    );
    for kind in &outcome.settled {
        ctx.tracker.clear(&key, *kind).await?;
    }

    if outcome.remove_finalizer {
        ctx.kube.remove_finalizer(machine).await?;
        info!("finalizer removed");
        if let Some(cluster) = cluster_of(machine) {
            ctx.teardown.on_machine_removed(&cluster);
        }
    }

    Ok(outcome.action)
}

/// Record a permanent error
///
/// Outside of deletion the machine moves to Failed and waits for a spec
/// change. During deletion the cause is recorded and teardown keeps retrying.
async fn fail(machine: &IonosCloudMachine, ctx: &Context, err: Error) -> Result<Action, Error> {
    let current = machine.status.clone().unwrap_or_default();

    if machine.metadata.deletion_timestamp.is_some() {
        error!(error = %err, "permanent error during teardown");
        let mut status = current;
        status.failure_reason = Some(err.reason());
        status.failure_message = Some(err.to_string());
        if let Err(e) = ctx.kube.write_status(machine, &status).await {
            warn!(error = %e, "failed to record teardown failure");
        }
        return Err(err);
    }

    error!(error = %err, reason = %err.reason(), "machine failed permanently");
    ctx.events
        .publish(
            &object_ref(machine),
            EventType::Warning,
            reasons::FAILED,
            actions::PROVISION,
            Some(err.to_string()),
        )
        .await;

    let status = current
        .failed(err.reason(), err.to_string())
        .observed(machine.metadata.generation);
    ctx.kube.write_status(machine, &status).await?;
    Ok(Action::await_change())
}

async fn mark_degraded(machine: &IonosCloudMachine, ctx: &Context, err: &Error) {
    let Some(current) = machine.status.as_ref() else {
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
    if let Err(e) = ctx.kube.write_status(machine, &status).await {
        debug!(error = %e, "failed to record degraded condition");
    }
}

/// Error policy for the controller
pub fn error_policy(machine: Arc<IonosCloudMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    let resource = resource_name(machine.as_ref());
    let failures = ctx.record_failure(&resource);
    let delay = ctx.config.backoff.delay_for(failures);
    warn!(
        machine = %resource,
        error = %error,
        kind = error.kind_label(),
        failures = failures + 1,
        retry_in = ?delay,
        "reconciliation failed, backing off"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use base64::prelude::*;
    use capic_cloud::{
        CloudClient, CloudError, IpBlockInfo, MockCloudClient, MockCloudClientFactory,
        MutationOutcome, RequestStatus, ResourceState, ServerInfo,
    };
    use capic_common::crd::{
        ApiEndpoint, ClusterPhase, DiskSpec, IonosCloudClusterSpec, IonosCloudClusterStatus,
        IonosCloudMachineSpec, OperationKind, ProvisioningRequest, SecretRef,
    };
    use capic_common::teardown::MockMachineLister;
    use capic_tracker::{MemoryRequestStore, RequestStore};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use tokio::sync::mpsc::UnboundedReceiver;

    const BOOTSTRAP: &str = "#cloud-config\nruncmd: []\n";

    /// Create a sample IonosCloudMachine of cluster c1 with the finalizer claimed
    fn sample_machine(name: &str) -> IonosCloudMachine {
        let mut machine = IonosCloudMachine::new(
            name,
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
            },
        );
        machine.metadata.namespace = Some("default".to_string());
        machine.metadata.generation = Some(1);
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "c1".to_string(),
        )]));
        machine
    }

    fn machine_with_phase(name: &str, phase: MachinePhase) -> IonosCloudMachine {
        let mut machine = sample_machine(name);
        machine.status = Some(IonosCloudMachineStatus::with_phase(phase).observed(Some(1)));
        machine
    }

    fn with_server(mut machine: IonosCloudMachine, server_id: &str) -> IonosCloudMachine {
        if let Some(status) = machine.status.as_mut() {
            status.instance_id = Some(server_id.to_string());
        }
        machine
    }

    fn deleting(mut machine: IonosCloudMachine) -> IonosCloudMachine {
        machine.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        machine
    }

    fn cluster(ready: bool) -> IonosCloudCluster {
        let mut cluster = IonosCloudCluster::new(
            "c1",
            IonosCloudClusterSpec {
                location: "de/txl".to_string(),
                control_plane_endpoint: ApiEndpoint::default(),
                credentials_ref: SecretRef {
                    name: "ionos-credentials".to_string(),
                },
                contract_number: None,
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        let phase = if ready {
            ClusterPhase::Ready
        } else {
            ClusterPhase::Provisioning
        };
        let mut status = IonosCloudClusterStatus::with_phase(phase);
        status.ready = ready;
        cluster.status = Some(status);
        cluster
    }

    fn credentials_secret() -> Secret {
        Secret {
            string_data: Some(BTreeMap::from([(
                "IONOS_TOKEN".to_string(),
                "token".to_string(),
            )])),
            ..Default::default()
        }
    }

    fn server(id: &str, state: ResourceState) -> ServerInfo {
        ServerInfo {
            id: id.to_string(),
            name: "default-m1".to_string(),
            state,
            vm_state: Some("RUNNING".to_string()),
            nics: vec![],
        }
    }

    fn block(id: &str, ips: &[&str]) -> IpBlockInfo {
        IpBlockInfo {
            id: id.to_string(),
            name: "default-m1".to_string(),
            location: "de/txl".to_string(),
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            state: ResourceState::Available,
        }
    }

    fn accepted(request_id: &str, resource_id: &str) -> MutationOutcome {
        MutationOutcome::Accepted {
            request_id: request_id.to_string(),
            resource_id: Some(resource_id.to_string()),
        }
    }

    /// Captures every status the controller writes
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<IonosCloudMachineStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: IonosCloudMachineStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last(&self) -> IonosCloudMachineStatus {
            self.updates
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("a status was written")
        }

        fn last_phase(&self) -> Option<MachinePhase> {
            self.updates.lock().unwrap().last().map(|s| s.phase)
        }

        fn phases(&self) -> Vec<MachinePhase> {
            let mut phases: Vec<MachinePhase> =
                self.updates.lock().unwrap().iter().map(|s| s.phase).collect();
            phases.dedup();
            phases
        }

        fn writes(&self) -> usize {
            self.updates.lock().unwrap().len()
        }
    }

    /// The machine as the next watch event would deliver it
    fn observed(machine: &IonosCloudMachine, capture: &StatusCapture) -> IonosCloudMachine {
        let mut next = machine.clone();
        next.status = Some(capture.last());
        next
    }

    struct Fixture {
        cluster: Option<IonosCloudCluster>,
        secret: Option<Secret>,
        bootstrap: Option<String>,
        store: MemoryRequestStore,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                cluster: Some(cluster(true)),
                secret: Some(credentials_secret()),
                bootstrap: Some(BOOTSTRAP.to_string()),
                store: MemoryRequestStore::new(),
            }
        }
    }

    struct Harness {
        capture: StatusCapture,
        store: MemoryRequestStore,
        finalizer_removals: Arc<AtomicU32>,
        provider_ids: Arc<Mutex<Vec<String>>>,
        node_joined: Arc<AtomicBool>,
        machine_removed: UnboundedReceiver<ClusterKey>,
        ctx: Arc<Context>,
    }

    fn harness_with(fixture: Fixture, factory: MockCloudClientFactory) -> Harness {
        let capture = StatusCapture::default();
        let finalizer_removals = Arc::new(AtomicU32::new(0));
        let provider_ids = Arc::new(Mutex::new(Vec::new()));
        let node_joined = Arc::new(AtomicBool::new(false));

        let mut kube = MockKubeClient::new();
        let recorder = capture.clone();
        kube.expect_write_status().returning(move |_, status| {
            recorder.record(status.clone());
            Ok(true)
        });
        kube.expect_add_finalizer().returning(|_| Ok(()));
        let removals = finalizer_removals.clone();
        kube.expect_remove_finalizer().returning(move |_| {
            removals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ids = provider_ids.clone();
        kube.expect_set_provider_id().returning(move |machine, id| {
            ids.lock().unwrap().push(id.to_string());
            Ok(machine.metadata.generation)
        });
        let cluster = fixture.cluster;
        kube.expect_get_cluster()
            .returning(move |_, _| Ok(cluster.clone()));
        let secret = fixture.secret;
        kube.expect_get_secret()
            .returning(move |_, _| Ok(secret.clone()));
        let bootstrap = fixture.bootstrap;
        kube.expect_bootstrap_data()
            .returning(move |_| Ok(bootstrap.clone()));
        let joined = node_joined.clone();
        kube.expect_bootstrap_complete()
            .returning(move |_| Ok(joined.load(Ordering::SeqCst)));

        let (teardown, machine_removed) = TeardownCoordinator::new(Arc::new(MockMachineLister::new()));

        let store = fixture.store;
        let ctx = Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(factory),
            RequestTracker::new(Arc::new(store.clone())),
            teardown,
        ));

        Harness {
            capture,
            store,
            finalizer_removals,
            provider_ids,
            node_joined,
            machine_removed,
            ctx,
        }
    }

    fn factory_for(cloud: Arc<dyn CloudClient>) -> MockCloudClientFactory {
        let mut factory = MockCloudClientFactory::new();
        factory
            .expect_build()
            .returning(move |_| Ok(cloud.clone()));
        factory
    }

    fn harness(cloud: MockCloudClient) -> Harness {
        harness_with(Fixture::default(), factory_for(Arc::new(cloud)))
    }

    fn unused_factory() -> MockCloudClientFactory {
        let mut factory = MockCloudClientFactory::new();
        factory.expect_build().never();
        factory
    }

    async fn seed(store: &MemoryRequestStore, kind: OperationKind, request_id: &str, target: &str) {
        let request = ProvisioningRequest::new(
            ResourceKey::machine("default", "m1"),
            kind,
            request_id,
            Some(target.to_string()),
        );
        store.put(&request).await.expect("seed");
    }

    #[tokio::test]
    async fn test_finalizer_is_claimed_first() {
        let mut machine = sample_machine("m1");
        machine.metadata.finalizers = None;
        let h = harness_with(Fixture::default(), unused_factory());

        let action = reconcile(Arc::new(machine), h.ctx.clone())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert!(h.capture.last_phase().is_none());
    }

    #[test]
    fn test_cluster_is_read_from_label() {
        let machine = sample_machine("m1");
        assert_eq!(cluster_of(&machine), Some(ClusterKey::new("default", "c1")));

        let mut unlabelled = machine;
        unlabelled.metadata.labels = None;
        assert!(cluster_of(&unlabelled).is_none());
    }

    /// Story: machine m1 goes from Pending to Running
    ///
    /// The create is issued once and found queued, so the pass requeues on
    /// the poll interval. The next pass sees it succeed and records the
    /// server. NIC and IP block land in one pass, the reserved address is
    /// published, and the machine runs once its node has joined.
    #[tokio::test]
    async fn story_machine_provisions_to_running() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_verify_datacenter()
            .withf(|dc| dc == "dc-1")
            .returning(|_| Ok(()));
        cloud
            .expect_find_server_by_name()
            .withf(|dc, name| dc == "dc-1" && name == "default-m1")
            .times(1)
            .returning(|_, _| Ok(None));
        let user_data = BASE64_STANDARD.encode(BOOTSTRAP);
        cloud
            .expect_create_server()
            .withf(move |spec| {
                spec.name == "default-m1"
                    && spec.cores == 2
                    && spec.image == "ubuntu-22.04"
                    && spec.user_data.as_deref() == Some(user_data.as_str())
            })
            .times(1)
            .returning(|_| Ok(accepted("req-create", "i1")));
        let create_polls = Arc::new(AtomicU32::new(0));
        let seen = create_polls.clone();
        cloud.expect_request_status().returning(move |id| {
            if id == "req-create" && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(RequestStatus::Queued)
            } else {
                Ok(RequestStatus::Done)
            }
        });
        cloud
            .expect_describe_server()
            .withf(|dc, id| dc == "dc-1" && id == "i1")
            .returning(|_, id| Ok(server(id, ResourceState::Available)));
        cloud
            .expect_attach_nic()
            .withf(|_, server, nic| server == "i1" && nic.name == "m1-nic" && nic.lan_id == 1 && nic.dhcp)
            .times(1)
            .returning(|_, _, _| Ok(accepted("req-nic", "nic-1")));
        cloud
            .expect_find_ip_block_by_name()
            .times(1)
            .returning(|_, _| Ok(None));
        cloud
            .expect_allocate_ip()
            .withf(|spec| spec.name == "default-m1" && spec.location == "de/txl" && spec.size == 1)
            .times(1)
            .returning(|_| Ok(accepted("req-ip", "ipb-1")));
        cloud
            .expect_describe_ip_block()
            .withf(|id| id == "ipb-1")
            .returning(|id| Ok(block(id, &["10.0.0.5"])));
        let h = harness(cloud);
        let machine = sample_machine("m1");

        let action = reconcile(Arc::new(machine.clone()), h.ctx.clone())
            .await
            .expect("create");
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(h.capture.last_phase(), Some(MachinePhase::Creating));
        assert_eq!(h.store.len(), 1);

        reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
            .await
            .expect("created");
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::NetworkAttaching);
        assert_eq!(status.instance_id.as_deref(), Some("i1"));
        assert_eq!(*h.provider_ids.lock().unwrap(), vec!["ionos://i1".to_string()]);
        assert!(h.store.is_empty());

        reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
            .await
            .expect("network");
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Bootstrapping);
        assert!(status.ready);
        assert_eq!(status.nic_id.as_deref(), Some("nic-1"));
        assert_eq!(status.ip_block_id.as_deref(), Some("ipb-1"));
        let addresses: Vec<&str> = status.addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.5"]);
        assert!(h.store.is_empty());

        let action = reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
            .await
            .expect("bootstrapping");
        assert_eq!(action, Action::requeue(h.ctx.config.waiting_interval));
        assert_eq!(h.capture.last_phase(), Some(MachinePhase::Bootstrapping));

        h.node_joined.store(true, Ordering::SeqCst);
        let action = reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
            .await
            .expect("running");
        assert_eq!(action, Action::requeue(h.ctx.config.ready_resync));

        assert_eq!(
            h.capture.phases(),
            vec![
                MachinePhase::Creating,
                MachinePhase::NetworkAttaching,
                MachinePhase::Bootstrapping,
                MachinePhase::Running,
            ]
        );
        let status = h.capture.last();
        let ready = find_condition(&status.conditions, condition_types::READY).expect("ready");
        assert_eq!(ready.status, ConditionStatus::True);
    }

    /// Story: repeated passes and controller restarts never create a second server
    ///
    /// Passes run both on the stale Pending object (as if the status write
    /// was lost) and on the Creating one; every restart rebuilds the tracker
    /// over the same durable store.
    #[tokio::test]
    async fn story_no_duplicate_creation_across_restarts() {
        let mut cloud = MockCloudClient::new();
        cloud.expect_verify_datacenter().returning(|_| Ok(()));
        cloud
            .expect_find_server_by_name()
            .times(1)
            .returning(|_, _| Ok(None));
        cloud
            .expect_create_server()
            .times(1)
            .returning(|_| Ok(accepted("req-create", "i1")));
        cloud
            .expect_request_status()
            .returning(|_| Ok(RequestStatus::Running));
        let cloud: Arc<dyn CloudClient> = Arc::new(cloud);
        let store = MemoryRequestStore::new();

        for _restart in 0..3 {
            let h = harness_with(
                Fixture {
                    store: store.clone(),
                    ..Fixture::default()
                },
                factory_for(cloud.clone()),
            );
            for machine in [
                sample_machine("m1"),
                machine_with_phase("m1", MachinePhase::Creating),
            ] {
                let action = reconcile(Arc::new(machine), h.ctx.clone())
                    .await
                    .expect("reconcile");
                assert_eq!(action, Action::requeue(h.ctx.config.poll_interval));
            }
        }

        let entry = store
            .get(&ResourceKey::machine("default", "m1"), OperationKind::CreateServer)
            .await
            .expect("get")
            .expect("still tracked");
        assert_eq!(entry.cloud_request_id, "req-create");
        assert_eq!(entry.poll_count, 6);
    }

    /// Story: a request that stays pending is polled, never failed
    ///
    /// Once it is older than the staleness threshold it is flagged and the
    /// poll interval backs off.
    #[tokio::test]
    async fn story_pending_request_requeues_and_never_fails() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_request_status()
            .returning(|_| Ok(RequestStatus::Queued));
        cloud.expect_create_server().never();
        let store = MemoryRequestStore::new();
        seed(&store, OperationKind::CreateServer, "req-1", "i1").await;
        let h = harness_with(
            Fixture {
                store: store.clone(),
                ..Fixture::default()
            },
            factory_for(Arc::new(cloud)),
        );
        let machine = Arc::new(machine_with_phase("m1", MachinePhase::Creating));

        for _ in 0..5 {
            let action = reconcile(machine.clone(), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        }
        assert!(!h.capture.phases().contains(&MachinePhase::Failed));
        let status = h.capture.last();
        assert!(find_condition(&status.conditions, condition_types::REQUEST_STALE).is_none());

        let key = ResourceKey::machine("default", "m1");
        let mut entry = store
            .get(&key, OperationKind::CreateServer)
            .await
            .expect("get")
            .expect("entry");
        entry.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.put(&entry).await.expect("age entry");

        let action = reconcile(machine, h.ctx.clone())
            .await
            .expect("reconcile");
        let entry = store
            .get(&key, OperationKind::CreateServer)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(
            action,
            Action::requeue(h.ctx.config.backoff.delay_for(entry.poll_count))
        );
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Creating);
        let stale = find_condition(&status.conditions, condition_types::REQUEST_STALE)
            .expect("stale condition");
        assert_eq!(stale.status, ConditionStatus::True);
    }

    /// Story: the image does not exist
    ///
    /// The machine fails with the cloud's reason and nothing is retried
    /// while the spec stays the same.
    #[tokio::test]
    async fn story_image_not_found_fails_without_retry() {
        let mut cloud = MockCloudClient::new();
        cloud.expect_verify_datacenter().returning(|_| Ok(()));
        cloud
            .expect_find_server_by_name()
            .returning(|_, _| Ok(None));
        cloud
            .expect_create_server()
            .times(1)
            .returning(|_| Err(CloudError::from_status(422, "image not found")));
        let h = harness(cloud);
        let machine = sample_machine("m1");

        let action = reconcile(Arc::new(machine.clone()), h.ctx.clone())
            .await
            .expect("permanent errors are absorbed");
        assert_eq!(action, Action::await_change());
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Failed);
        assert_eq!(status.failure_reason.as_deref(), Some("image not found"));
        assert!(h.store.is_empty());

        for _ in 0..3 {
            let action = reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(action, Action::await_change());
        }
        assert_eq!(h.capture.writes(), 1);
    }

    #[tokio::test]
    async fn story_failed_machine_resets_after_spec_change() {
        let mut machine = with_server(machine_with_phase("m1", MachinePhase::Creating), "i1");
        let failed = machine
            .status
            .clone()
            .unwrap()
            .failed("image not found", "create_server failed");
        machine.status = Some(failed);
        machine.metadata.generation = Some(2);
        let h = harness_with(Fixture::default(), unused_factory());

        reconcile(Arc::new(machine), h.ctx.clone())
            .await
            .expect("reconcile");

        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Pending);
        assert_eq!(status.observed_generation, Some(2));
        assert!(status.failure_reason.is_none());
        assert!(status.instance_id.is_none());
    }

    #[tokio::test]
    async fn test_machine_waits_for_ready_cluster() {
        let h = harness_with(
            Fixture {
                cluster: Some(cluster(false)),
                ..Fixture::default()
            },
            unused_factory(),
        );

        let action = reconcile(Arc::new(sample_machine("m1")), h.ctx.clone())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(h.ctx.config.waiting_interval));
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Pending);
        assert_eq!(
            status.message.as_deref(),
            Some("waiting for IonosCloudCluster c1 to be Ready")
        );
    }

    #[tokio::test]
    async fn test_machine_waits_for_bootstrap_data() {
        let mut cloud = MockCloudClient::new();
        cloud.expect_verify_datacenter().returning(|_| Ok(()));
        cloud.expect_create_server().never();
        let h = harness_with(
            Fixture {
                bootstrap: None,
                ..Fixture::default()
            },
            factory_for(Arc::new(cloud)),
        );

        let action = reconcile(Arc::new(sample_machine("m1")), h.ctx.clone())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(h.ctx.config.waiting_interval));
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Pending);
        assert_eq!(status.message.as_deref(), Some("waiting for bootstrap data"));
    }

    #[tokio::test]
    async fn test_unknown_datacenter_fails_machine() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_verify_datacenter()
            .returning(|_| Err(CloudError::not_found("datacenter not found")));
        let h = harness(cloud);

        reconcile(Arc::new(sample_machine("m1")), h.ctx.clone())
            .await
            .expect("absorbed");

        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Failed);
        assert_eq!(status.failure_reason.as_deref(), Some("datacenter dc-1 not found"));
    }

    #[tokio::test]
    async fn test_busy_server_defers_nic_attachment() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_describe_server()
            .returning(|_, id| Ok(server(id, ResourceState::Busy)));
        cloud.expect_attach_nic().never();
        cloud.expect_allocate_ip().never();
        let h = harness(cloud);
        let machine = with_server(machine_with_phase("m1", MachinePhase::NetworkAttaching), "i1");

        let action = reconcile(Arc::new(machine), h.ctx.clone())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(h.ctx.config.poll_interval));
        assert_eq!(h.capture.last_phase(), Some(MachinePhase::NetworkAttaching));
    }

    /// Story: the server disappears behind the provider's back
    #[tokio::test]
    async fn story_externally_deleted_server_fails_machine() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_describe_server()
            .returning(|_, _| Err(CloudError::not_found("server not found")));
        cloud.expect_create_server().never();
        let h = harness(cloud);
        let machine = with_server(machine_with_phase("m1", MachinePhase::Running), "i1");

        let action = reconcile(Arc::new(machine), h.ctx.clone())
            .await
            .expect("absorbed");

        assert_eq!(action, Action::await_change());
        let status = h.capture.last();
        assert_eq!(status.phase, MachinePhase::Failed);
        assert!(!status.ready);
        assert!(status
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("deleted outside of the provider")));
    }

    #[tokio::test]
    async fn test_running_machine_only_resyncs() {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_describe_server()
            .returning(|_, id| Ok(server(id, ResourceState::Available)));
        let h = harness(cloud);
        let machine = with_server(machine_with_phase("m1", MachinePhase::Running), "i1");

        let action = reconcile(Arc::new(machine), h.ctx.clone())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(h.ctx.config.ready_resync));
        assert_eq!(h.capture.writes(), 0);
    }

    mod teardown_flow {
        use super::*;

        /// Story: m1 is deleted while its NIC is still being attached
        ///
        /// The attach is allowed to settle first; then the server is deleted
        /// and the IP block recorded by the reservation is released, and only
        /// after both report success does the finalizer go.
        #[tokio::test]
        async fn story_delete_mid_network_attaching() {
            let nic_polls = Arc::new(AtomicU32::new(0));
            let mut cloud = MockCloudClient::new();
            let seen = nic_polls.clone();
            cloud.expect_request_status().returning(move |id| {
                if id == "req-nic" && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(RequestStatus::Running)
                } else {
                    Ok(RequestStatus::Done)
                }
            });
            cloud
                .expect_delete_server()
                .withf(|dc, id| dc == "dc-1" && id == "i1")
                .times(1)
                .returning(|_, _| Ok(accepted("req-del", "i1")));
            cloud
                .expect_release_ip()
                .withf(|id| id == "ipb-1")
                .times(1)
                .returning(|_| Ok(accepted("req-rel", "ipb-1")));
            cloud.expect_find_server_by_name().never();
            cloud.expect_find_ip_block_by_name().never();

            let store = MemoryRequestStore::new();
            seed(&store, OperationKind::AttachNic, "req-nic", "nic-1").await;
            seed(&store, OperationKind::AllocateIp, "req-ip", "ipb-1").await;
            let mut h = harness_with(
                Fixture {
                    store,
                    ..Fixture::default()
                },
                factory_for(Arc::new(cloud)),
            );
            let machine = deleting(with_server(
                machine_with_phase("m1", MachinePhase::NetworkAttaching),
                "i1",
            ));

            let action = reconcile(Arc::new(machine.clone()), h.ctx.clone())
                .await
                .expect("settling");
            assert_eq!(action, Action::requeue(h.ctx.config.poll_interval));
            assert_eq!(h.capture.last_phase(), Some(MachinePhase::Deleting));
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 0);

            let action = reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
                .await
                .expect("released");
            assert_eq!(action, Action::await_change());
            let status = h.capture.last();
            assert_eq!(status.phase, MachinePhase::Deleted);
            assert!(status.instance_id.is_none());
            assert!(status.ip_block_id.is_none());
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 1);
            assert!(h.store.is_empty());
            assert_eq!(
                h.machine_removed.try_recv().ok(),
                Some(ClusterKey::new("default", "c1"))
            );
        }

        /// Deleting resources that are already gone is success, and deleting twice is a no-op
        #[tokio::test]
        async fn test_delete_of_vanished_resources_succeeds() {
            let mut cloud = MockCloudClient::new();
            cloud
                .expect_delete_server()
                .times(1)
                .returning(|_, _| Err(CloudError::not_found("server not found")));
            cloud
                .expect_release_ip()
                .times(1)
                .returning(|_| Err(CloudError::not_found("ip block not found")));
            let h = harness(cloud);
            let mut machine = deleting(with_server(
                machine_with_phase("m1", MachinePhase::Running),
                "i1",
            ));
            if let Some(status) = machine.status.as_mut() {
                status.ip_block_id = Some("ipb-1".to_string());
            }

            reconcile(Arc::new(machine.clone()), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(h.capture.last_phase(), Some(MachinePhase::Deleted));
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 1);

            reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
                .await
                .expect("second delete");
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 2);
            assert_eq!(h.capture.writes(), 1, "no further status writes");
        }

        #[tokio::test]
        async fn test_unrecorded_server_is_swept_by_name() {
            let mut cloud = MockCloudClient::new();
            cloud
                .expect_find_server_by_name()
                .withf(|dc, name| dc == "dc-1" && name == "default-m1")
                .returning(|_, _| Ok(Some(server("i7", ResourceState::Available))));
            cloud
                .expect_find_ip_block_by_name()
                .withf(|location, name| location == "de/txl" && name == "default-m1")
                .returning(|_, _| Ok(None));
            cloud
                .expect_delete_server()
                .withf(|_, id| id == "i7")
                .times(1)
                .returning(|_, _| {
                    Ok(MutationOutcome::Completed {
                        resource_id: Some("i7".to_string()),
                    })
                });
            cloud.expect_release_ip().never();
            let h = harness(cloud);

            let machine = deleting(machine_with_phase("m1", MachinePhase::Creating));
            reconcile(Arc::new(machine), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(h.capture.last_phase(), Some(MachinePhase::Deleted));
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_recorded_resources_wait_for_credentials() {
            let h = harness_with(
                Fixture {
                    secret: None,
                    ..Fixture::default()
                },
                unused_factory(),
            );
            let machine = deleting(with_server(
                machine_with_phase("m1", MachinePhase::Running),
                "i1",
            ));

            let action = reconcile(Arc::new(machine), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(action, Action::requeue(h.ctx.config.waiting_interval));
            assert_eq!(h.capture.last_phase(), Some(MachinePhase::Deleting));
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_nothing_recorded_and_no_cluster_deletes_directly() {
            let h = harness_with(
                Fixture {
                    cluster: None,
                    ..Fixture::default()
                },
                unused_factory(),
            );
            let machine = deleting(machine_with_phase("m1", MachinePhase::Pending));

            reconcile(Arc::new(machine), h.ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(h.capture.last_phase(), Some(MachinePhase::Deleted));
            assert_eq!(h.finalizer_removals.load(Ordering::SeqCst), 1);
        }
    }

    mod error_handling {
        use super::*;

        /// Story: transient failures back off and the Degraded condition clears on success
        #[tokio::test]
        async fn story_transient_errors_back_off() {
            let calls = Arc::new(AtomicU32::new(0));
            let mut cloud = MockCloudClient::new();
            let seen = calls.clone();
            cloud.expect_describe_server().returning(move |_, id| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CloudError::transient("connection reset"))
                } else {
                    Ok(server(id, ResourceState::Available))
                }
            });
            let h = harness(cloud);
            let machine = with_server(machine_with_phase("m1", MachinePhase::Running), "i1");
            let shared = Arc::new(machine.clone());

            for expected in [1, 2] {
                let err = reconcile(shared.clone(), h.ctx.clone())
                    .await
                    .expect_err("transient");
                assert!(err.is_retryable());
                let action = error_policy(shared.clone(), &err, h.ctx.clone());
                assert_eq!(action, Action::requeue(Duration::from_secs(expected)));
            }
            let status = h.capture.last();
            assert_eq!(status.phase, MachinePhase::Running);
            assert!(find_condition(&status.conditions, condition_types::DEGRADED).is_some());

            reconcile(Arc::new(observed(&machine, &h.capture)), h.ctx.clone())
                .await
                .expect("recovered");
            let after = h.capture.last();
            assert!(find_condition(&after.conditions, condition_types::DEGRADED).is_none());

            let action = error_policy(shared, &Error::internal("boom"), h.ctx.clone());
            assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        }

        #[tokio::test]
        async fn test_invalid_spec_fails_machine() {
            let mut machine = sample_machine("m1");
            machine.spec.memory_mb = 1000;
            let h = harness_with(Fixture::default(), unused_factory());

            reconcile(Arc::new(machine), h.ctx.clone())
                .await
                .expect("absorbed");
            let status = h.capture.last();
            assert_eq!(status.phase, MachinePhase::Failed);
            assert!(status
                .failure_reason
                .as_deref()
                .is_some_and(|r| r.contains("multiple of 256")));
        }
    }
}
