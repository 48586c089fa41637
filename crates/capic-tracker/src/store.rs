//! Persistence of tracked requests
//!
//! Production entries live in the owning resource's
//! `status.provisioningRequests`, so they survive a controller restart
//! together with the object they belong to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use capic_common::crd::{
    IonosCloudCluster, IonosCloudMachine, OperationKind, ProvisioningRequest, ResourceKey,
    ResourceKind,
};
use capic_common::kube_utils::{is_api_error, patch_status_fields, LEDGER_FIELD};
use capic_common::Error;
use dashmap::DashMap;
use kube::api::Api;
use kube::Client;
use tracing::trace;

/// Durable map keyed by `(resource, operation kind)`
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Entry for the pair, if any
    async fn get(
        &self,
        key: &ResourceKey,
        kind: OperationKind,
    ) -> Result<Option<ProvisioningRequest>, Error>;

    /// Insert or replace the entry for the request's pair
    async fn put(&self, request: &ProvisioningRequest) -> Result<(), Error>;

    /// Remove the entry; removing a missing entry succeeds
    async fn remove(&self, key: &ResourceKey, kind: OperationKind) -> Result<(), Error>;

    /// All entries of a resource
    async fn list(&self, key: &ResourceKey) -> Result<Vec<ProvisioningRequest>, Error>;
}

/// In-process store
///
/// Clones share the same map, so a "restarted" tracker built from a clone
/// sees everything the previous one recorded.
#[derive(Clone, Default)]
pub struct MemoryRequestStore {
    entries: Arc<DashMap<(ResourceKey, OperationKind), ProvisioningRequest>>,
}

impl MemoryRequestStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all resources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn get(
        &self,
        key: &ResourceKey,
        kind: OperationKind,
    ) -> Result<Option<ProvisioningRequest>, Error> {
        Ok(self
            .entries
            .get(&(key.clone(), kind))
            .map(|e| e.value().clone()))
    }

    async fn put(&self, request: &ProvisioningRequest) -> Result<(), Error> {
        self.entries.insert(
            (request.resource_key.clone(), request.operation_kind),
            request.clone(),
        );
        Ok(())
    }

    async fn remove(&self, key: &ResourceKey, kind: OperationKind) -> Result<(), Error> {
        self.entries.remove(&(key.clone(), kind));
        Ok(())
    }

    async fn list(&self, key: &ResourceKey) -> Result<Vec<ProvisioningRequest>, Error> {
        let mut out: Vec<ProvisioningRequest> = self
            .entries
            .iter()
            .filter(|e| &e.key().0 == key)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.operation_kind);
        Ok(out)
    }
}

/// Store backed by the resource's status sub-resource
///
/// Reads go to the API server directly, never to a watch cache, so an entry
/// written by the previous pass is always visible to the next one.
#[derive(Clone)]
pub struct KubeRequestStore {
    client: Client,
}

impl KubeRequestStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn ledger(&self, key: &ResourceKey) -> Result<BTreeMap<String, ProvisioningRequest>, Error> {
        let ledger = match key.kind {
            ResourceKind::Cluster => {
                let api: Api<IonosCloudCluster> = Api::namespaced(self.client.clone(), &key.namespace);
                api.get_opt(&key.name)
                    .await?
                    .and_then(|c| c.status)
                    .map(|s| s.provisioning_requests)
            }
            ResourceKind::Machine => {
                let api: Api<IonosCloudMachine> = Api::namespaced(self.client.clone(), &key.namespace);
                api.get_opt(&key.name)
                    .await?
                    .and_then(|m| m.status)
                    .map(|s| s.provisioning_requests)
            }
        };
        Ok(ledger.unwrap_or_default())
    }

    async fn patch_ledger(&self, key: &ResourceKey, entries: serde_json::Value) -> Result<(), Error> {
        let fields = serde_json::json!({ LEDGER_FIELD: entries });
        match key.kind {
            ResourceKind::Cluster => {
                patch_status_fields::<IonosCloudCluster>(&self.client, &key.namespace, &key.name, fields)
                    .await
            }
            ResourceKind::Machine => {
                patch_status_fields::<IonosCloudMachine>(&self.client, &key.namespace, &key.name, fields)
                    .await
            }
        }
    }
}

#[async_trait]
impl RequestStore for KubeRequestStore {
    async fn get(
        &self,
        key: &ResourceKey,
        kind: OperationKind,
    ) -> Result<Option<ProvisioningRequest>, Error> {
        Ok(self.ledger(key).await?.remove(kind.as_str()))
    }

    async fn put(&self, request: &ProvisioningRequest) -> Result<(), Error> {
        let key = &request.resource_key;
        trace!(resource = %key, kind = %request.operation_kind, "Persisting request");
        let entry = serde_json::to_value(request)
            .map_err(|e| Error::serialization_for_kind("ProvisioningRequest", e.to_string()))?;
        self.patch_ledger(
            key,
            serde_json::json!({ request.operation_kind.as_str(): entry }),
        )
        .await
    }

    async fn remove(&self, key: &ResourceKey, kind: OperationKind) -> Result<(), Error> {
        // null deletes the map key in a merge patch
        match self
            .patch_ledger(key, serde_json::json!({ kind.as_str(): null }))
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::Kube { source }) if is_api_error(&source, 404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, key: &ResourceKey) -> Result<Vec<ProvisioningRequest>, Error> {
        Ok(self.ledger(key).await?.into_values().collect())
    }
}
