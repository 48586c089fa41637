//! Kubernetes helpers shared by both controllers
//!
//! Finalizer handling, optimistic-concurrency status writes, conflict retry
//! and a few lookups. Everything is generic over namespaced resources.

use std::future::Future;

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, FIELD_MANAGER};

/// Status field owned by the request store and never written by reconcilers
pub const LEDGER_FIELD: &str = "provisioningRequests";

/// `namespace/name` of an object, for logs and error context
pub fn resource_name<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Object reference used when publishing events
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    obj.object_ref(&())
}

/// Whether the API error carries the given status code
pub fn is_api_error(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

/// Check if an object carries the finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add a finalizer, preserving any others
///
/// The patch carries the read `resourceVersion` so a concurrent finalizer
/// change surfaces as a conflict instead of being overwritten.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, obj, finalizers).await
}

/// Remove a finalizer, preserving any others
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    patch_finalizers(api, obj, finalizers).await
}

async fn patch_finalizers<K>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": obj.meta().resource_version,
            "finalizers": finalizers,
        }
    });
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        // Object already gone: nothing left to guard
        Err(e) if is_api_error(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge-patch body turning the `live` status into `status`
///
/// Status fields are skipped when empty, and a merge patch leaves absent keys
/// untouched, so every key `live` carries that `status` dropped is sent as an
/// explicit `null`. The request ledger is never part of the body.
pub fn status_patch_body<S: Serialize>(live: Option<&S>, status: &S) -> Result<serde_json::Value, Error> {
    let mut value = to_json_object(status)?;
    if let Some(live) = live {
        let previous = to_json_object(live)?;
        for key in previous.as_object().into_iter().flat_map(|m| m.keys()) {
            if let Some(map) = value.as_object_mut() {
                map.entry(key.clone()).or_insert(serde_json::Value::Null);
            }
        }
    }
    if let Some(map) = value.as_object_mut() {
        map.remove(LEDGER_FIELD);
    }
    Ok(value)
}

fn to_json_object<S: Serialize>(status: &S) -> Result<serde_json::Value, Error> {
    serde_json::to_value(status)
        .map_err(|e| Error::serialization(format!("failed to serialize status: {}", e)))
}

/// Merge-patch the status sub-resource, guarded by `resource_version`
///
/// A stale version fails with 409, which [`retry_on_conflict`] handles.
pub async fn patch_status_guarded<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    status: serde_json::Value,
) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    });
    let updated = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(updated)
}

/// Merge-patch part of the status sub-resource without a version guard
pub async fn patch_status_fields<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    fields: serde_json::Value,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": fields });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run `op` again while it fails with an optimistic-concurrency conflict
///
/// `op` receives the zero-based attempt number so it can re-read the live
/// object on retries. Non-conflict errors are returned immediately.
pub async fn retry_on_conflict<F, Fut, T>(
    attempts: u32,
    resource: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => {
                debug!(resource, attempt, "Conflict on write, re-reading and retrying");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::conflict(resource, "conflict retries exhausted")))
}

/// Fetch a Secret, `None` if it does not exist
pub async fn get_secret(client: &Client, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Build an ApiResource from an apiVersion string and kind
///
/// Used for Cluster API objects read as `DynamicObject`.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    }
}
