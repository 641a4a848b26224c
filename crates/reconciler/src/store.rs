//! Object store trait and implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::{StoreError, StoreResult};
use crate::types::{ObjectKey, ResourceKind};

/// Trait for the object store backing the reconciler.
///
/// Every operation reports an absent object as [`StoreError::NotFound`], so
/// callers can tell "gone" apart from "failed".
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a ConfigMap.
    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<ConfigMap>;

    /// Read a Secret.
    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret>;

    /// Read a Deployment.
    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Deployment>;

    /// Create a Deployment. Fails with `AlreadyExists` if the name is taken.
    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment>;

    /// Replace a Deployment. When the object carries a resource version the
    /// write only succeeds if it still matches the stored one.
    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment>;

    /// Delete a Deployment. Objects it owns are collected by the store.
    async fn delete_deployment(&self, key: &ObjectKey) -> StoreResult<()>;
}

/// Key of an object from its metadata.
pub fn key_of(meta: &ObjectMeta) -> ObjectKey {
    ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// Store operations, used to target failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetConfigMap,
    GetSecret,
    GetDeployment,
    CreateDeployment,
    UpdateDeployment,
    DeleteDeployment,
}

/// A write issued through the [`ObjectStore`] interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Created(ObjectKey),
    Updated(ObjectKey),
    Deleted(ObjectKey),
}

#[derive(Default)]
struct StoreState {
    config_maps: HashMap<ObjectKey, ConfigMap>,
    secrets: HashMap<ObjectKey, Secret>,
    deployments: HashMap<ObjectKey, Deployment>,
    revision: u64,
    mutations: Vec<Mutation>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
}

impl StoreState {
    fn next_revision(&mut self) -> String {
        self.revision = self.revision.saturating_add(1);
        self.revision.to_string()
    }

    fn stamp(&mut self, meta: &mut ObjectMeta) {
        meta.resource_version = Some(self.next_revision());
        if meta.uid.is_none() {
            meta.uid = Some(Ulid::new().to_string());
        }
    }

    fn take_failure(&mut self, op: StoreOp) -> StoreResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop every Deployment whose owner references point at `uid`.
    fn collect_owned(&mut self, uid: &str) -> usize {
        let before = self.deployments.len();
        self.deployments.retain(|_, deployment| {
            !deployment
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
        });
        before.saturating_sub(self.deployments.len())
    }
}

/// Strongly consistent in-memory store for testing.
///
/// Stamps resource versions and UIDs like an API server, enforces
/// compare-and-swap on updates, and garbage-collects Deployments owned by a
/// ConfigMap when that ConfigMap is removed.
#[derive(Default)]
pub struct InMemoryObjectStore {
    state: RwLock<StoreState>,
    latency: Option<Duration>,
}

impl InMemoryObjectStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Delay every store call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next call of `op` fail with `err`. Injected failures queue up.
    pub async fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Insert or replace a ConfigMap, as an external actor would.
    pub async fn put_config_map(&self, mut config_map: ConfigMap) -> ConfigMap {
        let mut state = self.state.write().await;
        let key = key_of(&config_map.metadata);
        if let Some(existing) = state.config_maps.get(&key) {
            config_map.metadata.uid.clone_from(&existing.metadata.uid);
        }
        state.stamp(&mut config_map.metadata);
        state.config_maps.insert(key, config_map.clone());
        config_map
    }

    /// Remove a ConfigMap and cascade to the Deployments it owns.
    pub async fn remove_config_map(&self, key: &ObjectKey) -> bool {
        let mut state = self.state.write().await;
        let removed = state.config_maps.remove(key);
        match removed {
            Some(removed) => {
                if let Some(uid) = removed.metadata.uid.as_deref() {
                    let collected = state.collect_owned(uid);
                    tracing::debug!(config_map = %key, collected, "Garbage collected dependents");
                }
                true
            }
            None => false,
        }
    }

    /// Insert or replace a Secret. `stringData` is folded into `data` the way
    /// the API server does on write.
    pub async fn put_secret(&self, mut secret: Secret) -> Secret {
        if let Some(string_data) = secret.string_data.take() {
            let data = secret.data.get_or_insert_with(Default::default);
            for (k, v) in string_data {
                data.insert(k, ByteString(v.into_bytes()));
            }
        }

        let mut state = self.state.write().await;
        let key = key_of(&secret.metadata);
        if let Some(existing) = state.secrets.get(&key) {
            secret.metadata.uid.clone_from(&existing.metadata.uid);
        }
        state.stamp(&mut secret.metadata);
        state.secrets.insert(key, secret.clone());
        secret
    }

    /// Remove a Secret.
    pub async fn remove_secret(&self, key: &ObjectKey) -> bool {
        self.state.write().await.secrets.remove(key).is_some()
    }

    /// Insert a Deployment directly, bypassing the mutation log.
    pub async fn put_deployment(&self, mut deployment: Deployment) -> Deployment {
        let mut state = self.state.write().await;
        let key = key_of(&deployment.metadata);
        state.stamp(&mut deployment.metadata);
        state.deployments.insert(key, deployment.clone());
        deployment
    }

    /// Change a stored Deployment as another actor would, bumping its
    /// resource version. Returns false if the Deployment does not exist.
    pub async fn modify_deployment<F>(&self, key: &ObjectKey, f: F) -> bool
    where
        F: FnOnce(&mut Deployment),
    {
        let mut state = self.state.write().await;
        let Some(mut deployment) = state.deployments.get(key).cloned() else {
            return false;
        };
        f(&mut deployment);
        state.stamp(&mut deployment.metadata);
        state.deployments.insert(key.clone(), deployment);
        true
    }

    /// Current ConfigMap, if any.
    pub async fn config_map(&self, key: &ObjectKey) -> Option<ConfigMap> {
        self.state.read().await.config_maps.get(key).cloned()
    }

    /// Current Secret, if any.
    pub async fn secret(&self, key: &ObjectKey) -> Option<Secret> {
        self.state.read().await.secrets.get(key).cloned()
    }

    /// Current Deployment, if any.
    pub async fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        self.state.read().await.deployments.get(key).cloned()
    }

    /// Writes issued through the [`ObjectStore`] interface, oldest first.
    pub async fn mutations(&self) -> Vec<Mutation> {
        self.state.read().await.mutations.clone()
    }

    /// Number of writes issued through the [`ObjectStore`] interface.
    pub async fn mutation_count(&self) -> usize {
        self.state.read().await.mutations.len()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<ConfigMap> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::GetConfigMap)?;
        state
            .config_maps
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ResourceKind::ConfigMap, key.clone()))
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::GetSecret)?;
        state
            .secrets
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ResourceKind::Secret, key.clone()))
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Deployment> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::GetDeployment)?;
        state
            .deployments
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ResourceKind::Deployment, key.clone()))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::CreateDeployment)?;

        let key = key_of(&deployment.metadata);
        if key.name.is_empty() {
            return Err(StoreError::api("deployment name is required"));
        }
        if state.deployments.contains_key(&key) {
            return Err(StoreError::already_exists(ResourceKind::Deployment, key));
        }

        let mut created = deployment.clone();
        created.metadata.uid = None;
        state.stamp(&mut created.metadata);
        state.deployments.insert(key.clone(), created.clone());
        state.mutations.push(Mutation::Created(key));
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::UpdateDeployment)?;

        let key = key_of(&deployment.metadata);
        let Some(stored) = state.deployments.get(&key) else {
            return Err(StoreError::not_found(ResourceKind::Deployment, key));
        };

        let expected = deployment.metadata.resource_version.as_ref();
        if expected.is_some() && expected != stored.metadata.resource_version.as_ref() {
            return Err(StoreError::conflict(ResourceKind::Deployment, key));
        }

        let mut updated = deployment.clone();
        updated.metadata.uid.clone_from(&stored.metadata.uid);
        state.stamp(&mut updated.metadata);
        state.deployments.insert(key.clone(), updated.clone());
        state.mutations.push(Mutation::Updated(key));
        Ok(updated)
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> StoreResult<()> {
        self.delay().await;
        let mut state = self.state.write().await;
        state.take_failure(StoreOp::DeleteDeployment)?;

        if state.deployments.remove(key).is_none() {
            return Err(StoreError::not_found(ResourceKind::Deployment, key.clone()));
        }
        state.mutations.push(Mutation::Deleted(key.clone()));
        Ok(())
    }
}

/// A wrapper that adds tracing to an object store.
pub struct TracingObjectStore<S: ObjectStore> {
    inner: S,
}

impl<S: ObjectStore> TracingObjectStore<S> {
    /// Create a new tracing object store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn trace_result<T>(op: StoreOp, key: &ObjectKey, result: &StoreResult<T>) {
    match result {
        Ok(_) => tracing::trace!(op = ?op, key = %key, "Store call succeeded"),
        Err(e) if e.is_not_found() => tracing::trace!(op = ?op, key = %key, "Object not found"),
        Err(e) => tracing::debug!(op = ?op, key = %key, error = %e, "Store call failed"),
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for TracingObjectStore<S> {
    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<ConfigMap> {
        tracing::debug!(key = %key, "Getting config map");
        let result = self.inner.get_config_map(key).await;
        trace_result(StoreOp::GetConfigMap, key, &result);
        result
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        tracing::debug!(key = %key, "Getting secret");
        let result = self.inner.get_secret(key).await;
        trace_result(StoreOp::GetSecret, key, &result);
        result
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Deployment> {
        tracing::debug!(key = %key, "Getting deployment");
        let result = self.inner.get_deployment(key).await;
        trace_result(StoreOp::GetDeployment, key, &result);
        result
    }

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = key_of(&deployment.metadata);
        tracing::debug!(key = %key, "Creating deployment");
        let result = self.inner.create_deployment(deployment).await;
        trace_result(StoreOp::CreateDeployment, &key, &result);
        result
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = key_of(&deployment.metadata);
        tracing::debug!(
            key = %key,
            resource_version = ?deployment.metadata.resource_version,
            "Updating deployment"
        );
        let result = self.inner.update_deployment(deployment).await;
        trace_result(StoreOp::UpdateDeployment, &key, &result);
        result
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> StoreResult<()> {
        tracing::debug!(key = %key, "Deleting deployment");
        let result = self.inner.delete_deployment(key).await;
        trace_result(StoreOp::DeleteDeployment, key, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn deployment(namespace: &str, name: &str) -> Deployment {
        Deployment {
            metadata: meta(namespace, name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let result = store.get_secret(&ObjectKey::new("ns", "token")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_create_stamps_and_rejects_duplicates() {
        let store = InMemoryObjectStore::new();
        let created = store.create_deployment(&deployment("ns", "agent")).await;
        assert!(created.is_ok());
        let created = created.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());

        let duplicate = store.create_deployment(&deployment("ns", "agent")).await;
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists { .. })));
        assert_eq!(store.mutation_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = InMemoryObjectStore::new();
        let key = ObjectKey::new("ns", "agent");
        let created = store.create_deployment(&deployment("ns", "agent")).await.unwrap();

        // Another actor writes in between.
        assert!(
            store
                .modify_deployment(&key, |d| {
                    d.metadata.labels = Some(BTreeMap::from([("x".into(), "y".into())]));
                })
                .await
        );

        let result = store.update_deployment(&created).await;
        assert!(result.is_err_and(|e| e.is_conflict()));
    }

    #[tokio::test]
    async fn test_update_with_current_version_succeeds() {
        let store = InMemoryObjectStore::new();
        let created = store.create_deployment(&deployment("ns", "agent")).await.unwrap();

        let updated = store.update_deployment(&created).await.unwrap();
        assert_ne!(
            updated.metadata.resource_version,
            created.metadata.resource_version
        );
        assert_eq!(updated.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let result = store.delete_deployment(&ObjectKey::new("ns", "agent")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
        assert_eq!(store.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_removing_owner_collects_dependents() {
        let store = InMemoryObjectStore::new();
        let owner = store
            .put_config_map(ConfigMap {
                metadata: meta("ns", "versions"),
                ..Default::default()
            })
            .await;

        let mut owned = deployment("ns", "agent");
        owned.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "versions".into(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        store.put_deployment(owned).await;
        store.put_deployment(deployment("ns", "unrelated")).await;

        assert!(store.remove_config_map(&ObjectKey::new("ns", "versions")).await);
        assert!(store.deployment(&ObjectKey::new("ns", "agent")).await.is_none());
        assert!(store.deployment(&ObjectKey::new("ns", "unrelated")).await.is_some());
    }

    #[tokio::test]
    async fn test_string_data_folds_into_data() {
        let store = InMemoryObjectStore::new();
        let stored = store
            .put_secret(Secret {
                metadata: meta("ns", "token"),
                string_data: Some(BTreeMap::from([("token".into(), "abc123".into())])),
                ..Default::default()
            })
            .await;

        assert!(stored.string_data.is_none());
        let token = stored.data.as_ref().and_then(|d| d.get("token"));
        assert_eq!(token, Some(&ByteString(b"abc123".to_vec())));
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once_in_order() {
        let store = InMemoryObjectStore::new();
        let key = ObjectKey::new("ns", "versions");
        store
            .fail_next(StoreOp::GetConfigMap, StoreError::api("first"))
            .await;
        store
            .fail_next(StoreOp::GetConfigMap, StoreError::api("second"))
            .await;

        assert_eq!(
            store.get_config_map(&key).await.err(),
            Some(StoreError::api("first"))
        );
        assert_eq!(
            store.get_config_map(&key).await.err(),
            Some(StoreError::api("second"))
        );
        assert!(store.get_config_map(&key).await.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_tracing_store_delegates() {
        let store = TracingObjectStore::new(InMemoryObjectStore::new());
        let created = store.create_deployment(&deployment("ns", "agent")).await;
        assert!(created.is_ok());
        assert!(store.get_deployment(&ObjectKey::new("ns", "agent")).await.is_ok());
        assert!(store.delete_deployment(&ObjectKey::new("ns", "agent")).await.is_ok());
    }
}
