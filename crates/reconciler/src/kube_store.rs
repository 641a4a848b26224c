//! Object store backed by the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectStore, key_of};
use crate::types::{ObjectKey, ResourceKind};

/// [`ObjectStore`] talking to the API server through a `kube::Client`.
///
/// Updates are plain replaces carrying the object's `resourceVersion`, so the
/// API server rejects them with 409 when the object changed underneath.
/// Deletes use background propagation and leave dependents to the garbage
/// collector.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store from a client.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a client error onto the store taxonomy.
fn store_error(kind: ResourceKind, key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(kind, key.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::already_exists(kind, key.clone())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::conflict(kind, key.clone()),
        other => StoreError::api(other.to_string()),
    }
}

fn require_namespace(deployment: &Deployment) -> StoreResult<ObjectKey> {
    let key = key_of(&deployment.metadata);
    if key.namespace.is_empty() || key.name.is_empty() {
        return Err(StoreError::api("deployment name and namespace are required"));
    }
    Ok(key)
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<ConfigMap> {
        self.config_maps(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| store_error(ResourceKind::ConfigMap, key, e))
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        self.secrets(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| store_error(ResourceKind::Secret, key, e))
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Deployment> {
        self.deployments(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| store_error(ResourceKind::Deployment, key, e))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = require_namespace(deployment)?;
        self.deployments(&key.namespace)
            .create(&PostParams::default(), deployment)
            .await
            .map_err(|e| store_error(ResourceKind::Deployment, &key, e))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = require_namespace(deployment)?;
        self.deployments(&key.namespace)
            .replace(&key.name, &PostParams::default(), deployment)
            .await
            .map_err(|e| store_error(ResourceKind::Deployment, &key, e))
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> StoreResult<()> {
        self.deployments(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| store_error(ResourceKind::Deployment, key, e))
    }
}
