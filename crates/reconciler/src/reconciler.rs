//! Reconciler implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result, StoreError, StoreResult};
use crate::predicates::{Predicate, agent_watch_predicate};
use crate::store::ObjectStore;
use crate::sync::create_or_update;
use crate::types::{
    AGENT_DEPLOYMENT, CONTROLLER_NAME, DEFAULT_RECONCILE_TIMEOUT, LABEL_KEY_MANAGED_BY,
    LABEL_VALUE_MANAGED_BY, ObjectKey, ReconcileOutcome, ReconcileResult, ReconcilerConfig,
    TOKEN_KEY, VERSIONS_CONFIG_MAP,
};

/// Keeps the agent Deployment in line with the versions ConfigMap and the
/// control plane token Secret.
///
/// Holds only immutable configuration and a handle to the store, so one
/// instance can serve concurrent invocations for different namespaces.
pub struct AgentReconciler {
    store: Arc<dyn ObjectStore>,
    config: ReconcilerConfig,
}

impl AgentReconciler {
    /// Create a new reconciler.
    pub fn new(store: Arc<dyn ObjectStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    /// Reconcile after a change to the object named by `request`.
    ///
    /// The request does not say which kind of object changed; all state is
    /// read fresh. At most one write is issued per invocation, and every
    /// store call is bounded by the configured reconcile timeout.
    ///
    /// # Errors
    ///
    /// Returns a transient error wrapping the failed store call. The caller
    /// is expected to retry with backoff.
    #[instrument(skip(self, request), fields(controller = CONTROLLER_NAME, request = %request))]
    pub async fn reconcile(&self, request: &ObjectKey) -> Result<ReconcileResult> {
        debug!("Reconciling...");
        let deadline = Instant::now() + self.config.reconcile_timeout;

        // The agent Deployment is owned by the versions ConfigMap and is
        // garbage collected once the ConfigMap no longer exists.
        let versions_key = ObjectKey::new(&request.namespace, VERSIONS_CONFIG_MAP);
        let config_map = match self
            .bounded(deadline, self.store.get_config_map(&versions_key))
            .await
        {
            Ok(config_map) => config_map,
            Err(e) if e.is_not_found() => {
                debug!(config_map = %versions_key, "Versions config map not found, nothing to do");
                return Ok(ReconcileResult::done(ReconcileOutcome::VersionsRecordMissing));
            }
            Err(e) => return Err(Self::failed(Error::versions_record_read(e))),
        };

        let namespace = config_map
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| request.namespace.clone());

        let secret = match self.bounded(deadline, self.store.get_secret(request)).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                // The token Secret was deleted, so the agent goes with it.
                return self.delete_agent(deadline, &namespace).await;
            }
            Err(e) => return Err(Self::failed(Error::token_secret_read(e))),
        };

        if token_of(&secret).is_none() {
            // Not an error: the next update of the Secret triggers us again.
            info!(
                secret = %self.config.token_secret_name,
                key = TOKEN_KEY,
                "Secret does not contain a token for key"
            );
            return Ok(ReconcileResult::done(ReconcileOutcome::TokenNotProvisioned));
        }

        let template = agent_deployment(&config_map, &namespace);
        let spec = self.config.deployment_spec.clone();
        let op = self
            .bounded(
                deadline,
                create_or_update(&*self.store, template, move |deployment| {
                    deployment.spec = Some(spec);
                }),
            )
            .await
            .map_err(|e| Self::failed(Error::workload_sync(e)))?;

        info!(operation = ?op, "Successfully synced Upbound Agent deployment!");
        Ok(ReconcileResult::done(ReconcileOutcome::WorkloadSynced(op)))
    }

    async fn delete_agent(&self, deadline: Instant, namespace: &str) -> Result<ReconcileResult> {
        let agent_key = ObjectKey::new(namespace, AGENT_DEPLOYMENT);

        match self
            .bounded(deadline, self.store.delete_deployment(&agent_key))
            .await
        {
            Ok(()) => {
                info!(deployment = %agent_key, "Token secret is gone, deleted agent deployment");
                Ok(ReconcileResult::done(ReconcileOutcome::WorkloadDeleted))
            }
            Err(e) if e.is_not_found() => {
                debug!(deployment = %agent_key, "Token secret is gone, agent deployment already absent");
                Ok(ReconcileResult::done(ReconcileOutcome::WorkloadAlreadyAbsent))
            }
            Err(e) => Err(Self::failed(Error::workload_delete(e))),
        }
    }

    /// Run a store call under the invocation deadline.
    async fn bounded<T, F>(&self, deadline: Instant, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout_at(deadline, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::deadline_exceeded(self.config.reconcile_timeout)))
    }

    fn failed(err: Error) -> Error {
        warn!(error = %err, "Reconcile failed");
        err
    }

    /// Predicate selecting the notifications this reconciler cares about.
    pub fn predicate(&self) -> Predicate {
        agent_watch_predicate(&self.config.token_secret_name)
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Non-empty token held by the Secret, if any.
fn token_of(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(TOKEN_KEY)
        .map(|token| token.0.as_slice())
        .filter(|token| !token.is_empty())
}

/// Skeleton of the agent Deployment used when it does not exist yet.
fn agent_deployment(config_map: &ConfigMap, namespace: &str) -> Deployment {
    let owner = config_map.controller_owner_ref(&());
    if owner.is_none() {
        warn!(
            config_map = ?config_map.metadata.name,
            "Versions config map has no name or uid, agent deployment will not be garbage collected"
        );
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(AGENT_DEPLOYMENT.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_KEY_MANAGED_BY.to_string(),
                LABEL_VALUE_MANAGED_BY.to_string(),
            )])),
            owner_references: owner.map(|owner| {
                vec![OwnerReference {
                    block_owner_deletion: Some(true),
                    ..owner
                }]
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Builder for [`AgentReconciler`].
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    token_secret_name: Option<String>,
    deployment_spec: DeploymentSpec,
    reconcile_timeout: Duration,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            token_secret_name: None,
            deployment_spec: DeploymentSpec::default(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Set the object store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Take every setting from a configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.token_secret_name = Some(config.token_secret_name);
        self.deployment_spec = config.deployment_spec;
        self.reconcile_timeout = config.reconcile_timeout;
        self
    }

    /// Set the watched token Secret name.
    #[must_use]
    pub fn token_secret_name(mut self, name: impl Into<String>) -> Self {
        self.token_secret_name = Some(name.into());
        self
    }

    /// Set the desired agent Deployment spec.
    #[must_use]
    pub fn deployment_spec(mut self, spec: DeploymentSpec) -> Self {
        self.deployment_spec = spec;
        self
    }

    /// Set the per-invocation timeout.
    #[must_use]
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the store or token Secret name is missing,
    /// or the timeout is zero.
    pub fn build(self) -> Result<AgentReconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("object store is required"))?;

        let token_secret_name = self
            .token_secret_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid_config("token secret name is required"))?;

        if self.reconcile_timeout.is_zero() {
            return Err(Error::invalid_config("reconcile timeout must be positive"));
        }

        let config = ReconcilerConfig::new(token_secret_name, self.deployment_spec)
            .with_reconcile_timeout(self.reconcile_timeout);
        Ok(AgentReconciler::new(store, config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
