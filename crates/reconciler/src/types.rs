//! Core types for the reconciler.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use serde::{Deserialize, Serialize};

/// Name of the ConfigMap that records installed versions. Its presence is
/// required for the agent to run, and it owns the agent Deployment.
pub const VERSIONS_CONFIG_MAP: &str = "universal-crossplane-config";

/// Name of the managed agent Deployment.
pub const AGENT_DEPLOYMENT: &str = "upbound-agent";

/// Key of the bearer token inside the token Secret.
pub const TOKEN_KEY: &str = "token";

/// Label marking objects managed by this controller.
pub const LABEL_KEY_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_KEY_MANAGED_BY`].
pub const LABEL_VALUE_MANAGED_BY: &str = "universal-crossplane";

/// Controller name used in logs.
pub const CONTROLLER_NAME: &str = "upboundAgent";

/// Default bound on a single reconcile invocation.
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Namespaced identifier of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of objects this controller reads, writes or watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    Deployment,
}

impl ResourceKind {
    /// API kind string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable reconciler configuration, injected at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Desired spec of the agent Deployment.
    pub deployment_spec: DeploymentSpec,
    /// Name of the watched token Secret.
    pub token_secret_name: String,
    /// Upper bound for one invocation.
    pub reconcile_timeout: Duration,
}

impl ReconcilerConfig {
    /// Create a configuration with the default timeout.
    pub fn new(token_secret_name: impl Into<String>, deployment_spec: DeploymentSpec) -> Self {
        Self {
            deployment_spec,
            token_secret_name: token_secret_name.into(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Set the reconcile timeout.
    #[must_use]
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }
}

/// What an upsert did to the live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The object did not exist and was created.
    Created,
    /// The object existed and was written back with changes.
    Updated,
    /// The object already matched; nothing was written.
    Unchanged,
}

impl OperationResult {
    /// Whether a write was issued.
    pub const fn mutated(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Terminal state of one successful invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No versions ConfigMap; nothing to own the agent with.
    VersionsRecordMissing,
    /// Token Secret is gone and the agent Deployment was deleted.
    WorkloadDeleted,
    /// Token Secret is gone and the agent Deployment was already absent.
    WorkloadAlreadyAbsent,
    /// Token Secret exists but carries no token yet.
    TokenNotProvisioned,
    /// Agent Deployment was upserted.
    WorkloadSynced(OperationResult),
}

impl ReconcileOutcome {
    /// Whether this invocation wrote to the store.
    pub const fn mutated(self) -> bool {
        match self {
            Self::WorkloadDeleted => true,
            Self::WorkloadSynced(op) => op.mutated(),
            Self::VersionsRecordMissing | Self::WorkloadAlreadyAbsent | Self::TokenNotProvisioned => {
                false
            }
        }
    }
}

/// Result of a successful invocation, reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Ask the scheduler to re-run after this delay.
    pub requeue_after: Option<Duration>,
    /// What the invocation did.
    pub outcome: ReconcileOutcome,
}

impl ReconcileResult {
    /// A result that waits for the next change notification.
    pub const fn done(outcome: ReconcileOutcome) -> Self {
        Self {
            requeue_after: None,
            outcome,
        }
    }
}

/// A change notification delivered by the watch layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

impl Notification {
    /// Create a notification.
    pub const fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}
