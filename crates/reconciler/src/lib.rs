//! K8s-style reconciler for the Upbound agent.
//!
//! Keeps the `upbound-agent` Deployment in a namespace consistent with two
//! inputs:
//!
//! - **Versions ConfigMap** (`universal-crossplane-config`): its presence
//!   means the installation is live. It owns the agent Deployment, so the
//!   Deployment is garbage collected when the ConfigMap goes away.
//! - **Token Secret**: carries the control plane token under `token`. With a
//!   token the agent runs; once the Secret is gone the agent is removed.
//!
//! # Pieces
//!
//! - [`AgentReconciler`] reads fresh state and issues at most one write per
//!   invocation.
//! - [`ObjectStore`] is the seam to the cluster, with [`KubeObjectStore`] for
//!   the API server and [`InMemoryObjectStore`] for tests.
//! - [`ReconciliationLoop`] turns watch notifications into reconcile requests
//!   and retries failures with backoff.
//!
//! # Example
//!
//! ```ignore
//! use agent_sync_reconciler::{
//!     InMemoryObjectStore, LoopConfig, ReconcilerBuilder, ReconciliationLoop,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryObjectStore::new_arc();
//!     let reconciler = ReconcilerBuilder::new()
//!         .with_store(store)
//!         .token_secret_name("upbound-control-plane-token")
//!         .build()
//!         .unwrap();
//!
//!     let mut loop_runner = ReconciliationLoop::new(Arc::new(reconciler), LoopConfig::default());
//!
//!     // Run until stopped
//!     // loop_runner.run(notifications).await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod kube_store;
pub mod kube_watch;
pub mod r#loop;
pub mod predicates;
pub mod reconciler;
pub mod store;
pub mod sync;
pub mod types;

// Re-export main types
pub use error::{Error, Result, StoreError, StoreResult};
pub use kube_store::KubeObjectStore;
pub use r#loop::{LoopConfig, LoopStats, LoopStopper, ReconciliationLoop};
pub use predicates::{Predicate, agent_watch_predicate};
pub use reconciler::{AgentReconciler, ReconcilerBuilder};
pub use store::{InMemoryObjectStore, Mutation, ObjectStore, StoreOp, TracingObjectStore};
pub use sync::create_or_update;
pub use types::{
    AGENT_DEPLOYMENT, LABEL_KEY_MANAGED_BY, LABEL_VALUE_MANAGED_BY, Notification, ObjectKey,
    OperationResult, ReconcileOutcome, ReconcileResult, ReconcilerConfig, ResourceKind, TOKEN_KEY,
    VERSIONS_CONFIG_MAP,
};
