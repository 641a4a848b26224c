//! Notification-driven reconciliation loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::predicates::Predicate;
use crate::reconciler::AgentReconciler;
use crate::types::{Notification, ObjectKey, ResourceKind};

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Delay before the first retry of a failed request.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_max: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(300),
        }
    }
}

impl LoopConfig {
    /// Delay before retry number `attempt` (1-based). Doubles each time up to
    /// `retry_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .map_or(self.retry_max, |delay| delay.min(self.retry_max))
    }
}

/// Counters for what the loop has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Invocations that returned successfully.
    pub reconciled: u64,
    /// Invocations that failed and were scheduled for retry.
    pub failed: u64,
    /// Notifications dropped by the predicate.
    pub filtered: u64,
}

/// Runs the reconciler for every relevant change notification.
///
/// Requests are processed one at a time. A failed request is retried with
/// exponential backoff tracked per request; the first success resets it.
/// At most one retry per request is pending at any time.
pub struct ReconciliationLoop {
    reconciler: Arc<AgentReconciler>,
    predicate: Predicate,
    config: LoopConfig,
    attempts: HashMap<ObjectKey, u32>,
    pending: HashSet<ObjectKey>,
    stats: LoopStats,
    requeue_tx: mpsc::UnboundedSender<ObjectKey>,
    requeue_rx: mpsc::UnboundedReceiver<ObjectKey>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    /// Create a new reconciliation loop.
    pub fn new(reconciler: Arc<AgentReconciler>, config: LoopConfig) -> Self {
        let predicate = reconciler.predicate();
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            reconciler,
            predicate,
            config,
            attempts: HashMap::new(),
            pending: HashSet::new(),
            stats: LoopStats::default(),
            requeue_tx,
            requeue_rx,
            stop_rx,
            stop_tx,
        }
    }

    /// Run until stopped or until `notifications` ends.
    ///
    /// # Errors
    ///
    /// Reconcile failures are retried, never returned; the loop itself does
    /// not currently fail.
    pub async fn run<S>(&mut self, mut notifications: S) -> Result<()>
    where
        S: Stream<Item = Notification> + Unpin,
    {
        info!(
            token_secret = %self.reconciler.config().token_secret_name,
            "Starting reconciliation loop"
        );

        loop {
            tokio::select! {
                next = notifications.next() => {
                    let Some(notification) = next else {
                        info!("Notification stream ended, stopping loop");
                        return Ok(());
                    };
                    match self.request_for(&notification) {
                        Some(request) => self.process(request).await,
                        None => {
                            self.stats.filtered += 1;
                            trace!(kind = %notification.kind, key = %notification.key, "Ignoring notification");
                        }
                    }
                }
                Some(request) = self.requeue_rx.recv() => {
                    self.pending.remove(&request);
                    self.process(request).await;
                }
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        info!("Reconciliation loop stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Reconcile request for a notification, or `None` when it is filtered
    /// out.
    ///
    /// Changes to the agent Deployment are folded onto the token Secret key
    /// in the same namespace.
    pub fn request_for(&self, notification: &Notification) -> Option<ObjectKey> {
        if !self
            .predicate
            .evaluate(notification.kind, &notification.key.name)
        {
            return None;
        }

        match notification.kind {
            ResourceKind::Deployment => Some(ObjectKey::new(
                &notification.key.namespace,
                &self.reconciler.config().token_secret_name,
            )),
            ResourceKind::Secret | ResourceKind::ConfigMap => {
                Some(notification.key.clone())
            }
        }
    }

    async fn process(&mut self, request: ObjectKey) {
        match self.reconciler.reconcile(&request).await {
            Ok(result) => {
                self.stats.reconciled += 1;
                self.attempts.remove(&request);
                debug!(
                    request = %request,
                    outcome = ?result.outcome,
                    mutated = result.outcome.mutated(),
                    "Reconciled"
                );
                if let Some(delay) = result.requeue_after {
                    self.requeue(request, delay);
                }
            }
            Err(e) => {
                self.stats.failed += 1;
                if self.pending.contains(&request) {
                    debug!(request = %request, error = %e, "Reconcile failed, retry already pending");
                    return;
                }
                let attempt = self.attempts.entry(request.clone()).or_insert(0);
                *attempt = attempt.saturating_add(1);
                let delay = self.config.backoff(*attempt);
                warn!(
                    request = %request,
                    error = %e,
                    attempt = *attempt,
                    retry_in_ms = delay.as_millis(),
                    "Reconcile failed, requeueing"
                );
                self.requeue(request, delay);
            }
        }
    }

    fn requeue(&mut self, request: ObjectKey, delay: Duration) {
        self.pending.insert(request.clone());
        let tx = self.requeue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(request);
        });
    }

    /// What the loop has done so far.
    pub const fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
