//! Connection state machine: activation with retry, deactivation, health
//! checks and the stale-state reaper.
//!
//! Mutations of one node are serialized by a per-node advisory lock and
//! committed with compare-and-set transitions against the store, which stays
//! the state of record. The connection-state cache only mirrors it.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use shared_utils::config::SupervisorConfig;

use crate::error::{CoreError, CoreResult};
use crate::model::{Node, NodeClass, NodeFilter, NodeState};
use crate::probe::ReachabilityProbe;
use crate::retry::RetryPolicy;
use crate::state_cache::ConnectionStates;
use crate::store::NodeStore;
use crate::tunnel::TunnelSynchronizer;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub retry: RetryPolicy,
    /// Wait between publishing a peer and probing it
    pub settle_delay: Duration,
    /// Pause after removing a stale entry before re-adding
    pub cleanup_delay: Duration,
    /// Minimum spacing of health checks for one node
    pub health_check_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            settle_delay: config.settle_delay(),
            cleanup_delay: config.cleanup_delay(),
            health_check_interval: config.health_check_interval(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub node_id: String,
    pub attempts: u32,
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RecentlyChecked,
    /// Another operation holds the node
    Busy,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Skipped(SkipReason),
    Checked {
        reachable: bool,
        previous: NodeState,
        current: NodeState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub node_id: String,
    pub outcome: HealthOutcome,
}

impl HealthReport {
    fn skipped(node_id: &str, reason: SkipReason) -> Self {
        Self {
            node_id: node_id.to_string(),
            outcome: HealthOutcome::Skipped(reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub checked: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub skipped: usize,
    pub errors: usize,
    pub reports: Vec<HealthReport>,
}

/// Advisory lock per node id.
#[derive(Debug, Default)]
struct NodeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    fn handle(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock(&self, node_id: &str) -> OwnedMutexGuard<()> {
        self.handle(node_id).lock_owned().await
    }

    fn try_lock(&self, node_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(node_id).try_lock_owned().ok()
    }

    /// Drop the lock of `node_id` unless some task still holds or waits on
    /// it, so a later node with the same id never gets a second mutex.
    fn forget(&self, node_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(node_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(node_id);
        }
    }
}

pub struct ConnectionSupervisor {
    store: Arc<dyn NodeStore>,
    sync: Arc<TunnelSynchronizer>,
    probe: Arc<dyn ReachabilityProbe>,
    states: Arc<ConnectionStates>,
    settings: SupervisorSettings,
    locks: NodeLocks,
    last_checked: StdMutex<HashMap<String, Instant>>,
}

impl ConnectionSupervisor {
    pub fn new(
        store: Arc<dyn NodeStore>,
        sync: Arc<TunnelSynchronizer>,
        probe: Arc<dyn ReachabilityProbe>,
        states: Arc<ConnectionStates>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            sync,
            probe,
            states,
            settings,
            locks: NodeLocks::default(),
            last_checked: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn synchronizer(&self) -> &Arc<TunnelSynchronizer> {
        &self.sync
    }

    pub fn states(&self) -> &Arc<ConnectionStates> {
        &self.states
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Hold the advisory lock of `node_id` until the guard drops.
    pub async fn lock_node(&self, node_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(node_id).await
    }

    pub fn connection_state(&self, node_id: &str) -> Option<NodeState> {
        self.states.get(node_id)
    }

    pub fn connection_states(&self) -> HashMap<String, NodeState> {
        self.states.snapshot()
    }

    /// Reload the cache from the store, dropping ids it no longer knows.
    pub async fn warm_cache(&self) -> CoreResult<usize> {
        let nodes = self.store.list(&NodeFilter::all()).await?;
        let count = nodes.len();
        self.states
            .reset(nodes.into_iter().map(|node| (node.id, node.state)).collect());
        Ok(count)
    }

    /// Drop every in-memory trace of a deleted node.
    pub fn forget(&self, node_id: &str) {
        self.states.remove(node_id);
        self.last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        self.locks.forget(node_id);
    }

    async fn commit(&self, node_id: &str, from: &[NodeState], to: NodeState) -> CoreResult<Node> {
        let node = self.store.transition(node_id, from, to).await?;
        self.states.set(node_id, to);
        Ok(node)
    }

    /// Publish the node's peer and wait until it answers, with retries.
    #[instrument(level = "info", skip(self))]
    pub async fn activate(&self, node_id: &str) -> CoreResult<ActivationReport> {
        let _guard = self.locks.lock(node_id).await;
        self.activate_locked(node_id, NodeState::Connecting).await
    }

    async fn activate_locked(
        &self,
        node_id: &str,
        working: NodeState,
    ) -> CoreResult<ActivationReport> {
        let node = self.commit(node_id, &[], working).await?;
        info!(address = %node.address, state = %working, "activation started");

        let result = self
            .settings
            .retry
            .run(|attempt| self.attempt(&node, attempt))
            .await;

        match result {
            Ok(done) => {
                self.commit(node_id, &[working], NodeState::Connected).await?;
                self.mark_checked(node_id);
                info!(attempts = done.attempts, "node connected");
                Ok(ActivationReport {
                    node_id: node_id.to_string(),
                    attempts: done.attempts,
                    state: NodeState::Connected,
                })
            }
            Err(exhausted) => {
                if let Err(err) = self.commit(node_id, &[working], NodeState::Error).await {
                    error!("could not record failed activation: {err}");
                }
                error!(
                    attempts = exhausted.attempts,
                    last_error = %exhausted.last_error,
                    "activation failed"
                );
                Err(CoreError::ActivationFailed {
                    node_id: node_id.to_string(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                })
            }
        }
    }

    async fn attempt(&self, node: &Node, attempt: u32) -> Result<(), String> {
        debug!(node_id = %node.id, attempt, "activation attempt");

        let cleanup = self.sync.remove_peer(&node.public_key).await;
        if !cleanup.is_absent() {
            tokio::time::sleep(self.settings.cleanup_delay).await;
        }

        self.sync
            .add_peer(&node.public_key, node.address, &node.id)
            .await
            .map_err(|err| {
                warn!(node_id = %node.id, attempt, transient = err.is_transient(), "peer sync failed: {err}");
                err.to_string()
            })?;

        tokio::time::sleep(self.settings.settle_delay).await;

        if self.probe.is_reachable(node.address, &node.public_key).await {
            Ok(())
        } else {
            warn!(node_id = %node.id, attempt, address = %node.address, "peer not reachable");
            Err(format!("{} did not answer the reachability probe", node.address))
        }
    }

    /// Retract the peer and park the node in DEACTIVATED.
    ///
    /// Peer removal is best effort; the store commit is the state of record.
    #[instrument(level = "info", skip(self))]
    pub async fn deactivate(&self, node_id: &str) -> CoreResult<Node> {
        let _guard = self.locks.lock(node_id).await;
        let mut node = self.store.require(node_id).await?;

        let removal = self.sync.remove_peer(&node.public_key).await;
        if !removal.is_complete() {
            warn!(?removal, "peer removal incomplete, deactivating anyway");
        }

        let now = Utc::now();
        node.state = NodeState::Deactivated;
        node.deactivated_at = Some(now);
        node.last_address = Some(node.address);
        node.updated_at = now;
        self.store.update(node.clone()).await?;

        self.states.set(node_id, NodeState::Deactivated);
        self.last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        info!(address = %node.address, "node deactivated");
        Ok(node)
    }

    fn mark_checked(&self, node_id: &str) {
        self.last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), Instant::now());
    }

    /// Claim a health-check slot unless the node was checked recently.
    fn claim_check(&self, node_id: &str) -> bool {
        let mut checked = self.last_checked.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match checked.get(node_id) {
            Some(at) if now.duration_since(*at) < self.settings.health_check_interval => false,
            _ => {
                checked.insert(node_id.to_string(), now);
                true
            }
        }
    }

    /// Probe once and move CONNECTED and DISCONNECTED into each other.
    ///
    /// A reachable node fresh from registration (CONNECTING) is promoted to
    /// CONNECTED. Never starts a reconnection.
    pub async fn health_check(&self, node_id: &str) -> CoreResult<HealthReport> {
        let Some(_guard) = self.locks.try_lock(node_id) else {
            debug!(%node_id, "health check skipped, node busy");
            return Ok(HealthReport::skipped(node_id, SkipReason::Busy));
        };

        let node = self.store.require(node_id).await?;
        if node.state == NodeState::Deactivated {
            return Ok(HealthReport::skipped(node_id, SkipReason::Deactivated));
        }
        if !self.claim_check(node_id) {
            return Ok(HealthReport::skipped(node_id, SkipReason::RecentlyChecked));
        }

        let reachable = self.probe.is_reachable(node.address, &node.public_key).await;
        let previous = node.state;
        let next = match (reachable, previous) {
            (true, NodeState::Connecting | NodeState::Disconnected) => Some(NodeState::Connected),
            (false, NodeState::Connected) => Some(NodeState::Disconnected),
            _ => None,
        };

        let current = match next {
            Some(to) => {
                self.commit(node_id, &[previous], to).await?;
                if to == NodeState::Disconnected {
                    warn!(%node_id, address = %node.address, "node disconnected");
                } else {
                    info!(%node_id, address = %node.address, from = %previous, "node connected");
                }
                to
            }
            None => {
                self.states.set(node_id, previous);
                previous
            }
        };

        debug!(%node_id, reachable, %previous, %current, "health check done");
        Ok(HealthReport {
            node_id: node_id.to_string(),
            outcome: HealthOutcome::Checked {
                reachable,
                previous,
                current,
            },
        })
    }

    /// Re-run activation for a node that dropped out. Returns whether it came
    /// back; DEACTIVATED nodes are left alone.
    #[instrument(level = "info", skip(self))]
    pub async fn auto_reconnect(&self, node_id: &str) -> CoreResult<bool> {
        let _guard = self.locks.lock(node_id).await;
        let node = self.store.require(node_id).await?;
        if node.state == NodeState::Deactivated {
            debug!("reconnect skipped for deactivated node");
            return Ok(false);
        }

        info!(from = %node.state, "attempting reconnection");
        match self.activate_locked(node_id, NodeState::Reconnecting).await {
            Ok(_) => {
                info!("node reconnected");
                Ok(true)
            }
            Err(CoreError::ActivationFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Health-check every non-deactivated node of `class` concurrently.
    pub async fn batch_health_check(
        self: &Arc<Self>,
        class: Option<NodeClass>,
    ) -> CoreResult<BatchReport> {
        self.batch_health_check_until(class, &CancellationToken::new())
            .await
    }

    /// Like `batch_health_check`, but once `cancel` fires the outstanding
    /// checks are aborted and awaited, and the partial report is returned.
    pub async fn batch_health_check_until(
        self: &Arc<Self>,
        class: Option<NodeClass>,
        cancel: &CancellationToken,
    ) -> CoreResult<BatchReport> {
        let nodes = self
            .store
            .list(&NodeFilter::all().maybe_class(class))
            .await?;
        let ids: Vec<String> = nodes
            .into_iter()
            .filter(|node| node.state != NodeState::Deactivated)
            .map(|node| node.id)
            .collect();

        let mut report = BatchReport {
            total: ids.len(),
            ..Default::default()
        };

        let mut checks = JoinSet::new();
        for id in ids {
            let supervisor = Arc::clone(self);
            checks.spawn(async move {
                let result = supervisor.health_check(&id).await;
                (id, result)
            });
        }

        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(pending = checks.len(), "batch health check cancelled");
                    checks.shutdown().await;
                    break;
                }
                joined = checks.join_next() => match joined {
                    Some(joined) => joined,
                    None => break,
                },
            };

            match joined {
                Ok((_, Ok(health))) => {
                    match &health.outcome {
                        HealthOutcome::Checked { reachable, .. } => {
                            report.checked += 1;
                            if *reachable {
                                report.connected += 1;
                            } else {
                                report.disconnected += 1;
                            }
                        }
                        HealthOutcome::Skipped(_) => report.skipped += 1,
                    }
                    report.reports.push(health);
                }
                Ok((id, Err(err))) => {
                    warn!(node_id = %id, "health check failed: {err}");
                    report.errors += 1;
                }
                Err(err) => {
                    error!("health check task panicked: {err}");
                    report.errors += 1;
                }
            }
        }

        report.reports.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(report)
    }

    /// Fail nodes stuck in CONNECTING or RECONNECTING for longer than
    /// `timeout`. Nodes whose lock is held are in flight and left alone.
    pub async fn reap_stale(&self, timeout: Duration) -> CoreResult<Vec<String>> {
        let candidates = self.store.list(&NodeFilter::all()).await?;
        let now = Utc::now();
        let mut reaped = Vec::new();

        for node in candidates.into_iter().filter(|node| node.state.is_transitional()) {
            let age = (now - node.updated_at).to_std().unwrap_or(Duration::ZERO);
            if age <= timeout {
                continue;
            }
            let Some(_guard) = self.locks.try_lock(&node.id) else {
                debug!(node_id = %node.id, "stale candidate busy, skipping");
                continue;
            };

            match self.commit(&node.id, &[node.state], NodeState::Error).await {
                Ok(_) => {
                    warn!(
                        node_id = %node.id,
                        from = %node.state,
                        age_secs = age.as_secs(),
                        "node stuck in transitional state, marked ERROR"
                    );
                    reaped.push(node.id);
                }
                Err(CoreError::StateConflict { .. }) | Err(CoreError::NodeNotFound(_)) => {
                    debug!(node_id = %node.id, "node changed before it could be reaped");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(reaped)
    }
}
