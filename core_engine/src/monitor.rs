//! Background loops: periodic node sweep and stale-state reaper.
//!
//! Each pass runs as its own task, so an error or a panic inside a pass is
//! logged and the loop carries on after its interval. `stop` cancels the
//! loops, lets any pass in flight wind down (including the health checks it
//! fanned out) and waits for all of it to finish.

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shared_utils::config::MonitorConfig;

use crate::error::CoreResult;
use crate::model::{NodeClass, NodeState};
use crate::store::TokenStore;
use crate::supervisor::{BatchReport, ConnectionSupervisor, HealthOutcome};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Class swept by the node sweep; `None` sweeps every class
    pub class: Option<NodeClass>,
    pub sweep_interval: Duration,
    pub reap_interval: Duration,
    pub connecting_timeout: Duration,
    pub auto_reconnect: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> CoreResult<Self> {
        let class = config
            .class
            .as_deref()
            .map(str::parse::<NodeClass>)
            .transpose()?;

        Ok(Self {
            class,
            sweep_interval: config.sweep_interval(),
            reap_interval: config.reap_interval(),
            connecting_timeout: config.connecting_timeout(),
            auto_reconnect: config.auto_reconnect,
        })
    }
}

pub struct HealthMonitor {
    supervisor: Arc<ConnectionSupervisor>,
    tokens: Arc<dyn TokenStore>,
    settings: MonitorSettings,
    cancel: StdMutex<CancellationToken>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        tokens: Arc<dyn TokenStore>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            supervisor,
            tokens,
            settings,
            cancel: StdMutex::new(CancellationToken::new()),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().any(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the sweep and reaper loops. Returns false if they already run.
    pub fn start(&self) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.iter().any(|task| !task.is_finished()) {
            return false;
        }
        tasks.clear();

        let cancel = {
            let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        let supervisor = Arc::clone(&self.supervisor);
        let settings = self.settings.clone();
        tasks.push(tokio::spawn(run_loop(
            "sweep",
            self.settings.sweep_interval,
            cancel.clone(),
            move |cancel| sweep_once(Arc::clone(&supervisor), settings.clone(), cancel),
        )));

        let supervisor = Arc::clone(&self.supervisor);
        let tokens = Arc::clone(&self.tokens);
        let timeout = self.settings.connecting_timeout;
        tasks.push(tokio::spawn(run_loop(
            "reaper",
            self.settings.reap_interval,
            cancel,
            move |cancel| reap_once(Arc::clone(&supervisor), Arc::clone(&tokens), timeout, cancel),
        )));

        info!(
            class = ?self.settings.class,
            sweep_secs = self.settings.sweep_interval.as_secs(),
            reap_secs = self.settings.reap_interval.as_secs(),
            auto_reconnect = self.settings.auto_reconnect,
            "health monitor started"
        );
        true
    }

    /// Cancel both loops and wait for them to exit.
    pub async fn stop(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for task in tasks {
            if let Err(err) = task.await {
                warn!("monitor loop ended abnormally: {err}");
            }
        }
        info!("health monitor stopped");
    }
}

async fn run_loop<F, Fut>(name: &'static str, interval: Duration, cancel: CancellationToken, mut pass: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    loop {
        let mut handle = tokio::spawn(pass(cancel.clone()));

        let finished = tokio::select! {
            _ = cancel.cancelled() => None,
            joined = &mut handle => Some(joined),
        };
        // A cancelled pass sees the same token; wait until it has wound down.
        let joined = match finished {
            Some(joined) => joined,
            None => handle.await,
        };
        log_pass(name, joined);

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(task = name, "monitor loop exited");
}

fn log_pass(name: &'static str, joined: Result<CoreResult<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(task = name, "monitor pass failed: {err}"),
        Err(err) if err.is_panic() => error!(task = name, "monitor pass panicked"),
        Err(err) => debug!(task = name, "monitor pass cancelled: {err}"),
    }
}

/// One sweep: batch health check, then optional reconnection of nodes that
/// were found DISCONNECTED or in ERROR. Returns early once `cancel` fires.
pub async fn sweep_once(
    supervisor: Arc<ConnectionSupervisor>,
    settings: MonitorSettings,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let report: BatchReport = supervisor
        .batch_health_check_until(settings.class, &cancel)
        .await?;
    if cancel.is_cancelled() {
        debug!(checked = report.checked, "node sweep cancelled");
        return Ok(());
    }
    info!(
        connected = report.connected,
        total = report.total,
        disconnected = report.disconnected,
        skipped = report.skipped,
        errors = report.errors,
        "node sweep finished"
    );

    if !settings.auto_reconnect {
        return Ok(());
    }

    let dropped = report.reports.iter().filter_map(|health| match health.outcome {
        HealthOutcome::Checked {
            current: NodeState::Disconnected | NodeState::Error,
            ..
        } => Some(health.node_id.as_str()),
        _ => None,
    });

    for node_id in dropped {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%node_id, "reconnection abandoned, monitor stopping");
                return Ok(());
            }
            outcome = supervisor.auto_reconnect(node_id) => outcome,
        };
        match outcome {
            Ok(true) => info!(%node_id, "node reconnected by sweep"),
            Ok(false) => warn!(%node_id, "reconnection by sweep failed"),
            Err(err) => error!(%node_id, "reconnection by sweep errored: {err}"),
        }
    }
    Ok(())
}

/// One reaper pass: fail stale transitional nodes, then drop expired
/// provisioning tokens.
pub async fn reap_once(
    supervisor: Arc<ConnectionSupervisor>,
    tokens: Arc<dyn TokenStore>,
    timeout: Duration,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let reaped = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        reaped = supervisor.reap_stale(timeout) => reaped?,
    };
    if reaped.is_empty() {
        debug!("no stale nodes");
    } else {
        warn!(count = reaped.len(), nodes = ?reaped, "stale nodes moved to ERROR");
    }

    let purged = tokens.purge_expired_tokens(Utc::now()).await?;
    if purged > 0 {
        info!(purged, "expired provisioning tokens removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn failed_and_panicked_passes_do_not_end_the_loop() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let task = tokio::spawn(run_loop(
            "flaky",
            Duration::from_millis(1),
            cancel.clone(),
            move |_| {
                let run = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match run {
                        0 => Err(CoreError::Storage("disk unavailable".to_string())),
                        1 => panic!("pass exploded"),
                        _ => Ok(()),
                    }
                }
            },
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 4 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(runs.load(Ordering::SeqCst) >= 4);
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn loop_exit_waits_for_the_pass_in_flight() {
        let wound_down = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let flag = Arc::clone(&wound_down);
        let entered = Arc::clone(&started);
        let task = tokio::spawn(run_loop(
            "slow",
            Duration::from_secs(60),
            cancel.clone(),
            move |cancel: CancellationToken| {
                let flag = Arc::clone(&flag);
                let entered = Arc::clone(&entered);
                async move {
                    entered.notify_one();
                    cancel.cancelled().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        started.notified().await;
        assert!(!wound_down.load(Ordering::SeqCst));
        cancel.cancel();
        task.await.unwrap();

        assert!(wound_down.load(Ordering::SeqCst));
    }
}
