//! Worker process lifecycle: startup, health surface, graceful drain.
//!
//! The lifecycle state machine is `starting -> ready -> draining ->
//! stopped`. Draining is entered on a termination signal, on
//! `POST /shutdown`, or when a consumer task dies unexpectedly (a
//! process-fatal condition); new job intake stops immediately and
//! in-flight jobs get a bounded window to finish. If the window
//! elapses the process exits non-zero and the abandoned jobs reach
//! another worker through stalled redelivery.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::health::{self, StatusState};
use crate::scheduler::worker_pool::{WorkerEvent, WorkerPool};

/// Lifecycle states of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owns the worker pool, the status server and the process signals.
pub struct LifecycleManager {
    config: WorkerConfig,
    pool: WorkerPool,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    state_tx: watch::Sender<LifecycleState>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl LifecycleManager {
    pub fn new(
        config: WorkerConfig,
        pool: WorkerPool,
        events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            config,
            pool,
            events_rx,
            state_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Runs the worker until it drains and stops.
    ///
    /// Returns an error when the drain deadline elapsed with jobs still
    /// in flight; the binary maps that to a non-zero exit.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let worker_id = format!("worker-{}", std::process::id());
        let started_at = Instant::now();

        // Starting: bind consumers (verifies queue connectivity) and
        // the status endpoint.
        self.pool.start().await.context("worker pool startup")?;

        let status_server = health::serve(
            StatusState {
                worker_id: worker_id.clone(),
                started_at,
                max_memory_mb: self.config.max_memory_mb,
                state_rx: self.state_tx.subscribe(),
                stats: self.pool.stats_handle(),
                campaigns: self.pool.campaign_types(),
                shutdown_tx: self.shutdown_tx.clone(),
            },
            self.config.health_port,
        )
        .await
        .context("binding status endpoint")?;

        self.state_tx.send_replace(LifecycleState::Ready);
        info!(worker_id = %worker_id, "Worker ready");

        let mut sweep = tokio::time::interval(self.config.stalled_check_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(std::time::Duration::from_secs(1));

        let reason = loop {
            tokio::select! {
                _ = termination_signal() => break "termination signal",
                Some(()) = self.shutdown_rx.recv() => break "shutdown request",
                Some(event) = self.events_rx.recv() => observe(event),
                _ = sweep.tick() => {
                    self.pool.sweep_stalled(self.config.max_stalled_deliveries).await;
                }
                _ = watchdog.tick() => {
                    if self.pool.has_dead_consumers() {
                        break "consumer task died";
                    }
                }
            }
        };

        warn!(reason, "Entering drain");
        self.state_tx.send_replace(LifecycleState::Draining);

        let drained = self.pool.drain(self.config.shutdown_timeout).await;

        self.state_tx.send_replace(LifecycleState::Stopped);
        status_server.abort();

        match drained {
            Ok(()) => {
                info!(worker_id = %worker_id, "Worker stopped cleanly");
                Ok(())
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e,
                    "Drain deadline elapsed; abandoning in-flight jobs to stalled redelivery");
                Err(e.into())
            }
        }
    }

    /// Sender that triggers a graceful drain, as handed to the status
    /// endpoint.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Receiver of lifecycle state changes.
    pub fn state_receiver(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }
}

/// Logs worker events; metrics were already recorded at the emit site.
fn observe(event: WorkerEvent) {
    match event {
        WorkerEvent::Ready { queue } => info!(queue, "Consumer group ready"),
        WorkerEvent::JobActive {
            queue,
            job_id,
            attempt,
        } => debug!(queue, %job_id, attempt, "Job active"),
        WorkerEvent::JobCompleted {
            queue,
            job_id,
            duration,
        } => debug!(queue, %job_id, duration_ms = duration.as_millis() as u64, "Job completed"),
        WorkerEvent::JobFailed {
            queue,
            job_id,
            kind,
            terminal,
        } => debug!(queue, %job_id, kind = %kind, terminal, "Job failed"),
        WorkerEvent::JobStalled { queue, redelivered } => {
            warn!(queue, redelivered, "Stalled jobs redelivered")
        }
    }
}

/// Resolves when the process receives ctrl-c or, on unix, SIGTERM.
async fn termination_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Convenience constructor wiring config, pipeline and pool together.
pub async fn build_worker(
    config: WorkerConfig,
    pipeline: Arc<crate::pipeline::CampaignPipeline>,
) -> anyhow::Result<LifecycleManager> {
    let pool_config = crate::scheduler::worker_pool::WorkerPoolConfig {
        concurrency_per_queue: config.concurrency_per_queue,
        poll_interval: std::time::Duration::from_secs(1),
        job_timeout: config.job_timeout,
        max_memory_mb: config.max_memory_mb,
    };

    let (pool, events_rx) = WorkerPool::connect(&config.redis_url, pool_config, pipeline)
        .await
        .context("connecting to queue service")?;

    Ok(LifecycleManager::new(config, pool, events_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_state_display() {
        assert_eq!(LifecycleState::Starting.to_string(), "starting");
        assert_eq!(LifecycleState::Ready.to_string(), "ready");
        assert_eq!(LifecycleState::Draining.to_string(), "draining");
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");
    }
}
