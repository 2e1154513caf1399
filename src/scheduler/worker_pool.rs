//! Bounded-concurrency consumers over the campaign queues.
//!
//! A worker process binds one consumer group per campaign type; each
//! group runs a configurable number of consumer tasks. Every consumer
//! pulls from its queue, runs preflight checks, invokes the pipeline and
//! routes the outcome back to the queue: ack, retry with backoff, or
//! terminal failure, depending on the failure kind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FailureKind, PipelineError};
use crate::metrics;
use crate::pipeline::CampaignPipeline;

use super::job::{CampaignJob, CampaignType};
use super::queue::{CampaignQueue, QueueDepths, QueueError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to reach the queue service.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// In-flight jobs did not finish within the drain timeout.
    #[error("Drain timed out after {0:?}")]
    DrainTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Simultaneous jobs per campaign-type queue.
    pub concurrency_per_queue: usize,
    /// How long a dequeue blocks waiting for a job.
    pub poll_interval: Duration,
    /// Maximum processing duration for a single job.
    pub job_timeout: Duration,
    /// Process memory ceiling checked at preflight, in MB.
    pub max_memory_mb: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency_per_queue: 3,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            max_memory_mb: 512,
        }
    }
}

/// Lifecycle events emitted by consumers.
///
/// The lifecycle manager subscribes to these instead of the consumers
/// calling back into it.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A consumer group is bound and polling.
    Ready { queue: &'static str },
    /// A job was claimed and is being processed.
    JobActive {
        queue: &'static str,
        job_id: Uuid,
        attempt: u32,
    },
    /// A job finished successfully.
    JobCompleted {
        queue: &'static str,
        job_id: Uuid,
        duration: Duration,
    },
    /// A job failed; `terminal` is set when it will not be redelivered.
    JobFailed {
        queue: &'static str,
        job_id: Uuid,
        kind: FailureKind,
        terminal: bool,
    },
    /// The stalled sweep redelivered jobs on a queue.
    JobStalled {
        queue: &'static str,
        redelivered: usize,
    },
}

/// Point-in-time statistics for the pool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub num_consumers: usize,
    pub active_jobs: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_job_ms: u64,
}

/// Shared counters updated by all consumers.
#[derive(Default)]
pub struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedPoolStats {
    pub fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_jobs: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Jobs currently being processed.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst) as usize
    }

    /// Snapshot for the status surface.
    pub fn snapshot(&self, num_consumers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let total = completed + failed;

        PoolStats {
            num_consumers,
            active_jobs: self.active_jobs(),
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_ms: if total > 0 { total_ms / total } else { 0 },
        }
    }
}

/// Resident memory of this process in MB, when the platform reports it.
pub fn process_memory_mb() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|p| p.memory() / (1024 * 1024))
}

/// Worker pool binding consumers to all campaign-type queues.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queues: Vec<Arc<CampaignQueue>>,
    pipeline: Arc<CampaignPipeline>,
    shutdown_tx: broadcast::Sender<()>,
    draining: Arc<AtomicBool>,
    consumer_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Connects to the queue service and binds one queue per campaign
    /// type.
    ///
    /// Returns the pool and the receiver for its lifecycle events.
    pub async fn connect(
        redis_url: &str,
        config: WorkerPoolConfig,
        pipeline: Arc<CampaignPipeline>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), PoolError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let queues = CampaignType::ALL
            .iter()
            .map(|&campaign| Arc::new(CampaignQueue::from_connection(conn.clone(), campaign)))
            .collect();

        Ok(Self::with_queues(config, queues, pipeline))
    }

    /// Creates a pool over pre-built queues.
    pub fn with_queues(
        config: WorkerPoolConfig,
        queues: Vec<Arc<CampaignQueue>>,
        pipeline: Arc<CampaignPipeline>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                queues,
                pipeline,
                shutdown_tx,
                draining: Arc::new(AtomicBool::new(false)),
                consumer_handles: Vec::new(),
                stats: Arc::new(SharedPoolStats::new()),
                events_tx,
                is_running: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    /// Verifies queue connectivity and spawns all consumers.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Connectivity preflight before any consumer binds.
        for queue in &self.queues {
            queue.ping().await?;
        }

        for queue in &self.queues {
            for i in 0..self.config.concurrency_per_queue {
                let consumer = Consumer {
                    id: format!("{}-{}", queue.queue_name(), i),
                    queue: Arc::clone(queue),
                    pipeline: Arc::clone(&self.pipeline),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    draining: Arc::clone(&self.draining),
                    stats: Arc::clone(&self.stats),
                    events_tx: self.events_tx.clone(),
                    poll_interval: self.config.poll_interval,
                    job_timeout: self.config.job_timeout,
                    max_memory_mb: self.config.max_memory_mb,
                };

                self.consumer_handles.push(tokio::spawn(async move {
                    consumer.run().await;
                }));
            }

            let _ = self.events_tx.send(WorkerEvent::Ready {
                queue: queue.campaign_type().queue_name(),
            });
        }

        if let Some(gauge) = metrics::ACTIVE_CONSUMERS.get() {
            gauge.set(self.consumer_handles.len() as f64);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            consumers = self.consumer_handles.len(),
            queues = self.queues.len(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Stops intake immediately. In-flight jobs keep running.
    pub fn stop_intake(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Whether intake has been stopped.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Shared draining flag, for status reporting.
    pub fn draining_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.draining)
    }

    /// Shared statistics handle, for status reporting.
    pub fn stats_handle(&self) -> Arc<SharedPoolStats> {
        Arc::clone(&self.stats)
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.consumer_handles.len())
    }

    /// The campaign types this pool consumes.
    pub fn campaign_types(&self) -> Vec<CampaignType> {
        self.queues.iter().map(|q| q.campaign_type()).collect()
    }

    /// True when any consumer task died while the pool was not
    /// draining. Treated as process-fatal by the lifecycle manager.
    pub fn has_dead_consumers(&self) -> bool {
        if self.is_draining() {
            return false;
        }
        self.consumer_handles.iter().any(|h| h.is_finished())
    }

    /// Stops intake and waits for in-flight jobs, bounded by `timeout`.
    ///
    /// On timeout the remaining consumers are aborted and their jobs are
    /// left to stalled redelivery on another worker.
    pub async fn drain(&mut self, timeout: Duration) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Draining worker pool");
        self.stop_intake();
        // Ignore send error - consumers may have already stopped
        let _ = self.shutdown_tx.send(());

        let wait_all = async {
            for handle in self.consumer_handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Consumer task panicked during drain");
                }
            }
        };
        let wait_result = tokio::time::timeout(timeout, wait_all).await;

        let result = match wait_result {
            Ok(()) => {
                self.consumer_handles.clear();
                info!("Worker pool drained");
                Ok(())
            }
            Err(_) => {
                for handle in self.consumer_handles.drain(..) {
                    handle.abort();
                }
                Err(PoolError::DrainTimeout(timeout))
            }
        };

        self.is_running.store(false, Ordering::SeqCst);
        if let Some(gauge) = metrics::ACTIVE_CONSUMERS.get() {
            gauge.set(0.0);
        }
        result
    }

    /// Runs one stalled sweep across all queues and refreshes the
    /// per-queue depth gauges.
    pub async fn sweep_stalled(&self, max_stalled_deliveries: u32) {
        for queue in &self.queues {
            match queue
                .recover_stalled(self.config.job_timeout, max_stalled_deliveries)
                .await
            {
                Ok(0) => {}
                Ok(redelivered) => {
                    warn!(
                        queue = queue.queue_name(),
                        redelivered, "Redelivered stalled jobs"
                    );
                    if let Some(counter) = metrics::STALLED_REDELIVERIES.get() {
                        counter
                            .with_label_values(&[queue.queue_name()])
                            .inc_by(redelivered as f64);
                    }
                    let _ = self.events_tx.send(WorkerEvent::JobStalled {
                        queue: queue.campaign_type().queue_name(),
                        redelivered,
                    });
                }
                Err(e) => {
                    warn!(queue = queue.queue_name(), error = %e, "Stalled sweep failed");
                }
            }

            if let Ok(depths) = queue.stats().await {
                if let Some(gauge) = metrics::QUEUE_DEPTH.get() {
                    gauge
                        .with_label_values(&[queue.queue_name()])
                        .set(depths.pending as f64);
                }
            }
        }
    }

    /// Depth counters for every bound queue.
    pub async fn queue_depths(&self) -> Vec<QueueDepths> {
        let mut depths = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            match queue.stats().await {
                Ok(d) => depths.push(d),
                Err(e) => warn!(queue = queue.queue_name(), error = %e, "Failed to read queue stats"),
            }
        }
        depths
    }
}

/// A single consumer bound to one campaign queue.
struct Consumer {
    id: String,
    queue: Arc<CampaignQueue>,
    pipeline: Arc<CampaignPipeline>,
    shutdown_rx: broadcast::Receiver<()>,
    draining: Arc<AtomicBool>,
    stats: Arc<SharedPoolStats>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    poll_interval: Duration,
    job_timeout: Duration,
    max_memory_mb: u64,
}

impl Consumer {
    /// Main consumer loop: poll, preflight, process, until shutdown.
    async fn run(mut self) {
        debug!(consumer_id = %self.id, "Consumer started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if self.draining.load(Ordering::SeqCst) {
                break;
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    // Dequeue already blocked for poll_interval.
                }
                Err(e) => {
                    error!(consumer_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(consumer_id = %self.id, "Consumer stopped");
    }

    /// Checks that run before the pipeline is invoked.
    fn preflight(&self, job: &CampaignJob) -> Result<(), PipelineError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(PipelineError::WorkerDraining);
        }

        job.validate().map_err(PipelineError::InvalidJob)?;

        if let Some(used_mb) = process_memory_mb() {
            if used_mb > self.max_memory_mb {
                return Err(PipelineError::WorkerOverloaded {
                    used_mb,
                    max_mb: self.max_memory_mb,
                });
            }
        }

        Ok(())
    }

    async fn process_job(&self, mut job: CampaignJob) {
        let queue_name = self.queue.queue_name();
        let start = Instant::now();

        job.increment_attempts();
        self.stats.increment_active();
        if let Some(gauge) = metrics::JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }

        let _ = self.events_tx.send(WorkerEvent::JobActive {
            queue: self.queue.campaign_type().queue_name(),
            job_id: job.job_id,
            attempt: job.attempts_made,
        });

        info!(
            consumer_id = %self.id,
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            attempt = job.attempts_made,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let result = match self.preflight(&job) {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(self.job_timeout, self.pipeline.execute(&job)).await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::JobTimeout(self.job_timeout)),
            },
        };

        let duration = start.elapsed();
        self.stats.decrement_active();
        if let Some(gauge) = metrics::JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
        if let Some(histogram) = metrics::JOB_DURATION.get() {
            histogram
                .with_label_values(&[queue_name])
                .observe(duration.as_secs_f64());
        }

        match result {
            Ok(outcome) => {
                self.stats.record_completion(duration);
                if let Some(counter) = metrics::JOBS_TOTAL.get() {
                    counter.with_label_values(&[queue_name, "completed"]).inc();
                }
                if let Some(counter) = metrics::CALLS_PLACED.get() {
                    counter
                        .with_label_values(&[outcome.campaign_type.as_str()])
                        .inc();
                }

                info!(
                    consumer_id = %self.id,
                    job_id = %job.job_id,
                    call_reference = %outcome.call_reference,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );

                if let Err(e) = self.queue.complete(&job, &outcome).await {
                    error!(job_id = %job.job_id, error = %e, "Failed to acknowledge completion");
                }

                let _ = self.events_tx.send(WorkerEvent::JobCompleted {
                    queue: self.queue.campaign_type().queue_name(),
                    job_id: job.job_id,
                    duration,
                });
            }
            Err(e) => {
                self.stats.record_failure(duration);
                self.handle_failure(job, e).await;
            }
        }
    }

    async fn handle_failure(&self, job: CampaignJob, e: PipelineError) {
        let queue_name = self.queue.queue_name();
        let kind = e.kind();

        if let Some(counter) = metrics::JOB_FAILURES.get() {
            counter.with_label_values(&[queue_name, kind.as_str()]).inc();
        }

        let terminal = !kind.is_retryable() || !job.should_retry();

        match kind {
            FailureKind::Permanent | FailureKind::ServiceUnavailable => {
                error!(
                    consumer_id = %self.id,
                    job_id = %job.job_id,
                    tenant_id = %job.tenant_id,
                    phone = %job.customer_phone,
                    kind = %kind,
                    terminal,
                    error = %e,
                    "Job failed"
                );
            }
            FailureKind::RateLimited | FailureKind::Temporary => {
                warn!(
                    consumer_id = %self.id,
                    job_id = %job.job_id,
                    tenant_id = %job.tenant_id,
                    kind = %kind,
                    terminal,
                    error = %e,
                    "Job failed"
                );
            }
        }

        if terminal {
            if let Some(counter) = metrics::JOBS_TOTAL.get() {
                counter.with_label_values(&[queue_name, "failed"]).inc();
            }
            if let Err(qe) = self.queue.fail_permanently(&job, &e.to_string()).await {
                error!(job_id = %job.job_id, error = %qe, "Failed to record terminal failure");
            }
        } else {
            match self.queue.retry_later(&job).await {
                Ok(delay) => {
                    debug!(
                        job_id = %job.job_id,
                        delay_ms = delay.as_millis() as u64,
                        remaining_attempts = job.remaining_attempts(),
                        "Job scheduled for retry"
                    );
                }
                Err(qe) => {
                    error!(job_id = %job.job_id, error = %qe, "Failed to schedule retry");
                }
            }
        }

        let _ = self.events_tx.send(WorkerEvent::JobFailed {
            queue: self.queue.campaign_type().queue_name(),
            job_id: job.job_id,
            kind,
            terminal,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.concurrency_per_queue, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.max_memory_mb, 512);
    }

    #[test]
    fn test_shared_stats_snapshot() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_millis(100));
        stats.record_completion(Duration::from_millis(200));
        stats.record_failure(Duration::from_millis(600));

        let snapshot = stats.snapshot(15);
        assert_eq!(snapshot.num_consumers, 15);
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.average_job_ms, 300);
    }

    #[test]
    fn test_shared_stats_active_tracking() {
        let stats = SharedPoolStats::new();
        assert_eq!(stats.active_jobs(), 0);

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_jobs(), 2);

        stats.decrement_active();
        assert_eq!(stats.active_jobs(), 1);
    }

    #[test]
    fn test_empty_stats_average_is_zero() {
        let stats = SharedPoolStats::new();
        assert_eq!(stats.snapshot(0).average_job_ms, 0);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::DrainTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
