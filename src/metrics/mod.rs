//! Prometheus metrics registration and export.
//!
//! All metrics live in a process-global registry initialized once at
//! startup and exposed through the status server's `/metrics` endpoint.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all callforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs processed, labeled by queue and outcome status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job processing duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Job failures, labeled by queue and failure kind.
pub static JOB_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Calls successfully placed, labeled by campaign type.
pub static CALLS_PLACED: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs waiting per queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed by this worker.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running queue consumers.
pub static ACTIVE_CONSUMERS: OnceLock<Gauge> = OnceLock::new();

/// Stalled jobs redelivered by the sweep, labeled by queue.
pub static STALLED_REDELIVERIES: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Idempotent: a second call leaves the already-initialized registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("callforge_jobs_total", "Jobs processed"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "callforge_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0, 300.0]),
        &["queue"],
    )?;

    let job_failures = CounterVec::new(
        Opts::new("callforge_job_failures_total", "Job failures by kind"),
        &["queue", "kind"],
    )?;

    let calls_placed = CounterVec::new(
        Opts::new("callforge_calls_placed_total", "Calls successfully placed"),
        &["campaign"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("callforge_queue_depth", "Jobs waiting per queue"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "callforge_jobs_in_progress",
        "Jobs currently being processed by this worker",
    )?;

    let active_consumers = Gauge::new(
        "callforge_active_consumers",
        "Number of running queue consumers",
    )?;

    let stalled_redeliveries = CounterVec::new(
        Opts::new(
            "callforge_stalled_redeliveries_total",
            "Stalled jobs redelivered by the sweep",
        ),
        &["queue"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_failures.clone()))?;
    registry.register(Box::new(calls_placed.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_consumers.clone()))?;
    registry.register(Box::new(stalled_redeliveries.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_FAILURES.set(job_failures);
    let _ = CALLS_PLACED.set(calls_placed);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_CONSUMERS.set(active_consumers);
    let _ = STALLED_REDELIVERIES.set(stalled_redeliveries);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());

        let second = init_metrics();
        assert!(second.is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["calls:reactivation", "completed"])
                .inc();
        }

        let output = export_metrics();
        assert!(!output.is_empty());
        assert!(!output.starts_with("# Error"));
    }
}
