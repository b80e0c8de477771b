use crate::{PoolStats, RunnerError};
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Run-level counters and timings.
///
/// The handles are no-ops until a recorder is installed, so the scheduler can
/// record unconditionally.
#[derive(Clone)]
pub struct Metrics {
    pub tasks_completed: Counter,
    pub tasks_failed: Counter,
    pub task_retries: Counter,
    pub task_duration: Histogram,
    pub pool_total: Gauge,
    pub pool_waiting: Gauge,
    pub pool_recycled: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tasks_completed: register_counter!("capture_tasks_completed_total"),
            tasks_failed: register_counter!("capture_tasks_failed_total"),
            task_retries: register_counter!("capture_task_retries_total"),
            task_duration: register_histogram!("capture_task_duration_seconds"),
            pool_total: register_gauge!("capture_pool_resources"),
            pool_waiting: register_gauge!("capture_pool_waiting"),
            pool_recycled: register_gauge!("capture_pool_recycled"),
        }
    }

    /// Handles that record nothing, regardless of any installed recorder.
    pub fn noop() -> Self {
        Self {
            tasks_completed: Counter::noop(),
            tasks_failed: Counter::noop(),
            task_retries: Counter::noop(),
            task_duration: Histogram::noop(),
            pool_total: Gauge::noop(),
            pool_waiting: Gauge::noop(),
            pool_recycled: Gauge::noop(),
        }
    }

    pub fn record_task(&self, duration: Duration, success: bool) {
        if success {
            self.tasks_completed.increment(1);
        } else {
            self.tasks_failed.increment(1);
        }

        self.task_duration.record(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.task_retries.increment(1);
    }

    pub fn record_pool(&self, stats: &PoolStats) {
        self.pool_total.set(stats.total as f64);
        self.pool_waiting.set(stats.waiting as f64);
        self.pool_recycled.set(stats.recycled as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global Prometheus recorder and serves `/metrics` on `port`.
pub fn install_prometheus_exporter(port: u16) -> Result<(), RunnerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RunnerError::Configuration(format!("Metrics exporter failed: {e}")))?;

    info!("Serving Prometheus metrics on {}", addr);
    Ok(())
}
