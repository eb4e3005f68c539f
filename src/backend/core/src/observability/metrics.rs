//! Prometheus metrics for the reindex engine.
//!
//! Recording goes through the `metrics` facade, so helpers are no-ops until a
//! recorder is installed with [`init_metrics`].

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::jobs::retry_queue::RetryMode;
use crate::jobs::task::TaskStatus;

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0];

/// Handle for rendering collected metrics.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that renders nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and describe every metric.
pub fn init_metrics(service_name: &str) -> anyhow::Result<MetricsRegistry> {
    let handle = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("reindex_task_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;

    register_metrics();
    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!("reindex_tasks_submitted_total", "Reindex tasks created");
    describe_counter!(
        "reindex_tasks_finished_total",
        "Reindex tasks that reached a terminal status"
    );
    describe_counter!("reindex_retries_total", "Retries dispatched from the queue");
    describe_counter!(
        "reindex_watchdog_timeouts_total",
        "Running tasks force-failed by the watchdog"
    );
    describe_counter!("reindex_errors_total", "Errors raised by the engine");

    describe_gauge!("reindex_queue_depth", "Entries in the retry queue");
    describe_gauge!("reindex_tasks_running", "Tasks currently running");

    describe_histogram!(
        "reindex_task_duration_seconds",
        "Wall time from start to terminal status"
    );
}

pub fn record_task_submitted(is_retry: bool) {
    counter!("reindex_tasks_submitted_total", "retry" => is_retry.to_string()).increment(1);
}

pub fn record_task_finished(status: TaskStatus, duration_ms: Option<i64>) {
    counter!("reindex_tasks_finished_total", "status" => status.to_string()).increment(1);
    if let Some(ms) = duration_ms {
        histogram!("reindex_task_duration_seconds", "status" => status.to_string())
            .record(ms as f64 / 1000.0);
    }
}

pub fn record_retry(mode: RetryMode) {
    counter!("reindex_retries_total", "mode" => mode.to_string()).increment(1);
}

pub fn record_watchdog_timeout() {
    counter!("reindex_watchdog_timeouts_total").increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("reindex_queue_depth").set(depth as f64);
}

pub fn set_running_tasks(count: usize) {
    gauge!("reindex_tasks_running").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_empty() {
        assert!(MetricsRegistry::disabled().render().is_empty());
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        record_task_submitted(false);
        record_task_finished(TaskStatus::Completed, Some(1200));
        record_retry(RetryMode::Manual);
        set_queue_depth(3);
    }
}
