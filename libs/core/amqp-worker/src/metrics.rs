//! Prometheus metrics for the AMQP client
//!
//! Provides observability into delivery handling and connection health.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    get_metrics_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record whether the client currently holds a usable connection
pub fn connection_ready(ready: bool) {
    gauge!("amqp_worker_connection_ready").set(if ready { 1.0 } else { 0.0 });
}

/// Record a lost connection
pub fn connection_lost() {
    counter!("amqp_worker_connection_lost_total").increment(1);
}

/// Record a reconnect attempt
pub fn reconnect_attempt(success: bool) {
    counter!(
        "amqp_worker_reconnect_attempts_total",
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Record a publish result
pub fn publish_result(exchange: &str, status: &'static str) {
    counter!(
        "amqp_worker_publish_total",
        "exchange" => exchange.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Consumer metrics helper
#[derive(Clone)]
pub struct ConsumerMetrics {
    /// Queue name for labeling
    queue: String,
    /// Handler name for labeling
    handler: String,
}

impl ConsumerMetrics {
    /// Create new ConsumerMetrics
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    /// Record a delivery being received
    pub fn delivery_received(&self) {
        counter!(
            "amqp_worker_deliveries_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a delivery acknowledged after successful handling
    pub fn delivery_acked(&self, duration: Duration) {
        counter!(
            "amqp_worker_deliveries_acked_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);

        histogram!(
            "amqp_worker_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a rejected delivery
    pub fn delivery_rejected(&self, requeue: bool, reason: &'static str) {
        counter!(
            "amqp_worker_deliveries_rejected_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "requeue" => requeue.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record handler retries for one delivery
    pub fn handler_retried(&self, retries: u32) {
        if retries == 0 {
            return;
        }
        counter!(
            "amqp_worker_handler_retries_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(u64::from(retries));
    }

    /// Record an ack or reject that did not reach the broker
    pub fn settle_failed(&self) {
        counter!(
            "amqp_worker_settle_errors_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a consumer setup failure (QoS or basic.consume)
    pub fn setup_failed(&self, stage: &'static str) {
        counter!(
            "amqp_worker_consumer_setup_errors_total",
            "queue" => self.queue.clone(),
            "stage" => stage
        )
        .increment(1);
    }
}
