//! Observability for kvcore.
//!
//! Provides logging setup and the metrics the dispatch engine records. Metrics go through
//! the `metrics` facade; the embedding application decides where they end up, or calls
//! [`install_prometheus_recorder`] and serves the returned handle itself.

use crate::config::ObservabilityConfig;
use crate::error::{CoreError, Result};
use crate::message::ResponseStatus;
use crate::service::ServiceType;
use crate::state::LifecycleState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| CoreError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| CoreError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Install a global Prometheus recorder and return the handle used to render it.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        CoreError::Internal(format!("Failed to install metrics recorder: {}", e))
    })?;

    register_metrics();
    Ok(handle)
}

fn register_metrics() {
    counter!("kvcore_requests_dispatched_total").absolute(0);
    counter!("kvcore_backpressure_total").absolute(0);
    counter!("kvcore_routing_miss_total").absolute(0);
    counter!("kvcore_send_failures_total").absolute(0);
    counter!("kvcore_reconfigurations_total").absolute(0);
    gauge!("kvcore_nodes_live").set(0.0);
}

/// Record a request handed to at least one node.
pub fn record_dispatch(service_type: ServiceType) {
    counter!("kvcore_requests_dispatched_total", "service" => service_type.as_str()).increment(1);
}

/// Record a request rejected because the pipeline was full.
pub fn record_backpressure() {
    counter!("kvcore_backpressure_total").increment(1);
}

/// Record a request for which no node could be located.
pub fn record_routing_miss(service_type: ServiceType, status: ResponseStatus) {
    let reason = match status {
        ResponseStatus::BucketNotOpen => "bucket_not_open",
        _ => "not_connected",
    };
    counter!(
        "kvcore_routing_miss_total",
        "service" => service_type.as_str(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a failed send to one node.
pub fn record_send_failure(service_type: ServiceType) {
    counter!("kvcore_send_failures_total", "service" => service_type.as_str()).increment(1);
}

/// Record the size of a drained dispatch batch.
pub fn record_batch(size: usize) {
    histogram!("kvcore_dispatch_batch_size").record(size as f64);
}

/// Record a completed reconfiguration.
pub fn record_reconfiguration(duration: Duration, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("kvcore_reconfigurations_total", "outcome" => outcome).increment(1);
    histogram!("kvcore_reconfiguration_duration_seconds").record(duration.as_secs_f64());
}

/// Record the outcome of a node connect.
pub fn record_node_connect(state: LifecycleState) {
    counter!("kvcore_node_connects_total", "state" => state.as_str()).increment(1);
}

/// Update the live node gauge.
pub fn update_live_nodes(count: usize) {
    gauge!("kvcore_nodes_live").set(count as f64);
}
