//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for monitoring node operations and overall driver
//! health.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of node operations by type and status
    pub const CSI_NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: Duration of node operations in seconds
    pub const CSI_NODE_OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a node operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_NODE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_NODE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self { operation: operation.to_string(), start: Instant::now() }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}
