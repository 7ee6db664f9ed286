//! Prometheus metrics for Tessera.
//!
//! Metric names are constants; the engine and RPC client record through the
//! helpers below. Without an installed recorder the `metrics` macros are
//! no-ops, so library users and tests pay nothing.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Multipart operations (counter). Labels: operation, status.
pub const MULTIPART_OPERATIONS_TOTAL: &str = "tessera_multipart_operations_total";

/// Bytes accepted into committed parts (counter).
pub const PART_BYTES_RECEIVED_TOTAL: &str = "tessera_part_bytes_received_total";

/// Live multipart uploads (gauge).
pub const MULTIPART_UPLOADS_ACTIVE: &str = "tessera_multipart_uploads_active";

/// RPC calls retried after a shut-down connection (counter). Labels: method.
pub const RPC_RETRIES_TOTAL: &str = "tessera_rpc_retries_total";

// -- Global recorder installation ---------------------------------------------

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global Prometheus recorder with a scrape listener on
/// `listen`. Idempotent. Must be called from within a tokio runtime.
pub fn init_metrics(listen: &str) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address {listen}: {e}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    let _ = INSTALLED.set(());
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(
        MULTIPART_OPERATIONS_TOTAL,
        "Multipart operations by type and outcome"
    );
    describe_counter!(PART_BYTES_RECEIVED_TOTAL, "Bytes committed into parts");
    describe_gauge!(MULTIPART_UPLOADS_ACTIVE, "Multipart uploads currently open");
    describe_counter!(RPC_RETRIES_TOTAL, "RPC calls retried after connection shutdown");
}

// -- Recording helpers --------------------------------------------------------

/// Count one finished engine operation. `status` is `ok` or an error code.
pub fn record_operation(operation: &'static str, status: &'static str) {
    counter!(MULTIPART_OPERATIONS_TOTAL, "operation" => operation, "status" => status)
        .increment(1);
}

pub fn record_part_bytes(bytes: u64) {
    counter!(PART_BYTES_RECEIVED_TOTAL).increment(bytes);
}

pub fn set_active_uploads(count: usize) {
    gauge!(MULTIPART_UPLOADS_ACTIVE).set(count as f64);
}

pub fn record_rpc_retry(method: &str) {
    counter!(RPC_RETRIES_TOTAL, "method" => method.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        record_operation("put_object_part", "ok");
        record_part_bytes(42);
        set_active_uploads(3);
        record_rpc_retry("Storage.MakeBucket");
    }

    #[test]
    fn test_metric_names_are_namespaced() {
        for name in [
            MULTIPART_OPERATIONS_TOTAL,
            PART_BYTES_RECEIVED_TOTAL,
            MULTIPART_UPLOADS_ACTIVE,
            RPC_RETRIES_TOTAL,
        ] {
            assert!(name.starts_with("tessera_"));
        }
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not-an-address").is_err());
    }
}
