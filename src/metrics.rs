//! Prometheus metrics for the gateway.
//!
//! Counters and histograms for credential checks, directory lookups,
//! warehouse reads and the row cache.

use eyre::{Result, WrapErr};
use metrics::{counter, histogram};

/// Record a credential check. `tier` is `user` or `privileged`.
pub fn record_auth(tier: &str, outcome: &str) {
    counter!("auth_checks_total", "tier" => tier.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a key directory read.
pub fn record_directory_lookup(kind: &str, success: bool, duration_ms: u64) {
    counter!("directory_lookups_total", "kind" => kind.to_string(), "success" => success.to_string())
        .increment(1);
    histogram!("directory_lookup_duration_ms").record(duration_ms as f64);
}

/// Record a warehouse table read.
pub fn record_table_read(table: &str, success: bool, duration_ms: u64) {
    counter!("table_reads_total", "table" => table.to_string(), "success" => success.to_string())
        .increment(1);
    histogram!("table_read_duration_ms").record(duration_ms as f64);
}

/// Record a cache hit.
pub fn record_cache_hit() {
    counter!("cache_hits_total").increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!("cache_misses_total").increment(1);
}

/// Install the Prometheus metrics exporter and return the recorder handle.
pub fn install_prometheus_recorder() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install Prometheus recorder")
}
