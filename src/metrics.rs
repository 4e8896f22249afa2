//! Metrics initialization for the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

pub const QUERIES_TOTAL: &str = "dnsgate_queries_total";
pub const QUERIES_BLOCKED_TOTAL: &str = "dnsgate_queries_blocked_total";
pub const MALFORMED_QUERIES_TOTAL: &str = "dnsgate_malformed_queries_total";
pub const UPSTREAM_TIMEOUTS_TOTAL: &str = "dnsgate_upstream_timeouts_total";
pub const UPSTREAMS_EXHAUSTED_TOTAL: &str = "dnsgate_upstreams_exhausted_total";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    Ok(())
}
