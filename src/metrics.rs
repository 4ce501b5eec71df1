//! Pipeline metrics.
//!
//! Counters are recorded through the `metrics` facade; they are no-ops until a
//! recorder is installed by [`init_metrics`].

use crate::constants;
use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Install the Prometheus exporter when `EXCAVATOR_METRICS_ADDR` names a socket
/// address. Idempotent. Must be called from inside the tokio runtime.
pub fn init_metrics() {
    INIT.call_once(|| {
        let addr_str = match std::env::var(constants::ENV_METRICS_ADDR) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => return,
        };
        let addr = match addr_str.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid metrics addr '{}': {}", addr_str, e);
                return;
            }
        };
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

/// Metric names, prefixed per phase.
pub mod names {
    pub const RECORDS_ASSEMBLED: &str = "excavator_assembler_records_total";
    pub const TRAILING_DISCARDED: &str = "excavator_assembler_trailing_discarded_total";
    pub const RECORDS_PARSED: &str = "excavator_parser_records_total";
    pub const PARSE_FAILURES: &str = "excavator_parser_failures_total";
    pub const ANOMALIES: &str = "excavator_normalizer_anomalies_total";
    pub const DOCUMENTS_DELIVERED: &str = "excavator_dispatcher_documents_total";
    pub const BATCHES_FLUSHED: &str = "excavator_dispatcher_batches_total";
    pub const FLUSH_RETRIES: &str = "excavator_dispatcher_retries_total";
    pub const FLUSH_DURATION: &str = "excavator_dispatcher_flush_duration_seconds";
    pub const FILES_DONE: &str = "excavator_files_done_total";
}

pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_assembled() {
        ::metrics::counter!(names::RECORDS_ASSEMBLED).increment(1);
    }

    pub fn record_trailing_discarded() {
        ::metrics::counter!(names::TRAILING_DISCARDED).increment(1);
    }

    pub fn record_parsed() {
        ::metrics::counter!(names::RECORDS_PARSED).increment(1);
    }

    pub fn record_parse_failure() {
        ::metrics::counter!(names::PARSE_FAILURES).increment(1);
    }

    pub fn record_anomalies(count: usize) {
        if count > 0 {
            ::metrics::counter!(names::ANOMALIES).increment(count as u64);
        }
    }

    pub fn record_flush(documents: usize, duration_secs: f64) {
        ::metrics::counter!(names::BATCHES_FLUSHED).increment(1);
        ::metrics::counter!(names::DOCUMENTS_DELIVERED).increment(documents as u64);
        ::metrics::histogram!(names::FLUSH_DURATION).record(duration_secs);
    }

    pub fn record_retry() {
        ::metrics::counter!(names::FLUSH_RETRIES).increment(1);
    }

    pub fn record_file_done() {
        ::metrics::counter!(names::FILES_DONE).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        PipelineMetrics::record_assembled();
        PipelineMetrics::record_anomalies(3);
        PipelineMetrics::record_flush(10, 0.25);
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            names::RECORDS_ASSEMBLED,
            names::PARSE_FAILURES,
            names::FLUSH_RETRIES,
            names::FILES_DONE,
        ] {
            assert!(name.starts_with("excavator_"));
        }
    }
}
