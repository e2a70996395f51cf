//! Prometheus metrics for invoicing-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// HTTP request counter by route and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register http_requests_total")
});

/// HTTP request duration histogram by route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "invoicing_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register http_request_duration")
});

/// Invoice transitions by status.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_invoices_total",
        "Total number of invoice transitions by status",
        &["status"] // pending, issued, failed, cancelled
    )
    .expect("Failed to register invoices_total")
});

/// Provider requests published, by operation and outcome.
pub static DISPATCHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_dispatches_total",
        "Provider requests published by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to register dispatches_total")
});

/// Broker messages handled, by queue and outcome.
pub static MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_messages_total",
        "Broker messages handled by queue and outcome",
        &["queue", "outcome"]
    )
    .expect("Failed to register messages_total")
});

/// Filter rejections by rule code.
pub static FILTER_REJECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_filter_rejections_total",
        "Orders rejected by the filter engine by rule",
        &["rule"]
    )
    .expect("Failed to register filter_rejections_total")
});

/// Retry sweep results.
pub static RETRY_SWEEP_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_retry_sweep_total",
        "Retry attempts started by the sweep by outcome",
        &["outcome"]
    )
    .expect("Failed to register retry_sweep_total")
});

/// Config cache lookups.
pub static CONFIG_CACHE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_config_cache_total",
        "Config cache lookups by result",
        &["result"] // hit, miss, error
    )
    .expect("Failed to register config_cache_total")
});

/// Realtime events by type and outcome.
pub static REALTIME_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_realtime_events_total",
        "Realtime events by type and outcome",
        &["event_type", "outcome"]
    )
    .expect("Failed to register realtime_events_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "invoicing_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "invoicing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Provider HTTP call duration.
pub static PROVIDER_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "invoicing_provider_request_duration_seconds",
        "Provider HTTP call duration in seconds",
        &["provider", "operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register provider_request_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&DISPATCHES_TOTAL);
    Lazy::force(&MESSAGES_TOTAL);
    Lazy::force(&FILTER_REJECTIONS_TOTAL);
    Lazy::force(&RETRY_SWEEP_TOTAL);
    Lazy::force(&CONFIG_CACHE_TOTAL);
    Lazy::force(&REALTIME_EVENTS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PROVIDER_REQUEST_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
