use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Save pipeline
    pub static ref AUTOSAVE_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "autosave_attempts_total",
        "Total number of autosave send attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref AUTOSAVE_SEND_DURATION_SECONDS: Histogram = register_histogram!(
        "autosave_send_duration_seconds",
        "Duration of autosave send attempts in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref AUTOSAVE_PENDING_CHANGES: IntGauge = register_int_gauge!(
        "autosave_pending_changes",
        "Number of questions with unsaved changes"
    )
    .unwrap();

    // Local backup
    pub static ref AUTOSAVE_BACKUP_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "autosave_backup_writes_total",
        "Total number of local backup operations",
        &["operation", "status"]
    )
    .unwrap();

    // Dev server
    pub static ref AUTOSAVE_DEV_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "autosave_dev_requests_total",
        "Total number of autosave requests handled by the dev server",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Record the outcome of one send attempt: `success`, `failure` or `cancelled`.
pub fn record_attempt(outcome: &str) {
    AUTOSAVE_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a local backup operation.
pub fn record_backup_operation(operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    AUTOSAVE_BACKUP_WRITES_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}
