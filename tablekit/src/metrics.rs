use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "tablekit_operation_duration_seconds",
        "Client operation duration in seconds, including retries",
        &["operation", "status"]
    ).unwrap();

    pub static ref OPERATION_COUNTER: IntCounterVec = register_int_counter_vec!(
        "tablekit_operations_total",
        "Total number of client operations",
        &["operation", "status"]
    ).unwrap();

    pub static ref RETRY_COUNTER: IntCounterVec = register_int_counter_vec!(
        "tablekit_retries_total",
        "Total number of retried attempts",
        &["operation"]
    ).unwrap();
}

pub fn record_operation(operation: &str, success: bool, duration: f64) {
    let status = if success { "success" } else { "failure" };
    OPERATION_DURATION
        .with_label_values(&[operation, status])
        .observe(duration);
    OPERATION_COUNTER
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_retry(operation: &str) {
    RETRY_COUNTER.with_label_values(&[operation]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operation_counts_by_status() {
        let before = OPERATION_COUNTER
            .with_label_values(&["metrics_test", "failure"])
            .get();
        record_operation("metrics_test", false, 0.25);
        record_operation("metrics_test", true, 0.1);
        assert_eq!(
            OPERATION_COUNTER
                .with_label_values(&["metrics_test", "failure"])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_record_retry() {
        let before = RETRY_COUNTER.with_label_values(&["metrics_retry_test"]).get();
        record_retry("metrics_retry_test");
        record_retry("metrics_retry_test");
        assert_eq!(
            RETRY_COUNTER.with_label_values(&["metrics_retry_test"]).get(),
            before + 2
        );
    }
}
