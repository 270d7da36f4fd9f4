// src/metrics.rs

#[cfg(feature = "observability")]
pub use ::metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_histogram, histogram};

/// Registers descriptions for every side-effect metric.
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "side_effect_executions_total",
        Unit::Count,
        "Guarded operations executed, labeled by operation name."
    );
    describe_counter!(
        "side_effect_skips_total",
        Unit::Count,
        "Duplicate invocations skipped, labeled by operation and whether a cached result was returned."
    );
    describe_counter!(
        "side_effect_failures_total",
        Unit::Count,
        "Guarded operations that failed or were cancelled and had their reservation released."
    );
    describe_counter!(
        "side_effect_cleared_total",
        Unit::Count,
        "Side effect keys deleted by invalidation, labeled by trigger (directive, explicit)."
    );
    describe_histogram!(
        "side_effect_store_duration_seconds",
        Unit::Seconds,
        "Backing store round trip latency, labeled by operation."
    );
}

pub fn increment_execution(operation: &str) {
    counter!("side_effect_executions_total", 1, "operation" => operation.to_string());
}

pub fn increment_skip(operation: &str, cached: bool) {
    counter!(
        "side_effect_skips_total",
        1,
        "operation" => operation.to_string(),
        "cached" => cached.to_string()
    );
}

pub fn increment_failure(operation: &str) {
    counter!("side_effect_failures_total", 1, "operation" => operation.to_string());
}

pub fn increment_cleared(trigger: &'static str, count: usize) {
    counter!("side_effect_cleared_total", count as u64, "trigger" => trigger);
}

pub fn record_store_duration(operation: &'static str, duration: std::time::Duration) {
    histogram!(
        "side_effect_store_duration_seconds",
        duration.as_secs_f64(),
        "operation" => operation
    );
}
