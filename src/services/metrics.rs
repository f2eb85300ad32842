//! Metrics module for the metering core.
//! Provides Prometheus metrics for quota decisions and per-organization
//! credit accounting.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Reservation outcomes counter (per-organization metering)
pub static RESERVATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Settled ledger entries counter (per-organization metering)
pub static SETTLEMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credits debited counter by source
pub static CREDITS_DEBITED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Period transition counter
pub static TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Expired reservations swept counter
pub static RESERVATIONS_EXPIRED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    RESERVATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reservations_total",
                "Reservation attempts by organization and outcome"
            ),
            &["organization_id", "outcome"]
        )
        .expect("Failed to register RESERVATIONS_TOTAL")
    });

    SETTLEMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_settlements_total",
                "Settled debits by organization and operation kind"
            ),
            &["organization_id", "operation"]
        )
        .expect("Failed to register SETTLEMENTS_TOTAL")
    });

    CREDITS_DEBITED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_credits_debited_total",
                "Credits debited by organization and source"
            ),
            &["organization_id", "source"]
        )
        .expect("Failed to register CREDITS_DEBITED_TOTAL")
    });

    TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_period_transitions_total",
                "Period transitions by organization and outcome"
            ),
            &["organization_id", "outcome"]
        )
        .expect("Failed to register TRANSITIONS_TOTAL")
    });

    RESERVATIONS_EXPIRED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reservations_expired_total",
                "Abandoned reservations swept to expired"
            ),
            &["sweeper"]
        )
        .expect("Failed to register RESERVATIONS_EXPIRED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a reservation attempt outcome.
pub fn record_reservation(organization_id: &str, outcome: &str) {
    if let Some(counter) = RESERVATIONS_TOTAL.get() {
        counter.with_label_values(&[organization_id, outcome]).inc();
    }
}

/// Record a settled debit.
pub fn record_settlement(organization_id: &str, operation: &str) {
    if let Some(counter) = SETTLEMENTS_TOTAL.get() {
        counter
            .with_label_values(&[organization_id, operation])
            .inc();
    }
}

/// Record credits debited from a source.
pub fn record_credits_debited(organization_id: &str, source: &str, amount: i64) {
    if amount <= 0 {
        return;
    }
    if let Some(counter) = CREDITS_DEBITED_TOTAL.get() {
        counter
            .with_label_values(&[organization_id, source])
            .inc_by(amount as u64);
    }
}

/// Record a period transition outcome.
pub fn record_transition(organization_id: &str, outcome: &str) {
    if let Some(counter) = TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[organization_id, outcome]).inc();
    }
}

/// Record reservations swept to expired.
pub fn record_expired(count: u64) {
    if count == 0 {
        return;
    }
    if let Some(counter) = RESERVATIONS_EXPIRED_TOTAL.get() {
        counter.with_label_values(&["sweep"]).inc_by(count);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
