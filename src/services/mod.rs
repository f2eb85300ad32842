//! Services module for the metering core.

pub mod metrics;

pub use metrics::{
    get_metrics, init_metrics, record_credits_debited, record_error, record_expired,
    record_reservation, record_settlement, record_transition,
};
