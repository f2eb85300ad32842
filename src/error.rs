//! Error taxonomy for the metering core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// The organization does not have enough credit for the requested debit
    /// or reservation. Callers surface this as an upgrade/wait prompt.
    #[error("Insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: i64, available: i64 },

    /// Malformed billing anchor (e.g. an anchor in the future). Fatal
    /// configuration error.
    #[error("Invalid billing anchor: {0}")]
    InvalidAnchor(anyhow::Error),

    /// A period that violates the clock invariants (start >= end).
    #[error("Invalid billing period: {0}")]
    InvalidPeriod(anyhow::Error),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(uuid::Uuid),

    /// The reservation already reached a terminal state and the idempotency
    /// key does not match a prior settle. A caller logic error, not a retry.
    #[error("Reservation already settled: {0}")]
    ReservationAlreadySettled(uuid::Uuid),

    /// A losing racer in the period transition. Transient; the caller
    /// re-reads rather than retrying the transition itself.
    #[error("Concurrent period transition for organization {0}")]
    TransitionConflict(uuid::Uuid),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    /// Label used by the error metrics counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            AppError::InsufficientCredit { .. } => "insufficient_credit",
            AppError::InvalidAnchor(_) => "invalid_anchor",
            AppError::InvalidPeriod(_) => "invalid_period",
            AppError::ReservationNotFound(_) => "reservation_not_found",
            AppError::ReservationAlreadySettled(_) => "reservation_already_settled",
            AppError::TransitionConflict(_) => "transition_conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InternalError(_) => "internal",
            AppError::DatabaseError(_) => "database",
            AppError::ConfigError(_) => "config",
        }
    }
}
