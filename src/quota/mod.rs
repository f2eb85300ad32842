//! Quota engine: admission decisions, reservations, and the period clock
//! glue above the store.

pub mod guard;
pub mod reservation;
pub mod sweeper;
pub mod transition;

pub use guard::{DenialReason, QuotaDecision, QuotaGuard, UsageStatus};
pub use reservation::ReservationManager;
pub use sweeper::Sweeper;
pub use transition::{PeriodTransitionCoordinator, TransitionOutcome};
