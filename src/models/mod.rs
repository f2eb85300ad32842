//! Domain models for the metering core.

mod allowance;
mod grant;
mod ledger;
pub mod period;
mod reservation;

pub use allowance::{Allowance, NewAllowance, UsageHistory};
pub use grant::{AddOnGrant, NewGrant};
pub use ledger::{
    ContextLevel, CreditSource, DebitBreakdown, LedgerEntry, OperationKind, UsageBreakdown,
};
pub use period::{current_period, BillingPeriod};
pub use reservation::{NewReservation, Reservation, ReservationStatus};
