//! Usage metering and quota enforcement core.
//!
//! Tracks per-organization credit consumption against a monthly allowance
//! with four sub-balances (rollover, base, add-on, bonus), guards metered
//! operations through an estimate/settle reservation protocol, and advances
//! allowances across billing period boundaries exactly once with no
//! scheduled jobs.
//!
//! The typical call sequence:
//!
//! 1. [`quota::QuotaGuard::check_and_reserve`] before running a metered
//!    operation; the decision carries a reservation id when allowed.
//! 2. [`quota::QuotaGuard::commit`] with the actual cost and an idempotency
//!    key once the operation finished, or [`quota::QuotaGuard::cancel`] if
//!    it failed before producing anything billable.
//!
//! Storage is pluggable through [`store::QuotaStore`]: [`store::PgStore`]
//! for deployments, [`store::MemoryStore`] for tests and embedded use.

pub mod config;
pub mod error;
pub mod limiter;
pub mod models;
pub mod observability;
pub mod plan;
pub mod precedence;
pub mod proration;
pub mod quota;
pub mod services;
pub mod store;
