//! Ledger entry model and the closed credit/operation enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Credit source a debit can draw from, in no particular order here; the
/// consumption order is configuration (see `QuotaConfig::precedence`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    Rollover,
    Base,
    AddOn,
    Bonus,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::Rollover => "rollover",
            CreditSource::Base => "base",
            CreditSource::AddOn => "add_on",
            CreditSource::Bonus => "bonus",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "rollover" => CreditSource::Rollover,
            "add_on" => CreditSource::AddOn,
            "bonus" => CreditSource::Bonus,
            _ => CreditSource::Base,
        }
    }

    /// Default consumption order: "use it or lose it" sources before
    /// allowances that simply reset next period.
    pub fn default_precedence() -> Vec<CreditSource> {
        vec![
            CreditSource::Rollover,
            CreditSource::Base,
            CreditSource::AddOn,
            CreditSource::Bonus,
        ]
    }
}

impl std::fmt::Display for CreditSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category of metered operation. Closed set so usage breakdowns aggregate
/// precisely instead of growing a bag of ad-hoc counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Generation,
    Analysis,
    Transformation,
    Search,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Generation => "generation",
            OperationKind::Analysis => "analysis",
            OperationKind::Transformation => "transformation",
            OperationKind::Search => "search",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "analysis" => OperationKind::Analysis,
            "transformation" => OperationKind::Transformation,
            "search" => OperationKind::Search,
            _ => OperationKind::Generation,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much context an operation is allowed to consume; maps to a credit
/// cost through `QuotaConfig::costs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Compact,
    Standard,
    Extended,
}

impl ContextLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::Compact => "compact",
            ContextLevel::Standard => "standard",
            ContextLevel::Extended => "extended",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "compact" => ContextLevel::Compact,
            "extended" => ContextLevel::Extended,
            _ => ContextLevel::Standard,
        }
    }
}

/// Typed per-operation usage counters kept on the live allowance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageBreakdown(pub BTreeMap<OperationKind, i64>);

impl UsageBreakdown {
    pub fn record(&mut self, kind: OperationKind, amount: i64) {
        *self.0.entry(kind).or_insert(0) += amount;
    }

    pub fn get(&self, kind: OperationKind) -> i64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }
}

/// Per-source split of a single debit. A settle that drains one source
/// carries the remainder into the next, so one ledger entry may touch
/// several sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitBreakdown {
    pub rollover: i64,
    pub base: i64,
    pub add_on: i64,
    pub bonus: i64,
}

impl DebitBreakdown {
    pub fn get(&self, source: CreditSource) -> i64 {
        match source {
            CreditSource::Rollover => self.rollover,
            CreditSource::Base => self.base,
            CreditSource::AddOn => self.add_on,
            CreditSource::Bonus => self.bonus,
        }
    }

    pub fn add(&mut self, source: CreditSource, amount: i64) {
        match source {
            CreditSource::Rollover => self.rollover += amount,
            CreditSource::Base => self.base += amount,
            CreditSource::AddOn => self.add_on += amount,
            CreditSource::Bonus => self.bonus += amount,
        }
    }

    pub fn total(&self) -> i64 {
        self.rollover + self.base + self.add_on + self.bonus
    }

    /// First source the debit drew from, in default precedence order. The
    /// scalar view consumers expect when they do not care about splits.
    pub fn primary_source(&self) -> Option<CreditSource> {
        CreditSource::default_precedence()
            .into_iter()
            .find(|s| self.get(*s) > 0)
    }
}

/// Append-only record of a committed debit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub idempotency_key: String,
    pub operation: String,
    pub resource_ref: Option<String>,
    pub amount: i64,
    pub sources: Json<DebitBreakdown>,
    pub balance_after: i64,
    pub posted_utc: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn operation_kind(&self) -> OperationKind {
        OperationKind::from_string(&self.operation)
    }
}
