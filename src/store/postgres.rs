//! PostgreSQL store backend.
//!
//! Per-organization atomicity comes from `SELECT ... FOR UPDATE` on the
//! allowance row; every multi-step mutation locks it first, so writers for
//! one organization serialize across service instances. Exactly-once
//! guarantees additionally lean on unique constraints (organization_id on
//! allowances, (organization_id, period_start) on usage_history,
//! idempotency_key on ledger_entries) so a race lost at the database still
//! resolves to the winner's row.

use crate::error::AppError;
use crate::models::{
    AddOnGrant, Allowance, CreditSource, LedgerEntry, NewAllowance, NewGrant, NewReservation,
    Reservation, ReservationStatus, UsageBreakdown, UsageHistory,
};
use crate::precedence::{self, plan_debit};
use crate::proration::{self, ProratedLimits};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::store::{QuotaStore, SettleRequest, TransitionSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ALLOWANCE_COLUMNS: &str = "allowance_id, organization_id, user_id, period_start, period_end, \
     base_granted, base_remaining, rollover_granted, rollover_remaining, \
     addon_granted, addon_remaining, bonus_granted, bonus_remaining, \
     credits_used, breakdown, created_utc, updated_utc";

const LEDGER_COLUMNS: &str = "entry_id, organization_id, user_id, reservation_id, idempotency_key, \
     operation, resource_ref, amount, sources, balance_after, posted_utc";

const RESERVATION_COLUMNS: &str = "reservation_id, organization_id, user_id, estimated_amount, \
     actual_amount, status, expires_at, created_utc, updated_utc";

const GRANT_COLUMNS: &str =
    "grant_id, organization_id, credits_granted, credits_remaining, expires_at, recurring, purchased_utc";

/// Database-backed `QuotaStore`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn lock_allowance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        organization_id: Uuid,
    ) -> Result<Option<Allowance>, AppError> {
        sqlx::query_as::<_, Allowance>(&format!(
            "SELECT {ALLOWANCE_COLUMNS} FROM allowances WHERE organization_id = $1 FOR UPDATE"
        ))
        .bind(organization_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock allowance: {}", e)))
    }

    async fn active_grants_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<AddOnGrant>, AppError> {
        sqlx::query_as::<_, AddOnGrant>(&format!(
            "SELECT {GRANT_COLUMNS} FROM addon_grants \
             WHERE organization_id = $1 AND credits_remaining > 0 \
               AND (expires_at IS NULL OR expires_at > $2) \
             ORDER BY purchased_utc"
        ))
        .bind(organization_id)
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch grants: {}", e)))
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn get_allowance(&self, organization_id: Uuid) -> Result<Option<Allowance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_allowance"])
            .start_timer();

        let allowance = sqlx::query_as::<_, Allowance>(&format!(
            "SELECT {ALLOWANCE_COLUMNS} FROM allowances WHERE organization_id = $1"
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get allowance: {}", e)))?;

        timer.observe_duration();

        Ok(allowance)
    }

    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    async fn create_allowance(&self, input: &NewAllowance) -> Result<Allowance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_allowance"])
            .start_timer();

        let now = Utc::now();
        let result = sqlx::query_as::<_, Allowance>(&format!(
            "INSERT INTO allowances ({ALLOWANCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7, $8, $9, 0, 0, 0, $10, $11, $11) \
             RETURNING {ALLOWANCE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(input.organization_id)
        .bind(input.user_id)
        .bind(input.period.start)
        .bind(input.period.end)
        .bind(input.base_granted)
        .bind(input.rollover_granted)
        .bind(input.addon_granted)
        .bind(input.addon_remaining)
        .bind(Json(UsageBreakdown::default()))
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        let allowance = match result {
            Ok(allowance) => allowance,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Another creator won the race; their row is authoritative.
                self.get_allowance(input.organization_id).await?.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Allowance vanished after unique violation"
                    ))
                })?
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create allowance: {}",
                    e
                )));
            }
        };

        timer.observe_duration();

        Ok(allowance)
    }

    #[instrument(skip(self, spec), fields(organization_id = %organization_id))]
    async fn transition_allowance(
        &self,
        organization_id: Uuid,
        spec: &TransitionSpec,
    ) -> Result<Allowance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_allowance"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let old = self
            .lock_allowance(&mut tx, organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        if old.period_start != spec.expected_period_start {
            tx.rollback().await.ok();
            return Err(AppError::TransitionConflict(organization_id));
        }

        // Rollover is computed from the balances as locked here, not from
        // whatever the caller last read.
        let unused = old.base_remaining + old.rollover_remaining;
        let rollover =
            proration::rollover_credits(unused, spec.rollover_percent, spec.rollover_cap);
        let grants = self.active_grants_tx(&mut tx, organization_id, now).await?;
        let addon = precedence::active_grant_credit(&grants, now);

        let archive = sqlx::query(
            "INSERT INTO usage_history (history_id, organization_id, user_id, period_start, period_end, \
                 base_granted, base_remaining, rollover_granted, rollover_remaining, \
                 addon_granted, addon_remaining, bonus_granted, bonus_remaining, \
                 credits_used, breakdown, archived_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(old.user_id)
        .bind(old.period_start)
        .bind(old.period_end)
        .bind(old.base_granted)
        .bind(old.base_remaining)
        .bind(old.rollover_granted)
        .bind(old.rollover_remaining)
        .bind(old.addon_granted)
        .bind(old.addon_remaining)
        .bind(old.bonus_granted)
        .bind(old.bonus_remaining)
        .bind(old.credits_used)
        .bind(&old.breakdown)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(ref db_err)) = archive {
            if db_err.is_unique_violation() {
                // This period was already archived by a concurrent winner.
                tx.rollback().await.ok();
                return Err(AppError::TransitionConflict(organization_id));
            }
        }
        archive.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to archive allowance: {}", e))
        })?;

        let replacement = sqlx::query_as::<_, Allowance>(&format!(
            "UPDATE allowances SET \
                 allowance_id = $2, period_start = $3, period_end = $4, \
                 base_granted = $5, base_remaining = $5, \
                 rollover_granted = $6, rollover_remaining = $6, \
                 addon_granted = $7, addon_remaining = $7, \
                 bonus_granted = 0, bonus_remaining = 0, \
                 credits_used = 0, breakdown = $8, created_utc = $9, updated_utc = $9 \
             WHERE organization_id = $1 \
             RETURNING {ALLOWANCE_COLUMNS}"
        ))
        .bind(organization_id)
        .bind(Uuid::new_v4())
        .bind(spec.new_period.start)
        .bind(spec.new_period.end)
        .bind(spec.base_granted)
        .bind(rollover)
        .bind(addon)
        .bind(Json(UsageBreakdown::default()))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to replace allowance: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transition: {}", e))
        })?;

        timer.observe_duration();

        info!(
            organization_id = %organization_id,
            period_start = %replacement.period_start,
            rollover = rollover,
            "Allowance transitioned"
        );

        Ok(replacement)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn list_usage_history(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageHistory>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageHistory>(
            "SELECT history_id, organization_id, user_id, period_start, period_end, \
                 base_granted, base_remaining, rollover_granted, rollover_remaining, \
                 addon_granted, addon_remaining, bonus_granted, bonus_remaining, \
                 credits_used, breakdown, archived_utc \
             FROM usage_history \
             WHERE organization_id = $1 \
             ORDER BY period_start DESC \
             LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list history: {}", e)))?;

        timer.observe_duration();

        Ok(rows)
    }

    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    async fn create_grant(&self, input: &NewGrant) -> Result<AddOnGrant, AppError> {
        if input.credits_granted <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Grant must carry positive credits"
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_grant"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let grant = sqlx::query_as::<_, AddOnGrant>(&format!(
            "INSERT INTO addon_grants ({GRANT_COLUMNS}) \
             VALUES ($1, $2, $3, $3, $4, $5, $6) \
             RETURNING {GRANT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(input.organization_id)
        .bind(input.credits_granted)
        .bind(input.expires_at)
        .bind(input.recurring)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create grant: {}", e)))?;

        // Keep the allowance snapshot in step; no allowance yet is fine, the
        // first transition recomputes the snapshot from the grants table.
        sqlx::query(
            "UPDATE allowances SET \
                 addon_granted = addon_granted + $2, \
                 addon_remaining = addon_remaining + $2, \
                 updated_utc = $3 \
             WHERE organization_id = $1",
        )
        .bind(input.organization_id)
        .bind(input.credits_granted)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reflect grant: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit grant: {}", e))
        })?;

        timer.observe_duration();

        info!(
            grant_id = %grant.grant_id,
            credits = grant.credits_granted,
            "Add-on grant created"
        );

        Ok(grant)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn active_grants(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<AddOnGrant>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_grants"])
            .start_timer();

        let grants = sqlx::query_as::<_, AddOnGrant>(&format!(
            "SELECT {GRANT_COLUMNS} FROM addon_grants \
             WHERE organization_id = $1 AND credits_remaining > 0 \
               AND (expires_at IS NULL OR expires_at > $2) \
             ORDER BY purchased_utc"
        ))
        .bind(organization_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch grants: {}", e)))?;

        timer.observe_duration();

        Ok(grants)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn grant_bonus(
        &self,
        organization_id: Uuid,
        amount: i64,
    ) -> Result<Allowance, AppError> {
        if amount <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Bonus amount must be positive"
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["grant_bonus"])
            .start_timer();

        let allowance = sqlx::query_as::<_, Allowance>(&format!(
            "UPDATE allowances SET \
                 bonus_granted = bonus_granted + $2, \
                 bonus_remaining = bonus_remaining + $2, \
                 updated_utc = $3 \
             WHERE organization_id = $1 \
             RETURNING {ALLOWANCE_COLUMNS}"
        ))
        .bind(organization_id)
        .bind(amount)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to grant bonus: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        timer.observe_duration();

        Ok(allowance)
    }

    #[instrument(skip(self, input, order), fields(organization_id = %input.organization_id, estimate = input.estimated_amount))]
    async fn try_reserve(
        &self,
        input: &NewReservation,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["try_reserve"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let allowance = self
            .lock_allowance(&mut tx, input.organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        let held: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(estimated_amount), 0) FROM reservations \
             WHERE organization_id = $1 AND status = 'held' AND expires_at > $2",
        )
        .bind(input.organization_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum holds: {}", e)))?;

        let grants = self
            .active_grants_tx(&mut tx, input.organization_id, now)
            .await?;
        let available = precedence::available_credit(&allowance, &grants, order, now) - held;

        if available < input.estimated_amount {
            tx.rollback().await.ok();
            return Err(AppError::InsufficientCredit {
                required: input.estimated_amount,
                available: available.max(0),
            });
        }

        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "INSERT INTO reservations ({RESERVATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, NULL, 'held', $5, $6, $6) \
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(input.organization_id)
        .bind(input.user_id)
        .bind(input.estimated_amount)
        .bind(input.expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert reservation: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit reservation: {}", e))
        })?;

        timer.observe_duration();

        Ok(reservation)
    }

    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_reservation"])
            .start_timer();

        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE reservation_id = $1"
        ))
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get reservation: {}", e))
        })?;

        timer.observe_duration();

        Ok(reservation)
    }

    #[instrument(skip(self, req, order), fields(reservation_id = %req.reservation_id, actual = req.actual_amount))]
    async fn settle_reservation(
        &self,
        req: &SettleRequest,
        order: &[CreditSource],
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_reservation"])
            .start_timer();

        let reservation = self
            .get_reservation(req.reservation_id)
            .await?
            .ok_or(AppError::ReservationNotFound(req.reservation_id))?;
        let organization_id = reservation.organization_id;

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut allowance = self
            .lock_allowance(&mut tx, organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        // Replay check under the lock: a known key returns the original
        // outcome without debiting again.
        let existing = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(&req.idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check idempotency: {}", e))
        })?;

        if let Some(entry) = existing {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(entry);
        }

        // Re-read the reservation inside the critical section; the earlier
        // read raced with other settlers.
        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE reservation_id = $1"
        ))
        .bind(req.reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get reservation: {}", e))
        })?
        .ok_or(AppError::ReservationNotFound(req.reservation_id))?;

        if reservation.parsed_status() != ReservationStatus::Held {
            tx.rollback().await.ok();
            return Err(AppError::ReservationAlreadySettled(req.reservation_id));
        }

        let grants = self.active_grants_tx(&mut tx, organization_id, now).await?;

        // All checks precede any write; a failing plan leaves every row
        // untouched.
        let plan = plan_debit(&allowance, &grants, order, req.actual_amount, now)?;

        allowance.rollover_remaining -= plan.sources.rollover;
        allowance.base_remaining -= plan.sources.base;
        allowance.addon_remaining -= plan.sources.add_on;
        allowance.bonus_remaining -= plan.sources.bonus;
        allowance.credits_used += plan.total();
        allowance.breakdown.0.record(req.operation, plan.total());

        sqlx::query(
            "UPDATE allowances SET \
                 base_remaining = $2, rollover_remaining = $3, \
                 addon_remaining = $4, bonus_remaining = $5, \
                 credits_used = $6, breakdown = $7, updated_utc = $8 \
             WHERE organization_id = $1",
        )
        .bind(organization_id)
        .bind(allowance.base_remaining)
        .bind(allowance.rollover_remaining)
        .bind(allowance.addon_remaining)
        .bind(allowance.bonus_remaining)
        .bind(allowance.credits_used)
        .bind(&allowance.breakdown)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to debit allowance: {}", e))
        })?;

        for debit in &plan.grant_debits {
            sqlx::query(
                "UPDATE addon_grants SET credits_remaining = credits_remaining - $2 \
                 WHERE grant_id = $1",
            )
            .bind(debit.grant_id)
            .bind(debit.amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to debit grant: {}", e))
            })?;
        }

        sqlx::query(
            "UPDATE reservations SET status = 'committed', actual_amount = $2, updated_utc = $3 \
             WHERE reservation_id = $1",
        )
        .bind(req.reservation_id)
        .bind(req.actual_amount)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit reservation: {}", e))
        })?;

        let inserted = sqlx::query_as::<_, LedgerEntry>(&format!(
            "INSERT INTO ledger_entries ({LEDGER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {LEDGER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(Some(reservation.user_id))
        .bind(Some(req.reservation_id))
        .bind(&req.idempotency_key)
        .bind(req.operation.as_str())
        .bind(&req.resource_ref)
        .bind(plan.total())
        .bind(Json(plan.sources))
        .bind(allowance.total_remaining())
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let entry = match inserted {
            Ok(entry) => entry,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Idempotency key race: another settle won. Roll back our
                // debits and return the winner's entry.
                tx.rollback().await.ok();
                let entry = self
                    .find_ledger_entry(&req.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Ledger entry vanished after unique violation"
                        ))
                    })?;
                timer.observe_duration();
                return Ok(entry);
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert ledger entry: {}",
                    e
                )));
            }
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit settlement: {}", e))
        })?;

        timer.observe_duration();

        info!(
            entry_id = %entry.entry_id,
            organization_id = %organization_id,
            amount = entry.amount,
            balance_after = entry.balance_after,
            "Reservation settled"
        );

        Ok(entry)
    }

    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    async fn release_reservation(&self, reservation_id: Uuid) -> Result<Reservation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_reservation"])
            .start_timer();

        let released = sqlx::query_as::<_, Reservation>(&format!(
            "UPDATE reservations SET status = 'released', updated_utc = $2 \
             WHERE reservation_id = $1 AND status = 'held' \
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(reservation_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to release reservation: {}", e))
        })?;

        timer.observe_duration();

        match released {
            Some(reservation) => Ok(reservation),
            None => match self.get_reservation(reservation_id).await? {
                Some(_) => Err(AppError::ReservationAlreadySettled(reservation_id)),
                None => Err(AppError::ReservationNotFound(reservation_id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sweep_expired"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE reservations SET status = 'expired', updated_utc = $1 \
             WHERE status = 'held' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to sweep reservations: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, idempotency_key))]
    async fn find_ledger_entry(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_ledger_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find ledger entry: {}", e))
        })?;

        timer.observe_duration();

        Ok(entry)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    async fn list_ledger_entries(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_ledger_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries \
             WHERE organization_id = $1 \
             ORDER BY posted_utc DESC \
             LIMIT $2"
        ))
        .bind(organization_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list ledger: {}", e)))?;

        timer.observe_duration();

        Ok(entries)
    }

    #[instrument(skip(self, limits), fields(organization_id = %organization_id))]
    async fn apply_prorated_limits(
        &self,
        organization_id: Uuid,
        limits: &ProratedLimits,
    ) -> Result<Allowance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_prorated_limits"])
            .start_timer();

        // Consumed portions carry over so credits_used keeps balancing
        // against granted minus remaining. RHS columns read the old row.
        let allowance = sqlx::query_as::<_, Allowance>(&format!(
            "UPDATE allowances SET \
                 base_granted = (base_granted - base_remaining) + $2, \
                 base_remaining = $2, \
                 rollover_granted = (rollover_granted - rollover_remaining) + $3, \
                 rollover_remaining = $3, \
                 updated_utc = $4 \
             WHERE organization_id = $1 \
             RETURNING {ALLOWANCE_COLUMNS}"
        ))
        .bind(organization_id)
        .bind(limits.prorated_new)
        .bind(limits.rollover)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to apply prorated limits: {}", e))
        })?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No allowance for organization")))?;

        timer.observe_duration();

        info!(
            organization_id = %organization_id,
            rollover = limits.rollover,
            prorated_new = limits.prorated_new,
            "Prorated limits applied"
        );

        Ok(allowance)
    }
}
