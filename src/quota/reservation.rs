//! Reservation manager: the hold/settle/release lifecycle over the store.

use crate::config::QuotaConfig;
use crate::error::AppError;
use crate::models::{
    CreditSource, LedgerEntry, NewReservation, OperationKind, Reservation,
};
use crate::services::metrics::{
    record_credits_debited, record_error, record_expired, record_reservation, record_settlement,
};
use crate::store::{QuotaStore, SettleRequest};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct ReservationManager {
    store: Arc<dyn QuotaStore>,
    config: QuotaConfig,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn QuotaStore>, config: QuotaConfig) -> Self {
        Self { store, config }
    }

    /// Place a hold for an estimated cost. The hold expires after the
    /// configured TTL unless settled or released first.
    #[instrument(skip(self), fields(organization_id = %organization_id, estimate = estimated_amount))]
    pub async fn reserve(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        estimated_amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        if estimated_amount < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Reservation estimate must be non-negative"
            )));
        }

        let input = NewReservation {
            organization_id,
            user_id,
            estimated_amount,
            expires_at: now + Duration::seconds(self.config.reservation_ttl_seconds as i64),
        };

        match self
            .store
            .try_reserve(&input, &self.config.precedence, now)
            .await
        {
            Ok(reservation) => {
                record_reservation(&organization_id.to_string(), "granted");
                info!(
                    reservation_id = %reservation.reservation_id,
                    expires_at = %reservation.expires_at,
                    "Reservation placed"
                );
                Ok(reservation)
            }
            Err(e @ AppError::InsufficientCredit { .. }) => {
                record_reservation(&organization_id.to_string(), "denied");
                Err(e)
            }
            Err(e) => {
                record_error(e.metric_label(), "try_reserve");
                Err(e)
            }
        }
    }

    /// Commit a reservation at its actual cost. Safe to retry: replays with
    /// the same idempotency key return the original ledger entry.
    #[instrument(skip(self, idempotency_key, resource_ref), fields(reservation_id = %reservation_id, actual = actual_amount))]
    pub async fn settle(
        &self,
        reservation_id: Uuid,
        actual_amount: i64,
        idempotency_key: String,
        operation: OperationKind,
        resource_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, AppError> {
        let req = SettleRequest {
            reservation_id,
            actual_amount,
            idempotency_key,
            operation,
            resource_ref,
        };

        let entry = self
            .store
            .settle_reservation(&req, &self.config.precedence, now)
            .await
            .map_err(|e| {
                record_error(e.metric_label(), "settle_reservation");
                e
            })?;

        let org = entry.organization_id.to_string();
        record_settlement(&org, &entry.operation);
        for source in CreditSource::default_precedence() {
            record_credits_debited(&org, source.as_str(), entry.sources.0.get(source));
        }

        Ok(entry)
    }

    /// Drop a hold without debiting, e.g. when the metered operation failed
    /// before producing anything billable.
    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn release(&self, reservation_id: Uuid) -> Result<Reservation, AppError> {
        let reservation = self.store.release_reservation(reservation_id).await?;
        record_reservation(&reservation.organization_id.to_string(), "released");
        Ok(reservation)
    }

    pub async fn get(&self, reservation_id: Uuid) -> Result<Option<Reservation>, AppError> {
        self.store.get_reservation(reservation_id).await
    }

    /// Expire abandoned holds. Called periodically by the sweeper.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let swept = self.store.sweep_expired(now).await?;
        if swept > 0 {
            record_expired(swept);
            info!(swept = swept, "Expired abandoned reservations");
        }
        Ok(swept)
    }
}
