//! Background sweeper that expires abandoned reservations.
//!
//! A held reservation whose caller crashed would otherwise pin its estimate
//! against available credit forever. The sweep is idempotent and cheap, so
//! multiple instances may run it concurrently.

use crate::quota::reservation::ReservationManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct Sweeper {
    reservations: Arc<ReservationManager>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(reservations: Arc<ReservationManager>, interval_seconds: u64) -> Self {
        Self {
            reservations,
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Run until the shutdown channel fires. One sweep failure is logged and
    /// retried next tick; it never stops the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_seconds = self.interval.as_secs(), "Sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reservations.sweep(Utc::now()).await {
                        error!(error = %e, "Reservation sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweeper shutting down");
                        return;
                    }
                }
            }
        }
    }
}
