//! Background sweep that expires abandoned checkouts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::reconciler::PaymentReconciler;

/// Periodically expires pending payments past their window.
pub struct ExpirySweeper {
    reconciler: Arc<PaymentReconciler>,
    every: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper running every `every`.
    #[must_use]
    pub fn new(reconciler: Arc<PaymentReconciler>, every: Duration) -> Self {
        Self { reconciler, every }
    }

    /// Run one sweep. Returns how many payments were expired.
    pub async fn sweep(&self) -> usize {
        match self.reconciler.expire_overdue(Utc::now()).await {
            Ok(0) => 0,
            Ok(expired) => {
                tracing::info!(expired, "Expired overdue payments");
                expired
            }
            Err(e) => {
                tracing::error!(error = %e, "Expiry sweep failed");
                0
            }
        }
    }

    /// Sweep forever on a fixed interval.
    pub async fn run(self) {
        let mut ticker = interval(self.every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Spawn [`ExpirySweeper::run`] on the runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(every_secs = self.every.as_secs(), "Starting payment expiry sweep");
        tokio::spawn(self.run())
    }
}
