//! Payment lifecycle and exactly-once crediting.
//!
//! Webhooks and polls both feed [`PaymentReconciler::reconcile`]. The
//! payment row moves by compare-and-swap on its status, and ledger effects
//! are idempotent per `(payment, transaction type)`, so any number of
//! reports, in any interleaving, credit a payment at most once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;

use sprout_billing_core::{
    AppendRequest, CreditError, Diagnostic, Payment, PaymentId, PaymentStatus, Transition, UserId,
};
use sprout_billing_store::{Store, MAX_PAGE_SIZE};

use crate::config::ServiceConfig;
use crate::ledger::{from_store, Ledger};
use crate::provider::{ChargeRequest, ChargeStatus, PaymentProvider};

/// Attempts at moving a payment before giving up on a contended row.
const TRANSITION_ATTEMPTS: usize = 3;

/// Longest pause between polls after repeated provider failures.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Payment window and polling bound.
    pub payment_timeout: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Retries of transient provider failures when creating a charge.
    pub max_retries: u32,
    /// First retry delay when creating a charge.
    pub retry_initial_interval: Duration,
    /// Charge currency.
    pub currency: String,
    /// Where the provider returns the customer after checkout.
    pub return_url: String,
}

impl ReconcilerSettings {
    /// Settings derived from the service configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            payment_timeout: config.payment_timeout(),
            poll_interval: config.poll_interval(),
            max_retries: config.provider_max_retries,
            retry_initial_interval: Duration::from_millis(250),
            currency: config.payment_currency.clone(),
            return_url: format!(
                "{}/credits?checkout=complete",
                config.frontend_url.trim_end_matches('/')
            ),
        }
    }
}

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The report changed the payment or wrote a ledger entry.
    Applied,
    /// The payment already reflected the report.
    AlreadyApplied,
    /// The report conflicts with a terminal status and was not applied.
    Rejected,
    /// The report is not terminal; nothing changed.
    Pending,
}

/// Result of [`PaymentReconciler::reconcile`].
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    /// The payment after the call.
    pub payment: Payment,
    /// What happened.
    pub outcome: Outcome,
    /// Whether this call wrote a ledger entry.
    pub credited: bool,
    /// Conflicts and carries recorded along the way.
    pub diagnostics: Vec<Diagnostic>,
}

impl ReconcileOutcome {
    fn unchanged(payment: Payment, outcome: Outcome) -> Self {
        Self {
            payment,
            outcome,
            credited: false,
            diagnostics: Vec::new(),
        }
    }
}

/// Drives payments through their lifecycle.
pub struct PaymentReconciler {
    store: Arc<dyn Store>,
    ledger: Ledger,
    provider: Option<Arc<dyn PaymentProvider>>,
    settings: ReconcilerSettings,
}

impl PaymentReconciler {
    /// Create a reconciler. Without a provider, payments cannot be created
    /// or polled but webhooks and expiry still work.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Ledger,
        provider: Option<Arc<dyn PaymentProvider>>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            provider,
            settings,
        }
    }

    /// Tuning in effect.
    #[must_use]
    pub const fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Whether a payment provider is configured.
    #[must_use]
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&self) -> Result<&Arc<dyn PaymentProvider>, CreditError> {
        self.provider.as_ref().ok_or_else(|| CreditError::ProviderError {
            code: "not_configured".into(),
            message: "payment provider is not configured".into(),
        })
    }

    /// Open a checkout with the provider and record a pending payment.
    ///
    /// Transient provider failures are retried with exponential backoff up
    /// to the configured number of retries. Nothing is stored unless the
    /// provider call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidAmount`] or
    /// [`CreditError::InvalidCredits`] for non-positive values, and the
    /// provider's error once retries are spent or it rejects the charge.
    pub async fn create_payment(
        &self,
        user_id: &UserId,
        amount: i64,
        credits: i64,
        customer_email: Option<String>,
    ) -> Result<Payment, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount(amount));
        }
        if credits <= 0 {
            return Err(CreditError::InvalidCredits(format!(
                "credits must be positive, got {credits}"
            )));
        }
        self.ledger.get_balance(user_id).await?;
        let provider = self.provider()?;

        let request = ChargeRequest {
            payment_id: PaymentId::generate(),
            user_id: *user_id,
            amount,
            currency: self.settings.currency.clone(),
            credits,
            customer_email,
            return_url: self.settings.return_url.clone(),
        };

        let attempts = AtomicU32::new(0);
        let max_retries = self.settings.max_retries;
        let policy = ExponentialBackoff {
            initial_interval: self.settings.retry_initial_interval,
            max_elapsed_time: Some(self.settings.payment_timeout),
            ..Default::default()
        };

        let handle = retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            provider.create_charge(&request).await.map_err(|e| {
                if e.is_retryable() && attempt <= max_retries {
                    tracing::warn!(
                        payment_id = %request.payment_id,
                        attempt,
                        error = %e,
                        "Provider unavailable, retrying charge creation"
                    );
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        let timeout = chrono::Duration::from_std(self.settings.payment_timeout)
            .map_err(|e| CreditError::Storage(format!("payment timeout out of range: {e}")))?;
        let mut payment = Payment::pending(
            request.payment_id,
            *user_id,
            handle.provider_payment_id,
            amount,
            request.currency,
            credits,
            timeout,
        );
        payment.checkout_url = handle.checkout_url;

        self.store.insert_payment(&payment).await.map_err(from_store)?;

        tracing::info!(
            user_id = %user_id,
            payment_id = %payment.id,
            provider_payment_id = %payment.provider_payment_id,
            amount,
            credits,
            "Payment created"
        );
        Ok(payment)
    }

    /// Apply a provider status report.
    ///
    /// This is the single entry point for webhooks and polls.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::UnknownPayment`] for an unrecorded payment and
    /// [`CreditError::AmountMismatch`] for a short success report. Neither
    /// changes the payment.
    pub async fn reconcile(
        &self,
        provider_payment_id: &str,
        report: ChargeStatus,
    ) -> Result<ReconcileOutcome, CreditError> {
        let mut payment = self.find_by_provider_id(provider_payment_id).await?;

        let Some(target) = report.status.target() else {
            tracing::debug!(
                provider_payment_id = %provider_payment_id,
                status = %report.status.as_str(),
                "Non-terminal provider status"
            );
            return Ok(ReconcileOutcome::unchanged(payment, Outcome::Pending));
        };

        if target == PaymentStatus::Completed {
            if let Some(reported) = report.amount.filter(|a| *a < payment.amount) {
                tracing::error!(
                    payment_id = %payment.id,
                    provider_payment_id = %provider_payment_id,
                    expected = payment.amount,
                    reported,
                    "Provider reported a smaller amount than charged"
                );
                return Err(CreditError::AmountMismatch {
                    expected: payment.amount,
                    reported,
                });
            }
        }

        let mut diagnostics = Vec::new();
        for _ in 0..TRANSITION_ATTEMPTS {
            let local = payment.status;
            match local.transition_to(target) {
                Transition::Same => {
                    let credited = self.settle(&payment, &mut diagnostics).await?;
                    let outcome = if credited {
                        Outcome::Applied
                    } else {
                        Outcome::AlreadyApplied
                    };
                    return Ok(ReconcileOutcome {
                        payment,
                        outcome,
                        credited,
                        diagnostics,
                    });
                }
                Transition::Rejected => {
                    tracing::warn!(
                        payment_id = %payment.id,
                        provider_payment_id = %provider_payment_id,
                        local = %local,
                        reported = %report.status.as_str(),
                        "Provider report conflicts with terminal status; ignored"
                    );
                    diagnostics.push(Diagnostic::StateConflict {
                        local,
                        reported: report.status,
                        applied: false,
                    });
                    return Ok(ReconcileOutcome {
                        payment,
                        outcome: Outcome::Rejected,
                        credited: false,
                        diagnostics,
                    });
                }
                transition @ (Transition::Allowed | Transition::Override) => {
                    let moved = self
                        .store
                        .transition_payment(&payment.id, local, target, report.metadata.clone())
                        .await
                        .map_err(from_store)?;

                    let Some(updated) = moved else {
                        payment = self.find_by_provider_id(provider_payment_id).await?;
                        continue;
                    };

                    if transition == Transition::Override {
                        tracing::warn!(
                            payment_id = %updated.id,
                            provider_payment_id = %provider_payment_id,
                            local = %local,
                            reported = %report.status.as_str(),
                            "Provider report overrides terminal status"
                        );
                        diagnostics.push(Diagnostic::StateConflict {
                            local,
                            reported: report.status,
                            applied: true,
                        });
                    }

                    tracing::info!(
                        payment_id = %updated.id,
                        provider_payment_id = %provider_payment_id,
                        from = %local,
                        to = %target,
                        "Payment status changed"
                    );

                    let credited = self.settle(&updated, &mut diagnostics).await?;
                    return Ok(ReconcileOutcome {
                        payment: updated,
                        outcome: Outcome::Applied,
                        credited,
                        diagnostics,
                    });
                }
            }
        }

        Err(CreditError::Storage(format!(
            "payment {} changed concurrently {TRANSITION_ATTEMPTS} times",
            payment.id
        )))
    }

    /// Write the ledger effect of a payment's current status.
    ///
    /// Returns whether an entry was written by this call.
    async fn settle(
        &self,
        payment: &Payment,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<bool, CreditError> {
        let metadata = serde_json::json!({ "provider_payment_id": payment.provider_payment_id });
        let request = match payment.status {
            PaymentStatus::Completed => AppendRequest::purchase(
                payment.user_id,
                payment.credits_purchased,
                payment.id,
                format!("Purchased {} credits", payment.credits_purchased),
            ),
            PaymentStatus::Disputed => AppendRequest::clawback(
                payment.user_id,
                payment.credits_purchased,
                payment.id,
                "Payment disputed".into(),
            ),
            _ => return Ok(false),
        };

        let appended = self.ledger.append(request.with_metadata(metadata)).await?;
        diagnostics.extend(appended.diagnostic);
        Ok(appended.applied)
    }

    /// Poll the provider until the payment is terminal or the window closes.
    ///
    /// Never polls past `payment_timeout`; when the window closes without a
    /// terminal report the payment is expired. Transient provider failures
    /// are retried with growing delays inside the same window.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient provider error, or any error from
    /// [`PaymentReconciler::reconcile`].
    pub async fn poll_status(
        &self,
        provider_payment_id: &str,
    ) -> Result<ReconcileOutcome, CreditError> {
        let provider = self.provider()?;
        let deadline = tokio::time::Instant::now() + self.settings.payment_timeout;
        let mut failures: u32 = 0;

        loop {
            let payment = self.find_by_provider_id(provider_payment_id).await?;
            if payment.status.is_terminal() {
                return Ok(ReconcileOutcome::unchanged(payment, Outcome::AlreadyApplied));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return self.expire(payment).await;
            }

            let check = provider.get_charge_status(provider_payment_id);
            match tokio::time::timeout(deadline - now, check).await {
                Err(_) => continue,
                Ok(Ok(report)) => {
                    failures = 0;
                    let outcome = self.reconcile(provider_payment_id, report).await?;
                    if outcome.payment.status.is_terminal() {
                        return Ok(outcome);
                    }
                }
                Ok(Err(e)) if e.is_retryable() => {
                    failures += 1;
                    tracing::warn!(
                        provider_payment_id = %provider_payment_id,
                        failures,
                        error = %e,
                        "Status poll failed, backing off"
                    );
                }
                Ok(Err(e)) => return Err(e),
            }

            let delay = self
                .settings
                .poll_interval
                .saturating_mul(1 << failures.min(6))
                .min(MAX_POLL_BACKOFF.max(self.settings.poll_interval));
            let now = tokio::time::Instant::now();
            if now < deadline {
                tokio::time::sleep(delay.min(deadline - now)).await;
            }
        }
    }

    /// One status check for a user's payment.
    ///
    /// A completed or disputed payment is settled again from local state,
    /// which writes its ledger entry if an earlier attempt left it out.
    /// Anything else is checked with the provider once and reconciled. A
    /// pending payment past its window is expired, including when the
    /// provider cannot be reached. Expired, failed and cancelled payments are
    /// still checked, since a late success report overrides them.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::UnknownPayment`] when the payment does not
    /// belong to `user_id`, [`CreditError::AmountMismatch`] for a short
    /// success report, and provider or storage errors otherwise.
    pub async fn verify_payment(
        &self,
        user_id: &UserId,
        provider_payment_id: &str,
    ) -> Result<ReconcileOutcome, CreditError> {
        let payment = self.find_by_provider_id(provider_payment_id).await?;
        if payment.user_id != *user_id {
            return Err(CreditError::UnknownPayment {
                provider_payment_id: provider_payment_id.to_string(),
            });
        }
        if matches!(payment.status, PaymentStatus::Completed | PaymentStatus::Disputed) {
            let mut diagnostics = Vec::new();
            let credited = self.settle(&payment, &mut diagnostics).await?;
            if credited {
                tracing::warn!(
                    payment_id = %payment.id,
                    provider_payment_id = %provider_payment_id,
                    status = %payment.status,
                    "Settled payment was missing its ledger entry"
                );
            }
            let outcome = if credited {
                Outcome::Applied
            } else {
                Outcome::AlreadyApplied
            };
            return Ok(ReconcileOutcome {
                payment,
                outcome,
                credited,
                diagnostics,
            });
        }

        let report = match self.provider() {
            Ok(provider) => provider.get_charge_status(provider_payment_id).await,
            Err(e) => Err(e),
        };

        match report {
            Ok(report) => {
                let outcome = self.reconcile(provider_payment_id, report).await?;
                if outcome.payment.is_overdue(Utc::now()) {
                    let mut expired = self.expire(outcome.payment).await?;
                    expired.diagnostics = outcome.diagnostics;
                    return Ok(expired);
                }
                Ok(outcome)
            }
            Err(e) if payment.is_overdue(Utc::now()) => {
                tracing::warn!(
                    provider_payment_id = %provider_payment_id,
                    error = %e,
                    "Provider check failed for overdue payment; expiring"
                );
                self.expire(payment).await
            }
            Err(e) if payment.status.is_terminal() => {
                tracing::debug!(
                    provider_payment_id = %provider_payment_id,
                    status = %payment.status,
                    error = %e,
                    "Provider check failed for closed payment"
                );
                Ok(ReconcileOutcome::unchanged(payment, Outcome::AlreadyApplied))
            }
            Err(e) => Err(e),
        }
    }

    /// Expire a payment that is still pending.
    ///
    /// Any other status is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the payment cannot be moved or re-read.
    pub async fn expire(&self, payment: Payment) -> Result<ReconcileOutcome, CreditError> {
        if payment.status != PaymentStatus::Pending {
            return Ok(ReconcileOutcome::unchanged(payment, Outcome::AlreadyApplied));
        }

        let moved = self
            .store
            .transition_payment(
                &payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Expired,
                serde_json::json!({ "reason": "timeout" }),
            )
            .await
            .map_err(from_store)?;

        match moved {
            Some(expired) => {
                tracing::info!(
                    payment_id = %expired.id,
                    provider_payment_id = %expired.provider_payment_id,
                    "Payment expired without a provider outcome"
                );
                Ok(ReconcileOutcome::unchanged(expired, Outcome::Applied))
            }
            None => {
                let current = self.find_by_provider_id(&payment.provider_payment_id).await?;
                Ok(ReconcileOutcome::unchanged(current, Outcome::AlreadyApplied))
            }
        }
    }

    /// Expire every pending payment past its window. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Stops at the first storage error.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, CreditError> {
        let overdue = self
            .store
            .list_overdue_payments(now, MAX_PAGE_SIZE)
            .await
            .map_err(from_store)?;

        let mut expired = 0;
        for payment in overdue {
            if self.expire(payment).await?.outcome == Outcome::Applied {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// A user's payment by local ID.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::UnknownPayment`] when the payment is missing or
    /// belongs to another user.
    pub async fn find_payment(
        &self,
        user_id: &UserId,
        payment_id: &PaymentId,
    ) -> Result<Payment, CreditError> {
        self.store
            .get_payment(payment_id)
            .await
            .map_err(from_store)?
            .filter(|p| p.user_id == *user_id)
            .ok_or_else(|| CreditError::UnknownPayment {
                provider_payment_id: payment_id.to_string(),
            })
    }

    /// A user's payments, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the listing fails.
    pub async fn list_payments(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>, CreditError> {
        self.store
            .list_payments(user_id, limit.max(1), offset)
            .await
            .map_err(from_store)
    }

    async fn find_by_provider_id(&self, provider_payment_id: &str) -> Result<Payment, CreditError> {
        self.store
            .get_payment_by_provider_id(provider_payment_id)
            .await
            .map_err(from_store)?
            .ok_or_else(|| CreditError::UnknownPayment {
                provider_payment_id: provider_payment_id.to_string(),
            })
    }
}
