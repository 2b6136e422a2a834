//! Ledger operations over a [`Store`].
//!
//! All balance changes go through [`Ledger::append`], which delegates the
//! atomic unit (idempotency check, balance update, entry insert) to the
//! store and turns its findings into diagnostics.

use std::sync::Arc;

use serde::Serialize;

use sprout_billing_core::{
    AppendRequest, Balance, CreditError, Diagnostic, LedgerEntry, Replay, TransactionType, UserId,
};
use sprout_billing_store::{AppendOutcome, EntryQuery, Store, StoreError, MAX_PAGE_SIZE};

/// One page of ledger history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    /// Entries, newest first.
    pub entries: Vec<LedgerEntry>,
    /// Whether more entries exist past this page.
    pub has_more: bool,
}

/// Result of an append as seen by callers.
#[derive(Debug, Clone)]
pub struct Appended {
    /// The entry (new, or the existing one for a duplicate).
    pub entry: LedgerEntry,
    /// Balance after the append.
    pub balance: Balance,
    /// `false` when the append was an idempotent no-op.
    pub applied: bool,
    /// Negative-balance carry recorded by this append.
    pub diagnostic: Option<Diagnostic>,
}

/// Append-only credit ledger.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    welcome_bonus: i64,
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, welcome_bonus: i64) -> Self {
        Self { store, welcome_bonus }
    }

    /// Open an account with the configured welcome bonus.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::AccountAlreadyExists`] for a second opening.
    pub async fn open_account(&self, user_id: &UserId) -> Result<Balance, CreditError> {
        let balance = self
            .store
            .open_account(user_id, self.welcome_bonus)
            .await
            .map_err(from_store)?;
        tracing::info!(user_id = %user_id, bonus = self.welcome_bonus, "Account opened");
        Ok(balance)
    }

    /// Current balance of an existing account.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::AccountNotFound`] when no account is open.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Balance, CreditError> {
        self.store
            .get_balance(user_id)
            .await
            .map_err(from_store)?
            .ok_or_else(|| CreditError::AccountNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Append one entry and apply it to the balance atomically.
    ///
    /// Requests that name a payment are idempotent per
    /// `(payment, transaction type)`.
    ///
    /// # Errors
    ///
    /// Returns the balance rule the request breaks, such as
    /// [`CreditError::InsufficientFunds`], and leaves the account unchanged.
    pub async fn append(&self, request: AppendRequest) -> Result<Appended, CreditError> {
        let user_id = request.user_id;
        let transaction_type = request.transaction_type;
        let payment_id = request.related_payment_id;

        let AppendOutcome {
            entry,
            balance,
            applied,
            shortfall,
        } = self.store.append(request).await.map_err(from_store)?;

        if !applied {
            tracing::info!(
                user_id = %user_id,
                payment_id = ?payment_id.map(|p| p.to_string()),
                transaction_type = %transaction_type.as_str(),
                "Duplicate append ignored"
            );
            return Ok(Appended {
                entry,
                balance,
                applied,
                diagnostic: None,
            });
        }

        let diagnostic = (shortfall > 0).then(|| {
            tracing::warn!(
                user_id = %user_id,
                payment_id = ?payment_id.map(|p| p.to_string()),
                shortfall,
                debt_after = balance.debt,
                "Clawback exceeded available credits; shortfall recorded as debt"
            );
            Diagnostic::NegativeBalanceWarning {
                shortfall,
                debt_after: balance.debt,
            }
        });

        tracing::debug!(
            user_id = %user_id,
            sequence = entry.sequence,
            transaction_type = %transaction_type.as_str(),
            credits_changed = entry.credits_changed,
            balance_after = entry.balance_after,
            "Ledger entry appended"
        );

        Ok(Appended {
            entry,
            balance,
            applied,
            diagnostic,
        })
    }

    /// A page of history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::AccountNotFound`] when no account is open.
    pub async fn history(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
        transaction_type: Option<TransactionType>,
    ) -> Result<HistoryPage, CreditError> {
        self.get_balance(user_id).await?;

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut entries = self
            .store
            .list_entries(
                user_id,
                EntryQuery {
                    limit: limit + 1,
                    offset,
                    transaction_type,
                },
            )
            .await
            .map_err(from_store)?;

        let has_more = entries.len() > limit;
        entries.truncate(limit);
        Ok(HistoryPage { entries, has_more })
    }

    /// Replay the whole ledger and check it against the live balance.
    ///
    /// A mismatch is logged at error level and returned, never repaired.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::LedgerInconsistency`] when the replay disagrees
    /// with the stored balance.
    pub async fn replay_balance(&self, user_id: &UserId) -> Result<Replay, CreditError> {
        let balance = self.get_balance(user_id).await?;
        let entries = self.store.replay_entries(user_id).await.map_err(from_store)?;

        let replay = Replay::from_entries(*user_id, &entries).and_then(|replay| {
            replay.verify(&balance)?;
            Ok(replay)
        });

        if let Err(CreditError::LedgerInconsistency { detail, .. }) = &replay {
            tracing::error!(
                user_id = %user_id,
                detail = %detail,
                available = balance.available,
                frozen = balance.frozen,
                debt = balance.debt,
                version = balance.version,
                "Ledger replay does not match balance"
            );
        }
        replay
    }
}

/// Map a store error onto the domain taxonomy.
pub(crate) fn from_store(err: StoreError) -> CreditError {
    match err {
        StoreError::Credit(e) => e,
        StoreError::NotFound { entity: "account", id } => {
            CreditError::AccountNotFound { user_id: id }
        }
        StoreError::AlreadyExists { entity: "account", id } => {
            CreditError::AccountAlreadyExists { user_id: id }
        }
        other => CreditError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_billing_core::PaymentId;
    use sprout_billing_store::MemoryStore;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), 5)
    }

    #[tokio::test]
    async fn usage_beyond_available_leaves_balance_unchanged() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.open_account(&user_id).await.unwrap();
        ledger
            .append(AppendRequest::bonus(user_id, 15, "promo".into()))
            .await
            .unwrap();

        let err = ledger
            .append(AppendRequest::usage(user_id, 25, "analysis".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreditError::InsufficientFunds {
                available: 20,
                requested: 25,
                ..
            }
        ));
        assert_eq!(ledger.get_balance(&user_id).await.unwrap().available, 20);
        ledger.replay_balance(&user_id).await.unwrap();
    }

    #[tokio::test]
    async fn clawback_shortfall_is_reported() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.open_account(&user_id).await.unwrap();
        let payment_id = PaymentId::generate();
        ledger
            .append(AppendRequest::purchase(user_id, 10, payment_id, "pack".into()))
            .await
            .unwrap();
        ledger
            .append(AppendRequest::usage(user_id, 12, "analysis".into()))
            .await
            .unwrap();

        let appended = ledger
            .append(AppendRequest::clawback(user_id, 10, payment_id, "chargeback".into()))
            .await
            .unwrap();
        assert_eq!(appended.balance.available, 0);
        assert_eq!(
            appended.diagnostic,
            Some(Diagnostic::NegativeBalanceWarning {
                shortfall: 7,
                debt_after: 7
            })
        );
        let replay = ledger.replay_balance(&user_id).await.unwrap();
        assert_eq!(replay.net, -7);
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.open_account(&user_id).await.unwrap();
        for _ in 0..3 {
            ledger
                .append(AppendRequest::usage(user_id, 1, "analysis".into()))
                .await
                .unwrap();
        }

        let page = ledger.history(&user_id, 2, 0, None).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.entries[0].sequence, 4);

        let page = ledger.history(&user_id, 2, 2, None).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(!page.has_more);

        let bonuses = ledger
            .history(&user_id, 10, 0, Some(TransactionType::Bonus))
            .await
            .unwrap();
        assert_eq!(bonuses.entries.len(), 1);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let err = ledger().get_balance(&UserId::generate()).await.unwrap_err();
        assert!(matches!(err, CreditError::AccountNotFound { .. }));
    }

    #[tokio::test]
    async fn opening_twice_conflicts() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.open_account(&user_id).await.unwrap();
        assert!(matches!(
            ledger.open_account(&user_id).await,
            Err(CreditError::AccountAlreadyExists { .. })
        ));
    }
}
