//! In-memory storage implementation.
//!
//! Each account sits behind its own mutex, so appends for different users
//! never wait on each other. Used by the service tests and as the fallback
//! when no durable backend is configured.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use sprout_billing_core::{
    AppendRequest, Balance, LedgerEntry, Payment, PaymentId, PaymentStatus, TransactionType,
    UserId,
};

use crate::error::{Result, StoreError};
use crate::{opening_request, plan_append, AppendOutcome, EntryQuery, Store};

/// One user's balance and ledger.
struct Account {
    balance: Balance,
    entries: Vec<LedgerEntry>,
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    payment_entries: DashMap<(PaymentId, TransactionType), LedgerEntry>,
    payments: DashMap<PaymentId, Payment>,
    payments_by_provider: DashMap<String, PaymentId>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, user_id: &UserId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.get(user_id).map(|account| Arc::clone(&*account))
    }

    fn lock(account: &Mutex<Account>) -> Result<MutexGuard<'_, Account>> {
        account
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_account(&self, user_id: &UserId, welcome_bonus: i64) -> Result<Balance> {
        let Entry::Vacant(slot) = self.accounts.entry(*user_id) else {
            return Err(StoreError::AlreadyExists {
                entity: "account",
                id: user_id.to_string(),
            });
        };

        // Plan the bonus before inserting so a bad amount leaves no account.
        let mut balance = Balance::new(*user_id);
        let mut entries = Vec::new();
        if let Some(request) = opening_request(*user_id, welcome_bonus) {
            let (next, entry, _) = plan_append(&balance, request)?;
            balance = next;
            entries.push(entry);
        }

        slot.insert(Arc::new(Mutex::new(Account {
            balance: balance.clone(),
            entries,
        })));
        Ok(balance)
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        match self.account(user_id) {
            Some(account) => Ok(Some(Self::lock(&account)?.balance.clone())),
            None => Ok(None),
        }
    }

    /// The idempotency index is covered by the account lock: a payment's
    /// entries always belong to the payment's owner.
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome> {
        let user_id = request.user_id;
        let account = self
            .account(&user_id)
            .ok_or_else(|| StoreError::account_not_found(user_id))?;
        let mut account = Self::lock(&account)?;

        let index_key = request
            .related_payment_id
            .map(|payment_id| (payment_id, request.transaction_type));
        if let Some(key) = &index_key {
            if let Some(existing) = self.payment_entries.get(key) {
                return Ok(AppendOutcome {
                    entry: existing.clone(),
                    balance: account.balance.clone(),
                    applied: false,
                    shortfall: 0,
                });
            }
        }

        let (balance, entry, shortfall) = plan_append(&account.balance, request)?;

        if let Some(key) = index_key {
            self.payment_entries.insert(key, entry.clone());
        }
        account.entries.push(entry.clone());
        account.balance = balance.clone();

        Ok(AppendOutcome {
            entry,
            balance,
            applied: true,
            shortfall,
        })
    }

    async fn find_payment_entry(
        &self,
        payment_id: &PaymentId,
        transaction_type: TransactionType,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .payment_entries
            .get(&(*payment_id, transaction_type))
            .map(|entry| entry.clone()))
    }

    async fn list_entries(&self, user_id: &UserId, query: EntryQuery) -> Result<Vec<LedgerEntry>> {
        let Some(account) = self.account(user_id) else {
            return Ok(Vec::new());
        };
        let account = Self::lock(&account)?;
        Ok(account
            .entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn replay_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        match self.account(user_id) {
            Some(account) => Ok(Self::lock(&account)?.entries.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let already_exists = || StoreError::AlreadyExists {
            entity: "payment",
            id: payment.provider_payment_id.clone(),
        };

        // Provider index first, then payments; nothing takes them the other way.
        let Entry::Vacant(by_provider) = self
            .payments_by_provider
            .entry(payment.provider_payment_id.clone())
        else {
            return Err(already_exists());
        };
        let Entry::Vacant(slot) = self.payments.entry(payment.id) else {
            return Err(already_exists());
        };

        slot.insert(payment.clone());
        by_provider.insert(payment.id);
        Ok(())
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>> {
        Ok(self.payments.get(payment_id).map(|p| p.clone()))
    }

    async fn get_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>> {
        let payment_id = self.payments_by_provider.get(provider_payment_id).map(|id| *id);
        match payment_id {
            Some(payment_id) => self.get_payment(&payment_id).await,
            None => Ok(None),
        }
    }

    async fn transition_payment(
        &self,
        payment_id: &PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_metadata: serde_json::Value,
    ) -> Result<Option<Payment>> {
        let mut payment = self
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| StoreError::payment_not_found(payment_id))?;

        if payment.status != from {
            return Ok(None);
        }
        payment.status = to;
        payment.updated_at = Utc::now();
        if !provider_metadata.is_null() {
            payment.provider_metadata = provider_metadata;
        }
        Ok(Some(payment.clone()))
    }

    async fn list_payments(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.user_id == *user_id)
            .map(|p| p.clone())
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_overdue_payments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let mut overdue: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.is_overdue(now))
            .map(|p| p.clone())
            .collect();
        overdue.sort_by_key(|p| p.expires_at);
        overdue.truncate(limit);
        Ok(overdue)
    }
}
