//! `RocksDB` storage implementation.
//!
//! Multi-key changes go through a single `WriteBatch`. Read-modify-write
//! sequences hold a lock for the user or payment they touch, so work for
//! different users runs in parallel. A database directory must be opened by
//! one process at a time, which `RocksDB` enforces.
//!
//! `RocksDB` calls block, so every operation runs on Tokio's blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use sprout_billing_core::{
    AppendRequest, Balance, LedgerEntry, Payment, PaymentId, PaymentStatus, TransactionType,
    UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::locks::KeyedLocks;
use crate::schema::{all_column_families, cf};
use crate::{opening_request, plan_append, AppendOutcome, EntryQuery, Store};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DBWithThreadMode<MultiThreaded>,
    user_locks: KeyedLocks<UserId>,
    payment_locks: KeyedLocks<PaymentId>,
    provider_locks: KeyedLocks<String>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                user_locks: KeyedLocks::new(),
                payment_locks: KeyedLocks::new(),
                provider_locks: KeyedLocks::new(),
            }),
        })
    }

    /// Run `op` on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Database(format!("rocks store task failed: {e}")))?
    }
}

impl Inner {
    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn guard(lock: &Mutex<()>) -> Result<MutexGuard<'_, ()>> {
        lock.lock()
            .map_err(|_| StoreError::Database("rocks store lock poisoned".into()))
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    fn open_account_sync(&self, user_id: &UserId, welcome_bonus: i64) -> Result<Balance> {
        let lock = self.user_locks.get(user_id);
        let _guard = Self::guard(&lock)?;

        let balance_key = keys::balance_key(user_id);
        if self.get::<Balance>(cf::BALANCES, &balance_key)?.is_some() {
            return Err(StoreError::AlreadyExists {
                entity: "account",
                id: user_id.to_string(),
            });
        }

        let mut balance = Balance::new(*user_id);
        let mut batch = WriteBatch::default();
        if let Some(request) = opening_request(*user_id, welcome_bonus) {
            let (next, entry, _) = plan_append(&balance, request)?;
            balance = next;
            batch.put_cf(
                &self.cf(cf::ENTRIES)?,
                keys::entry_key(user_id, entry.sequence),
                Self::serialize(&entry)?,
            );
        }
        batch.put_cf(&self.cf(cf::BALANCES)?, &balance_key, Self::serialize(&balance)?);

        self.db.write(batch)?;
        Ok(balance)
    }

    /// The idempotency index is covered by the user lock: a payment's
    /// entries always belong to the payment's owner.
    fn append_sync(&self, request: AppendRequest) -> Result<AppendOutcome> {
        let user_id = request.user_id;
        let lock = self.user_locks.get(&user_id);
        let _guard = Self::guard(&lock)?;

        let balance_key = keys::balance_key(&user_id);
        let current: Balance = self
            .get(cf::BALANCES, &balance_key)?
            .ok_or_else(|| StoreError::account_not_found(user_id))?;

        let idempotency_key = request
            .related_payment_id
            .map(|payment_id| keys::payment_entry_key(&payment_id, request.transaction_type));
        if let Some(key) = &idempotency_key {
            if let Some(entry) = self.entry_by_index(key)? {
                return Ok(AppendOutcome {
                    entry,
                    balance: current,
                    applied: false,
                    shortfall: 0,
                });
            }
        }

        let (balance, entry, shortfall) = plan_append(&current, request)?;
        let entry_key = keys::entry_key(&user_id, entry.sequence);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(cf::BALANCES)?, &balance_key, Self::serialize(&balance)?);
        batch.put_cf(&self.cf(cf::ENTRIES)?, &entry_key, Self::serialize(&entry)?);
        if let Some(key) = &idempotency_key {
            batch.put_cf(&self.cf(cf::PAYMENT_ENTRIES)?, key, &entry_key);
        }
        self.db.write(batch)?;

        Ok(AppendOutcome {
            entry,
            balance,
            applied: true,
            shortfall,
        })
    }

    fn entry_by_index(&self, index_key: &[u8]) -> Result<Option<LedgerEntry>> {
        let cf_index = self.cf(cf::PAYMENT_ENTRIES)?;
        match self.db.get_cf(&cf_index, index_key)? {
            Some(entry_key) => self.get(cf::ENTRIES, &entry_key),
            None => Ok(None),
        }
    }

    fn user_entries(&self, user_id: &UserId, direction: Direction) -> Result<Vec<LedgerEntry>> {
        let cf_entries = self.cf(cf::ENTRIES)?;
        let prefix = keys::user_prefix(user_id);
        let start = match direction {
            Direction::Forward => keys::entry_key(user_id, 0),
            Direction::Reverse => keys::entry_key(user_id, u64::MAX),
        };

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf_entries, IteratorMode::From(&start, direction)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(Self::deserialize(&value)?);
        }
        Ok(entries)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    fn insert_payment_sync(&self, payment: &Payment) -> Result<()> {
        let provider_lock = self.provider_locks.get(&payment.provider_payment_id);
        let _provider_guard = Self::guard(&provider_lock)?;
        let payment_lock = self.payment_locks.get(&payment.id);
        let _payment_guard = Self::guard(&payment_lock)?;

        let cf_payments = self.cf(cf::PAYMENTS)?;
        let cf_by_provider = self.cf(cf::PAYMENTS_BY_PROVIDER)?;
        let payment_key = keys::payment_key(&payment.id);
        let provider_key = keys::provider_key(&payment.provider_payment_id);

        if self.db.get_cf(&cf_payments, &payment_key)?.is_some()
            || self.db.get_cf(&cf_by_provider, &provider_key)?.is_some()
        {
            return Err(StoreError::AlreadyExists {
                entity: "payment",
                id: payment.provider_payment_id.clone(),
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_payments, &payment_key, Self::serialize(payment)?);
        batch.put_cf(&cf_by_provider, &provider_key, &payment_key);
        batch.put_cf(
            &self.cf(cf::PAYMENTS_BY_USER)?,
            keys::user_payment_key(&payment.user_id, payment.created_at, &payment.id),
            [],
        );
        if payment.status == PaymentStatus::Pending {
            batch.put_cf(
                &self.cf(cf::PENDING_PAYMENTS)?,
                keys::pending_key(payment.expires_at, &payment.id),
                [],
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn transition_payment_sync(
        &self,
        payment_id: &PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_metadata: serde_json::Value,
    ) -> Result<Option<Payment>> {
        let lock = self.payment_locks.get(payment_id);
        let _guard = Self::guard(&lock)?;

        let payment_key = keys::payment_key(payment_id);
        let mut payment: Payment = self
            .get(cf::PAYMENTS, &payment_key)?
            .ok_or_else(|| StoreError::payment_not_found(payment_id))?;
        if payment.status != from {
            return Ok(None);
        }

        payment.status = to;
        payment.updated_at = Utc::now();
        if !provider_metadata.is_null() {
            payment.provider_metadata = provider_metadata;
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(cf::PAYMENTS)?, &payment_key, Self::serialize(&payment)?);
        if from == PaymentStatus::Pending {
            batch.delete_cf(
                &self.cf(cf::PENDING_PAYMENTS)?,
                keys::pending_key(payment.expires_at, payment_id),
            );
        }
        self.db.write(batch)?;
        Ok(Some(payment))
    }

    fn payment_by_key(&self, payment_key: &[u8]) -> Result<Option<Payment>> {
        self.get(cf::PAYMENTS, payment_key)
    }

    fn payment_by_provider_id(&self, provider_payment_id: &str) -> Result<Option<Payment>> {
        let cf_by_provider = self.cf(cf::PAYMENTS_BY_PROVIDER)?;
        match self.db.get_cf(&cf_by_provider, keys::provider_key(provider_payment_id))? {
            Some(payment_key) => self.payment_by_key(&payment_key),
            None => Ok(None),
        }
    }

    fn list_payments_sync(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let cf_by_user = self.cf(cf::PAYMENTS_BY_USER)?;
        let prefix = keys::user_prefix(user_id);
        let mut start = prefix.clone();
        start.extend_from_slice(&[0xff; 24]);

        let index_keys = self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&start, Direction::Reverse))
            .map(|item| item.map(|(key, _)| key))
            .take_while(|item| item.as_ref().map_or(true, |key| key.starts_with(&prefix)))
            .skip(offset)
            .take(limit);

        let mut payments = Vec::new();
        for key in index_keys {
            let Some(payment_id) = keys::trailing_payment_id(&key?) else {
                continue;
            };
            if let Some(payment) = self.payment_by_key(&keys::payment_key(&payment_id))? {
                payments.push(payment);
            }
        }
        Ok(payments)
    }

    fn list_overdue_sync(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Payment>> {
        let cf_pending = self.cf(cf::PENDING_PAYMENTS)?;
        let upper = keys::pending_upper_bound(now);

        let mut payments = Vec::new();
        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            let (key, _) = item?;
            if key.as_ref() >= upper.as_slice() || payments.len() >= limit {
                break;
            }
            let Some(payment_id) = keys::trailing_payment_id(&key) else {
                continue;
            };
            if let Some(payment) = self.payment_by_key(&keys::payment_key(&payment_id))? {
                if payment.is_overdue(now) {
                    payments.push(payment);
                }
            }
        }
        Ok(payments)
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn open_account(&self, user_id: &UserId, welcome_bonus: i64) -> Result<Balance> {
        let user_id = *user_id;
        self.run(move |inner| inner.open_account_sync(&user_id, welcome_bonus))
            .await
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        let key = keys::balance_key(user_id);
        self.run(move |inner| inner.get(cf::BALANCES, &key)).await
    }

    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome> {
        self.run(move |inner| inner.append_sync(request)).await
    }

    async fn find_payment_entry(
        &self,
        payment_id: &PaymentId,
        transaction_type: TransactionType,
    ) -> Result<Option<LedgerEntry>> {
        let key = keys::payment_entry_key(payment_id, transaction_type);
        self.run(move |inner| inner.entry_by_index(&key)).await
    }

    async fn list_entries(&self, user_id: &UserId, query: EntryQuery) -> Result<Vec<LedgerEntry>> {
        let user_id = *user_id;
        let entries = self
            .run(move |inner| inner.user_entries(&user_id, Direction::Reverse))
            .await?;
        Ok(entries
            .into_iter()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn replay_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let user_id = *user_id;
        self.run(move |inner| inner.user_entries(&user_id, Direction::Forward))
            .await
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let payment = payment.clone();
        self.run(move |inner| inner.insert_payment_sync(&payment)).await
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>> {
        let key = keys::payment_key(payment_id);
        self.run(move |inner| inner.payment_by_key(&key)).await
    }

    async fn get_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>> {
        let provider_payment_id = provider_payment_id.to_string();
        self.run(move |inner| inner.payment_by_provider_id(&provider_payment_id))
            .await
    }

    async fn transition_payment(
        &self,
        payment_id: &PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_metadata: serde_json::Value,
    ) -> Result<Option<Payment>> {
        let payment_id = *payment_id;
        self.run(move |inner| {
            inner.transition_payment_sync(&payment_id, from, to, provider_metadata)
        })
        .await
    }

    async fn list_payments(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let user_id = *user_id;
        self.run(move |inner| inner.list_payments_sync(&user_id, limit, offset))
            .await
    }

    async fn list_overdue_payments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        self.run(move |inner| inner.list_overdue_sync(now, limit)).await
    }
}
