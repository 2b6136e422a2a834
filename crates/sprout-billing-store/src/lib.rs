//! Storage layer for SproutCV billing.
//!
//! This crate persists balances, ledger entries and payments. Every backend
//! implements the same [`Store`] trait and the same atomic append unit:
//! the idempotency check, the balance update, and the ledger row are
//! committed together or not at all.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used by tests and local development
//! - `RocksStore`: embedded `RocksDB` with column families (feature
//!   `rocksdb-backend`, on by default)
//! - [`PgStore`]: PostgreSQL with row locks and a unique index on
//!   `(related_payment_id, transaction_type)`
//!
//! # Example
//!
//! ```no_run
//! use sprout_billing_core::{AppendRequest, UserId};
//! use sprout_billing_store::{MemoryStore, Store};
//!
//! # async fn example() -> sprout_billing_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! store.open_account(&user_id, 5).await?;
//!
//! let outcome = store
//!     .append(AppendRequest::usage(user_id, 1, "resume analysis".into()))
//!     .await?;
//! assert_eq!(outcome.balance.available, 4);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
mod locks;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sprout_billing_core::{
    AppendRequest, Balance, LedgerEntry, Payment, PaymentId, PaymentStatus, TransactionType, UserId,
};

/// Maximum page size for ledger and payment listings.
pub const MAX_PAGE_SIZE: usize = 100;

/// Result of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The new entry, or the existing one when the append was a duplicate.
    pub entry: LedgerEntry,
    /// The balance after the append.
    pub balance: Balance,
    /// `false` when an entry for the same `(payment, type)` already existed.
    pub applied: bool,
    /// Credits that became debt because `available` ran out.
    pub shortfall: i64,
}

/// Filter and page for ledger listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryQuery {
    /// Maximum number of entries.
    pub limit: usize,
    /// Number of newest entries to skip.
    pub offset: usize,
    /// Only entries of this type.
    pub transaction_type: Option<TransactionType>,
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            transaction_type: None,
        }
    }
}

impl EntryQuery {
    /// Whether `entry` passes the type filter.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.transaction_type
            .map_or(true, |ty| entry.transaction_type == ty)
    }
}

/// The storage trait defining all persistence operations.
///
/// Balances are only ever changed through [`Store::open_account`] and
/// [`Store::append`]; there is deliberately no balance setter.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Balances and ledger
    // =========================================================================

    /// Create the balance row for `user_id` and, when `welcome_bonus > 0`,
    /// append the opening `bonus` entry in the same atomic step.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the user already has a balance.
    async fn open_account(&self, user_id: &UserId, welcome_bonus: i64) -> Result<Balance>;

    /// Get the balance of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>>;

    /// Apply `request` to the balance and append the ledger entry atomically.
    ///
    /// When the request names a payment and a completed entry of the same
    /// type already exists for it, that entry is returned unchanged with
    /// `applied = false`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user has no balance.
    /// - `StoreError::Credit` with `InsufficientFunds` or `InvalidCredits`
    ///   when the request cannot be applied; nothing is written.
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome>;

    /// Find the completed entry of `transaction_type` linked to a payment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_payment_entry(
        &self,
        payment_id: &PaymentId,
        transaction_type: TransactionType,
    ) -> Result<Option<LedgerEntry>>;

    /// List a user's entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_entries(&self, user_id: &UserId, query: EntryQuery) -> Result<Vec<LedgerEntry>>;

    /// All of a user's entries in sequence order, for replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn replay_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>>;

    // =========================================================================
    // Payments
    // =========================================================================

    /// Insert a new payment.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the local or provider ID is taken.
    async fn insert_payment(&self, payment: &Payment) -> Result<()>;

    /// Get a payment by local ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>>;

    /// Get a payment by the provider's ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>>;

    /// Move a payment from `from` to `to` if its status is still `from`.
    ///
    /// Returns the updated payment, or `None` when another writer changed
    /// the status first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the payment does not exist.
    async fn transition_payment(
        &self,
        payment_id: &PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_metadata: serde_json::Value,
    ) -> Result<Option<Payment>>;

    /// List a user's payments, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_payments(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>>;

    /// Pending payments whose `expires_at` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_overdue_payments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>>;
}

/// Compute the balance and entry an append produces.
///
/// Shared by every backend so the arithmetic is identical everywhere.
pub(crate) fn plan_append(
    current: &Balance,
    request: AppendRequest,
) -> Result<(Balance, LedgerEntry, i64)> {
    request.validate()?;
    let applied = current.apply_delta(request.delta(), request.overdraft)?;
    let entry = request.into_entry(applied.balance.version, applied.balance.available);
    Ok((applied.balance, entry, applied.shortfall))
}

/// The opening bonus entry for a fresh account.
pub(crate) fn opening_request(user_id: UserId, welcome_bonus: i64) -> Option<AppendRequest> {
    (welcome_bonus > 0)
        .then(|| AppendRequest::bonus(user_id, welcome_bonus, "Welcome bonus".into()))
}
