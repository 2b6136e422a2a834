//! Column families for the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Balances, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger entries, keyed by `user_id || sequence (u64 BE)`.
    pub const ENTRIES: &str = "entries";

    /// Idempotency index, keyed by `payment_id || transaction_type`.
    /// Value is the entry key.
    pub const PAYMENT_ENTRIES: &str = "payment_entries";

    /// Payments, keyed by `payment_id`.
    pub const PAYMENTS: &str = "payments";

    /// Index: provider payment ID to `payment_id`.
    pub const PAYMENTS_BY_PROVIDER: &str = "payments_by_provider";

    /// Index: payments by user, keyed by `user_id || created_ms || payment_id`.
    /// Value is empty (index only).
    pub const PAYMENTS_BY_USER: &str = "payments_by_user";

    /// Index: pending payments, keyed by `expires_ms || payment_id`.
    /// Value is empty (index only).
    pub const PENDING_PAYMENTS: &str = "pending_payments";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::ENTRIES,
        cf::PAYMENT_ENTRIES,
        cf::PAYMENTS,
        cf::PAYMENTS_BY_PROVIDER,
        cf::PAYMENTS_BY_USER,
        cf::PENDING_PAYMENTS,
    ]
}
