//! PostgreSQL storage implementation.
//!
//! Appends lock the balance row with `SELECT ... FOR UPDATE` inside a
//! transaction; the partial unique index on
//! `(related_payment_id, transaction_type)` backs the idempotency check.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use sprout_billing_core::{
    AppendRequest, Balance, EntryId, LedgerEntry, Payment, PaymentId, PaymentStatus,
    TransactionType, UserId,
};

use crate::error::{Result, StoreError};
use crate::{opening_request, plan_append, AppendOutcome, EntryQuery, Store};

const BALANCE_COLUMNS: &str = "user_id, available, frozen, debt, version, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, user_id, sequence, transaction_type, credits_changed, \
     balance_after, related_payment_id, description, metadata, status, created_at";

const PAYMENT_COLUMNS: &str = "id, user_id, provider_payment_id, checkout_url, amount, currency, \
     credits_purchased, status, created_at, updated_at, expires_at, provider_metadata";

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn lock_balance(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &UserId,
    ) -> Result<Option<Balance>> {
        sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(*user_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| balance_from_row(&row))
        .transpose()
    }

    async fn insert_entry(tx: &mut Transaction<'_, Postgres>, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO ledger_entries ({ENTRY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(entry.id.to_string())
        .bind(*entry.user_id.as_uuid())
        .bind(to_i64(entry.sequence)?)
        .bind(entry.transaction_type.as_str())
        .bind(entry.credits_changed)
        .bind(entry.balance_after)
        .bind(entry.related_payment_id.map(|id| *id.as_uuid()))
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| unique_violation(e, "ledger entry", entry.id.to_string()))?;
        Ok(())
    }

    async fn write_balance(tx: &mut Transaction<'_, Postgres>, balance: &Balance) -> Result<()> {
        sqlx::query(
            "UPDATE balances SET available = $2, frozen = $3, debt = $4, version = $5, \
             updated_at = $6 WHERE user_id = $1",
        )
        .bind(*balance.user_id.as_uuid())
        .bind(balance.available)
        .bind(balance.frozen)
        .bind(balance.debt)
        .bind(to_i64(balance.version)?)
        .bind(balance.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn payment_entry<'e, E>(
        executor: E,
        payment_id: &PaymentId,
        transaction_type: TransactionType,
    ) -> Result<Option<LedgerEntry>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE related_payment_id = $1 AND transaction_type = $2 AND status = 'completed'"
        ))
        .bind(*payment_id.as_uuid())
        .bind(transaction_type.as_str())
        .fetch_optional(executor)
        .await?
        .map(|row| entry_from_row(&row))
        .transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn open_account(&self, user_id: &UserId, welcome_bonus: i64) -> Result<Balance> {
        let mut balance = Balance::new(*user_id);
        let opening = match opening_request(*user_id, welcome_bonus) {
            Some(request) => {
                let (next, entry, _) = plan_append(&balance, request)?;
                balance = next;
                Some(entry)
            }
            None => None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO balances ({BALANCE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(*user_id.as_uuid())
        .bind(balance.available)
        .bind(balance.frozen)
        .bind(balance.debt)
        .bind(to_i64(balance.version)?)
        .bind(balance.created_at)
        .bind(balance.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "account", user_id.to_string()))?;

        if let Some(entry) = &opening {
            Self::insert_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(balance)
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        sqlx::query(&format!("SELECT {BALANCE_COLUMNS} FROM balances WHERE user_id = $1"))
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| balance_from_row(&row))
            .transpose()
    }

    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_balance(&mut tx, &request.user_id)
            .await?
            .ok_or_else(|| StoreError::account_not_found(request.user_id))?;

        if let Some(payment_id) = request.related_payment_id {
            let existing =
                Self::payment_entry(&mut *tx, &payment_id, request.transaction_type).await?;
            if let Some(entry) = existing {
                tx.rollback().await?;
                return Ok(AppendOutcome {
                    entry,
                    balance: current,
                    applied: false,
                    shortfall: 0,
                });
            }
        }

        let (balance, entry, shortfall) = plan_append(&current, request)?;
        Self::write_balance(&mut tx, &balance).await?;
        Self::insert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

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
        Self::payment_entry(&self.pool, payment_id, transaction_type).await
    }

    async fn list_entries(&self, user_id: &UserId, query: EntryQuery) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE user_id = $1 AND ($2::text IS NULL OR transaction_type = $2) \
             ORDER BY sequence DESC LIMIT $3 OFFSET $4"
        ))
        .bind(*user_id.as_uuid())
        .bind(query.transaction_type.map(|t| t.as_str()))
        .bind(to_i64(query.limit as u64)?)
        .bind(to_i64(query.offset as u64)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn replay_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE user_id = $1 ORDER BY sequence"
        ))
        .bind(*user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(*payment.id.as_uuid())
        .bind(*payment.user_id.as_uuid())
        .bind(&payment.provider_payment_id)
        .bind(&payment.checkout_url)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.credits_purchased)
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.expires_at)
        .bind(&payment.provider_metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "payment", payment.provider_payment_id.clone()))?;
        Ok(())
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>> {
        sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(*payment_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn get_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>> {
        sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_payment_id = $1"
        ))
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| payment_from_row(&row))
        .transpose()
    }

    async fn transition_payment(
        &self,
        payment_id: &PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_metadata: serde_json::Value,
    ) -> Result<Option<Payment>> {
        let metadata = (!provider_metadata.is_null()).then_some(provider_metadata);
        let updated = sqlx::query(&format!(
            "UPDATE payments SET status = $3, updated_at = now(), \
             provider_metadata = COALESCE($4, provider_metadata) \
             WHERE id = $1 AND status = $2 RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(*payment_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => payment_from_row(&row).map(Some),
            None if self.get_payment(payment_id).await?.is_some() => Ok(None),
            None => Err(StoreError::payment_not_found(payment_id)),
        }
    }

    async fn list_payments(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(*user_id.as_uuid())
        .bind(to_i64(limit as u64)?)
        .bind(to_i64(offset as u64)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn list_overdue_payments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = 'pending' AND expires_at <= $1 \
             ORDER BY expires_at LIMIT $2"
        ))
        .bind(now)
        .bind(to_i64(limit as u64)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{value} does not fit in BIGINT")))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("negative counter: {value}")))
}

fn parse<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Serialization(e.to_string()))
}

fn unique_violation(e: sqlx::Error, entity: &'static str, id: String) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::AlreadyExists { entity, id }
        }
        other => other.into(),
    }
}

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        available: row.try_get("available")?,
        frozen: row.try_get("frozen")?,
        debt: row.try_get("debt")?,
        version: to_u64(row.try_get("version")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let id: String = row.try_get("id")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let status: String = row.try_get("status")?;
    let related: Option<Uuid> = row.try_get("related_payment_id")?;

    Ok(LedgerEntry {
        id: parse::<EntryId>(&id)?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        sequence: to_u64(row.try_get("sequence")?)?,
        transaction_type: parse(&transaction_type)?,
        credits_changed: row.try_get("credits_changed")?,
        balance_after: row.try_get("balance_after")?,
        related_payment_id: related.map(PaymentId::from_uuid),
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        status: parse(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment> {
    let status: String = row.try_get("status")?;

    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        provider_payment_id: row.try_get("provider_payment_id")?,
        checkout_url: row.try_get("checkout_url")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        credits_purchased: row.try_get("credits_purchased")?,
        status: parse::<PaymentStatus>(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
        provider_metadata: row.try_get("provider_metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    async fn connect() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url, 5).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn pg_store_contract() {
        contract::run_all(&connect().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn pg_store_concurrent_contract() {
        contract::run_concurrent(std::sync::Arc::new(connect().await)).await;
    }
}
