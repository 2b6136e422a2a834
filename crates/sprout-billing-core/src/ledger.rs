//! Ledger entry types for SproutCV billing.
//!
//! Every balance change is recorded as a [`LedgerEntry`]. Entries are
//! append-only; corrections are made with offsetting entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::balance::{Balance, BalanceDelta, Overdraft};
use crate::{CreditError, EntryId, PaymentId, UserId};

/// One applied balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: EntryId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Position in the user's ledger, starting at 1 with no gaps.
    pub sequence: u64,

    /// Type of entry.
    pub transaction_type: TransactionType,

    /// Signed credits. Positive adds, negative removes; for holds this is
    /// the change to `available`.
    pub credits_changed: i64,

    /// `available` immediately after this entry was applied.
    pub balance_after: i64,

    /// The payment this entry settles, for purchases and refunds.
    pub related_payment_id: Option<PaymentId>,

    /// Human-readable reason.
    pub description: String,

    /// Additional context.
    pub metadata: serde_json::Value,

    /// Whether the entry counts toward the balance.
    pub status: EntryStatus,

    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
}

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits bought through a payment.
    Purchase,
    /// Credits consumed by an analysis.
    Usage,
    /// Credits returned or clawed back for a payment.
    Refund,
    /// Promotional credits, including the welcome bonus.
    Bonus,
    /// Credits removed because they expired.
    Expiry,
    /// Credits moved from `available` to `frozen`.
    Freeze,
    /// Credits moved from `frozen` back to `available`.
    Unfreeze,
}

impl TransactionType {
    /// All transaction types.
    pub const ALL: [Self; 7] = [
        Self::Purchase,
        Self::Usage,
        Self::Refund,
        Self::Bonus,
        Self::Expiry,
        Self::Freeze,
        Self::Unfreeze,
    ];

    /// Stable lowercase name, as stored and sent over the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
            Self::Expiry => "expiry",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        }
    }

    /// Whether this type moves credits between sub-balances without
    /// changing the total.
    #[must_use]
    pub const fn is_hold(&self) -> bool {
        matches!(self, Self::Freeze | Self::Unfreeze)
    }

    /// Split signed credits into per-sub-balance deltas.
    #[must_use]
    pub const fn delta(&self, credits_changed: i64) -> BalanceDelta {
        if self.is_hold() {
            BalanceDelta {
                available: credits_changed,
                frozen: -credits_changed,
            }
        } else {
            BalanceDelta {
                available: credits_changed,
                frozen: 0,
            }
        }
    }

    /// Check that `credits_changed` has the sign this type requires.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::InvalidCredits` on a zero or wrongly signed value.
    pub fn validate(&self, credits_changed: i64) -> Result<(), CreditError> {
        let ok = match self {
            Self::Purchase | Self::Bonus | Self::Unfreeze => credits_changed > 0,
            Self::Usage | Self::Expiry | Self::Freeze => credits_changed < 0,
            Self::Refund => credits_changed != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(CreditError::InvalidCredits(format!(
                "{credits_changed} is not valid for a {self} entry"
            )))
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CreditError::InvalidCredits(format!("unknown transaction type: {s}")))
    }
}

/// Whether an entry is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Part of a multi-step flow; does not count toward the balance.
    Pending,
    /// Applied and immutable.
    Completed,
}

impl EntryStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(CreditError::Storage(format!("unknown entry status: {other}"))),
        }
    }
}

/// A request to append one entry to a user's ledger.
///
/// Stores turn this into a [`LedgerEntry`] inside their atomic append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    /// The user whose ledger is appended to.
    pub user_id: UserId,
    /// Type of entry.
    pub transaction_type: TransactionType,
    /// Signed credits.
    pub credits_changed: i64,
    /// Human-readable reason.
    pub description: String,
    /// Related payment; makes the append idempotent per `(payment, type)`.
    pub related_payment_id: Option<PaymentId>,
    /// Additional context.
    pub metadata: serde_json::Value,
    /// Overdraft policy for debits.
    pub overdraft: Overdraft,
}

impl AppendRequest {
    fn new(
        user_id: UserId,
        transaction_type: TransactionType,
        credits_changed: i64,
        description: String,
    ) -> Self {
        Self {
            user_id,
            transaction_type,
            credits_changed,
            description,
            related_payment_id: None,
            metadata: serde_json::Value::Null,
            overdraft: Overdraft::Reject,
        }
    }

    /// Credits bought through `payment_id`.
    #[must_use]
    pub fn purchase(
        user_id: UserId,
        credits: i64,
        payment_id: PaymentId,
        description: String,
    ) -> Self {
        Self::new(user_id, TransactionType::Purchase, credits, description).with_payment(payment_id)
    }

    /// Clawback of credits granted by `payment_id`, carrying any shortfall
    /// as debt.
    #[must_use]
    pub fn clawback(
        user_id: UserId,
        credits: i64,
        payment_id: PaymentId,
        description: String,
    ) -> Self {
        let mut request = Self::new(user_id, TransactionType::Refund, -credits.abs(), description)
            .with_payment(payment_id);
        request.overdraft = Overdraft::CarryDebt;
        request
    }

    /// Credits consumed by usage. Always recorded as negative.
    #[must_use]
    pub fn usage(user_id: UserId, credits: i64, description: String) -> Self {
        Self::new(user_id, TransactionType::Usage, -credits.abs(), description)
    }

    /// Promotional credits.
    #[must_use]
    pub fn bonus(user_id: UserId, credits: i64, description: String) -> Self {
        Self::new(user_id, TransactionType::Bonus, credits, description)
    }

    /// Expired credits. Always recorded as negative.
    #[must_use]
    pub fn expiry(user_id: UserId, credits: i64, description: String) -> Self {
        Self::new(user_id, TransactionType::Expiry, -credits.abs(), description)
    }

    /// Hold credits.
    #[must_use]
    pub fn freeze(user_id: UserId, credits: i64, description: String) -> Self {
        Self::new(user_id, TransactionType::Freeze, -credits.abs(), description)
    }

    /// Release held credits.
    #[must_use]
    pub fn unfreeze(user_id: UserId, credits: i64, description: String) -> Self {
        Self::new(user_id, TransactionType::Unfreeze, credits.abs(), description)
    }

    /// Link the entry to a payment.
    #[must_use]
    pub fn with_payment(mut self, payment_id: PaymentId) -> Self {
        self.related_payment_id = Some(payment_id);
        self
    }

    /// Set metadata on the entry.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate the sign of the credits for the entry type.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::InvalidCredits` when the sign is wrong or zero.
    pub fn validate(&self) -> Result<(), CreditError> {
        self.transaction_type.validate(self.credits_changed)
    }

    /// Balance delta this request applies.
    #[must_use]
    pub const fn delta(&self) -> BalanceDelta {
        self.transaction_type.delta(self.credits_changed)
    }

    /// Build the completed entry once the store has applied the delta.
    #[must_use]
    pub fn into_entry(self, sequence: u64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::generate(),
            user_id: self.user_id,
            sequence,
            transaction_type: self.transaction_type,
            credits_changed: self.credits_changed,
            balance_after,
            related_payment_id: self.related_payment_id,
            description: self.description,
            metadata: self.metadata,
            status: EntryStatus::Completed,
            created_at: Utc::now(),
        }
    }
}

/// Balance reconstructed from a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Replay {
    /// Sum of `credits_changed` over completed, non-hold entries.
    pub net: i64,
    /// Reconstructed `available`.
    pub available: i64,
    /// Reconstructed `frozen`.
    pub frozen: i64,
    /// Reconstructed `debt`.
    pub debt: i64,
    /// Number of completed entries replayed.
    pub entries: u64,
}

impl Replay {
    /// Re-apply completed `entries` (in sequence order) from a zero balance.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::LedgerInconsistency` if the sequence has gaps,
    /// an entry cannot be re-applied, or a stored `balance_after` disagrees
    /// with the replayed value.
    pub fn from_entries(user_id: UserId, entries: &[LedgerEntry]) -> Result<Self, CreditError> {
        let inconsistency = |detail: String| CreditError::LedgerInconsistency {
            user_id: user_id.to_string(),
            detail,
        };

        let mut balance = Balance::new(user_id);
        let mut net: i64 = 0;
        let mut last_sequence = 0;

        for entry in entries.iter().filter(|e| e.status == EntryStatus::Completed) {
            if entry.sequence <= last_sequence {
                return Err(inconsistency(format!(
                    "entry {} has sequence {} after {}",
                    entry.id, entry.sequence, last_sequence
                )));
            }
            last_sequence = entry.sequence;

            let overdraft = if entry.transaction_type == TransactionType::Refund {
                Overdraft::CarryDebt
            } else {
                Overdraft::Reject
            };
            balance = balance
                .apply_delta(entry.transaction_type.delta(entry.credits_changed), overdraft)
                .map_err(|e| inconsistency(format!("entry {} cannot be replayed: {e}", entry.id)))?
                .balance;

            if balance.available != entry.balance_after {
                return Err(inconsistency(format!(
                    "entry {} records balance_after={} but replay gives {}",
                    entry.id, entry.balance_after, balance.available
                )));
            }
            if !entry.transaction_type.is_hold() {
                net += entry.credits_changed;
            }
        }

        Ok(Self {
            net,
            available: balance.available,
            frozen: balance.frozen,
            debt: balance.debt,
            entries: balance.version,
        })
    }

    /// Compare the replay with a live balance.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::LedgerInconsistency` naming every field that differs.
    pub fn verify(&self, live: &Balance) -> Result<(), CreditError> {
        let mut mismatches = Vec::new();
        for (field, replayed, stored) in [
            ("available", self.available, live.available),
            ("frozen", self.frozen, live.frozen),
            ("debt", self.debt, live.debt),
            ("net", self.net, live.net()),
        ] {
            if replayed != stored {
                mismatches.push(format!("{field}: replay={replayed} stored={stored}"));
            }
        }
        if self.entries != live.version {
            mismatches.push(format!("version: replay={} stored={}", self.entries, live.version));
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(CreditError::LedgerInconsistency {
                user_id: live.user_id.to_string(),
                detail: mismatches.join(", "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(balance: &Balance, request: AppendRequest) -> (Balance, LedgerEntry) {
        let applied = balance.apply_delta(request.delta(), request.overdraft).unwrap();
        let entry = request.into_entry(applied.balance.version, applied.balance.available);
        (applied.balance, entry)
    }

    #[test]
    fn constructors_fix_the_sign() {
        let user_id = UserId::generate();
        assert_eq!(AppendRequest::usage(user_id, 3, "analysis".into()).credits_changed, -3);
        assert_eq!(AppendRequest::freeze(user_id, 3, "hold".into()).credits_changed, -3);
        assert_eq!(AppendRequest::unfreeze(user_id, -3, "release".into()).credits_changed, 3);
        let clawback =
            AppendRequest::clawback(user_id, 15, PaymentId::generate(), "chargeback".into());
        assert_eq!(clawback.credits_changed, -15);
        assert_eq!(clawback.overdraft, Overdraft::CarryDebt);
    }

    #[test]
    fn sign_validation() {
        assert!(TransactionType::Purchase.validate(15).is_ok());
        assert!(TransactionType::Purchase.validate(-15).is_err());
        assert!(TransactionType::Usage.validate(0).is_err());
        assert!(TransactionType::Refund.validate(-1).is_ok());
        assert!(TransactionType::Refund.validate(1).is_ok());
        assert!(TransactionType::Freeze.validate(2).is_err());
    }

    #[test]
    fn hold_deltas_move_between_sub_balances() {
        assert_eq!(
            TransactionType::Freeze.delta(-4),
            BalanceDelta { available: -4, frozen: 4 }
        );
        assert_eq!(
            TransactionType::Usage.delta(-4),
            BalanceDelta { available: -4, frozen: 0 }
        );
    }

    #[test]
    fn transaction_type_names_parse_back() {
        for ty in TransactionType::ALL {
            assert_eq!(ty.as_str().parse::<TransactionType>().unwrap(), ty);
        }
        assert!("subscription".parse::<TransactionType>().is_err());
    }

    #[test]
    fn replay_matches_applied_history() {
        let user_id = UserId::generate();
        let mut balance = Balance::new(user_id);
        let mut entries = Vec::new();
        for request in [
            AppendRequest::bonus(user_id, 5, "welcome".into()),
            AppendRequest::purchase(user_id, 15, PaymentId::generate(), "pack".into()),
            AppendRequest::freeze(user_id, 4, "hold".into()),
            AppendRequest::usage(user_id, 6, "analysis".into()),
            AppendRequest::clawback(user_id, 15, PaymentId::generate(), "chargeback".into()),
        ] {
            let (next, entry) = apply(&balance, request);
            balance = next;
            entries.push(entry);
        }

        let replay = Replay::from_entries(user_id, &entries).unwrap();
        assert_eq!(replay.net, 5 + 15 - 6 - 15);
        assert_eq!(replay.net, balance.net());
        replay.verify(&balance).unwrap();
    }

    #[test]
    fn replay_flags_tampered_balance_after() {
        let user_id = UserId::generate();
        let welcome = AppendRequest::bonus(user_id, 5, "welcome".into());
        let (balance, mut entry) = apply(&Balance::new(user_id), welcome);
        entry.balance_after = 50;
        let err = Replay::from_entries(user_id, &[entry]).unwrap_err();
        assert!(matches!(err, CreditError::LedgerInconsistency { .. }));
        assert_eq!(balance.available, 5);
    }

    #[test]
    fn verify_flags_drifted_live_balance() {
        let user_id = UserId::generate();
        let welcome = AppendRequest::bonus(user_id, 5, "welcome".into());
        let (mut balance, entry) = apply(&Balance::new(user_id), welcome);
        let replay = Replay::from_entries(user_id, &[entry]).unwrap();
        balance.available = 7;
        let err = replay.verify(&balance).unwrap_err();
        assert!(err.to_string().contains("available: replay=5 stored=7"));
    }

    #[test]
    fn pending_entries_are_ignored_by_replay() {
        let user_id = UserId::generate();
        let welcome = AppendRequest::bonus(user_id, 5, "welcome".into());
        let (_, mut entry) = apply(&Balance::new(user_id), welcome);
        entry.status = EntryStatus::Pending;
        let replay = Replay::from_entries(user_id, &[entry]).unwrap();
        assert_eq!(replay.net, 0);
        assert_eq!(replay.entries, 0);
    }
}
