//! Per-user credit balances.
//!
//! A [`Balance`] is never edited directly. Every mutation goes through
//! [`Balance::apply_delta`] inside the store's atomic ledger append, which
//! is what keeps the balance and the ledger in lockstep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CreditError, UserId};

/// Credits granted when an account is opened, unless configured otherwise.
pub const DEFAULT_WELCOME_BONUS: i64 = 5;

/// The current credit balance of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The owning user.
    pub user_id: UserId,

    /// Credits usable immediately. Never negative.
    pub available: i64,

    /// Credits held for pending usage. Never negative.
    pub frozen: i64,

    /// Credits owed after a clawback exceeded `available`. Never negative.
    ///
    /// Incoming credits settle debt before they become available.
    pub debt: i64,

    /// Sequence position of the last ledger entry applied to this balance.
    pub version: u64,

    /// When the account was opened.
    pub created_at: DateTime<Utc>,

    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

/// Signed change to the two sub-balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceDelta {
    /// Change to `available`.
    pub available: i64,
    /// Change to `frozen`.
    pub frozen: i64,
}

/// What to do when a debit exceeds `available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overdraft {
    /// Fail with `InsufficientFunds` and leave the balance untouched.
    #[default]
    Reject,
    /// Stop `available` at zero and record the rest as debt.
    CarryDebt,
}

/// Result of applying a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDelta {
    /// The balance after the delta.
    pub balance: Balance,
    /// Credits that could not be taken from `available` and became debt.
    pub shortfall: i64,
}

impl Balance {
    /// Create an empty balance at version zero.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            available: 0,
            frozen: 0,
            debt: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Net position: `available + frozen - debt`.
    ///
    /// This is what a replay of the completed, non-hold ledger entries sums to.
    #[must_use]
    pub const fn net(&self) -> i64 {
        self.available + self.frozen - self.debt
    }

    /// Compute the balance after applying `delta`.
    ///
    /// Positive `available` deltas settle debt first. A negative `available`
    /// delta larger than `available` fails unless `overdraft` is
    /// [`Overdraft::CarryDebt`]. `frozen` can never go negative.
    ///
    /// # Errors
    ///
    /// - `CreditError::InsufficientFunds` if the delta would drive a
    ///   sub-balance below zero.
    /// - `CreditError::InvalidCredits` on arithmetic overflow.
    pub fn apply_delta(
        &self,
        delta: BalanceDelta,
        overdraft: Overdraft,
    ) -> Result<AppliedDelta, CreditError> {
        let overflow = || CreditError::InvalidCredits("balance overflow".into());

        let mut available = self.available;
        let mut debt = self.debt;
        let mut shortfall = 0;

        if delta.available >= 0 {
            let settled = delta.available.min(debt);
            debt -= settled;
            available = available
                .checked_add(delta.available - settled)
                .ok_or_else(overflow)?;
        } else {
            let requested = delta.available.checked_neg().ok_or_else(overflow)?;
            if requested <= available {
                available -= requested;
            } else if overdraft == Overdraft::CarryDebt {
                shortfall = requested - available;
                available = 0;
                debt = debt.checked_add(shortfall).ok_or_else(overflow)?;
            } else {
                return Err(self.insufficient(requested));
            }
        }

        let frozen = self.frozen.checked_add(delta.frozen).ok_or_else(overflow)?;
        if frozen < 0 {
            return Err(self.insufficient(-delta.frozen));
        }

        Ok(AppliedDelta {
            balance: Self {
                user_id: self.user_id,
                available,
                frozen,
                debt,
                version: self.version + 1,
                created_at: self.created_at,
                updated_at: Utc::now(),
            },
            shortfall,
        })
    }

    fn insufficient(&self, requested: i64) -> CreditError {
        CreditError::InsufficientFunds {
            available: self.available,
            frozen: self.frozen,
            requested,
        }
    }
}
