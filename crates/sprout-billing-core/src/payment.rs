//! Payment records and their lifecycle.
//!
//! A [`Payment`] is created `pending` when checkout starts and moves to a
//! terminal status once the provider reports an outcome. The allowed moves
//! are encoded in [`PaymentStatus::transition_to`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{CreditError, PaymentId, UserId};

/// One checkout attempt with the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Local identifier.
    pub id: PaymentId,

    /// The paying user.
    pub user_id: UserId,

    /// Identifier assigned by the provider.
    pub provider_payment_id: String,

    /// Checkout URL returned by the provider.
    pub checkout_url: Option<String>,

    /// Amount charged in minor currency units.
    pub amount: i64,

    /// ISO currency code.
    pub currency: String,

    /// Credits granted once the payment completes.
    pub credits_purchased: i64,

    /// Current status.
    pub status: PaymentStatus,

    /// When the checkout started.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,

    /// After this instant a still-pending payment is expired locally.
    pub expires_at: DateTime<Utc>,

    /// Last payload received from the provider, kept for auditing only.
    pub provider_metadata: serde_json::Value,
}

impl Payment {
    /// Create a pending payment.
    #[must_use]
    pub fn pending(
        id: PaymentId,
        user_id: UserId,
        provider_payment_id: String,
        amount: i64,
        currency: String,
        credits_purchased: i64,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            provider_payment_id,
            checkout_url: None,
            amount,
            currency,
            credits_purchased,
            status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + timeout,
            provider_metadata: serde_json::Value::Null,
        }
    }

    /// Whether a still-pending payment has outlived its window.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && now >= self.expires_at
    }
}

/// Local payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Checkout started, no outcome yet.
    Pending,
    /// Paid; credits granted.
    Completed,
    /// The charge failed.
    Failed,
    /// The customer abandoned or cancelled checkout.
    Cancelled,
    /// Charged back after completion; credits clawed back.
    Disputed,
    /// No outcome within the payment window.
    Expired,
}

/// How a status change should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the target status.
    Same,
    /// Normal lifecycle move.
    Allowed,
    /// Provider truth overrides a different terminal status.
    Override,
    /// The move is refused; the status stays as it is.
    Rejected,
}

impl PaymentStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
            Self::Expired => "expired",
        }
    }

    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Classify a move from `self` to `target`.
    ///
    /// Provider-reported completion overrides any non-completed terminal
    /// status because money was captured. A locally synthesised `expired`
    /// yields to any provider outcome except a dispute. The only other
    /// terminal move is `completed -> disputed`.
    #[must_use]
    pub const fn transition_to(&self, target: Self) -> Transition {
        use PaymentStatus::{Cancelled, Completed, Disputed, Expired, Failed, Pending};

        match (*self, target) {
            (Pending, Pending) | (Completed, Completed) | (Failed, Failed) | (Cancelled, Cancelled)
            | (Disputed, Disputed) | (Expired, Expired) => Transition::Same,
            (Pending, Completed | Failed | Cancelled | Expired) | (Completed, Disputed) => {
                Transition::Allowed
            }
            (Failed | Cancelled | Expired, Completed) | (Expired, Failed | Cancelled) => {
                Transition::Override
            }
            _ => Transition::Rejected,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "disputed" => Ok(Self::Disputed),
            "expired" => Ok(Self::Expired),
            other => Err(CreditError::Storage(format!("unknown payment status: {other}"))),
        }
    }
}

/// Status values the payment provider reports.
///
/// Anything outside this set is rejected with
/// `CreditError::UnknownProviderStatus` instead of being guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Funds captured.
    Succeeded,
    /// Charge in flight.
    Processing,
    /// Waiting on the customer (3DS, redirect, ...).
    RequiresCustomerAction,
    /// Waiting on a payment method.
    RequiresPaymentMethod,
    /// Charge failed.
    Failed,
    /// Checkout cancelled.
    Cancelled,
    /// Checkout session expired at the provider.
    Expired,
    /// Chargeback opened or lost.
    Disputed,
}

impl ProviderStatus {
    /// The local status this report drives the payment to, or `None` while
    /// the provider is still working on it.
    #[must_use]
    pub const fn target(&self) -> Option<PaymentStatus> {
        match self {
            Self::Succeeded => Some(PaymentStatus::Completed),
            Self::Failed => Some(PaymentStatus::Failed),
            Self::Cancelled => Some(PaymentStatus::Cancelled),
            Self::Expired => Some(PaymentStatus::Expired),
            Self::Disputed => Some(PaymentStatus::Disputed),
            Self::Processing | Self::RequiresCustomerAction | Self::RequiresPaymentMethod => None,
        }
    }

    /// Stable lowercase name, as the provider spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Processing => "processing",
            Self::RequiresCustomerAction => "requires_customer_action",
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Disputed => "disputed",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "processing" => Ok(Self::Processing),
            "requires_customer_action" => Ok(Self::RequiresCustomerAction),
            "requires_payment_method" => Ok(Self::RequiresPaymentMethod),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "disputed" => Ok(Self::Disputed),
            other => Err(CreditError::UnknownProviderStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PaymentStatus::{Cancelled, Completed, Disputed, Expired, Failed, Pending};

    #[test]
    fn pending_can_reach_every_outcome_but_dispute() {
        for target in [Completed, Failed, Cancelled, Expired] {
            assert_eq!(Pending.transition_to(target), Transition::Allowed);
        }
        assert_eq!(Pending.transition_to(Disputed), Transition::Rejected);
    }

    #[test]
    fn completed_only_moves_to_disputed() {
        assert_eq!(Completed.transition_to(Disputed), Transition::Allowed);
        for target in [Pending, Failed, Cancelled, Expired] {
            assert_eq!(Completed.transition_to(target), Transition::Rejected);
        }
    }

    #[test]
    fn captured_money_overrides_failure() {
        assert_eq!(Failed.transition_to(Completed), Transition::Override);
        assert_eq!(Cancelled.transition_to(Completed), Transition::Override);
        assert_eq!(Expired.transition_to(Completed), Transition::Override);
        assert_eq!(Failed.transition_to(Cancelled), Transition::Rejected);
        assert_eq!(Expired.transition_to(Failed), Transition::Override);
    }

    #[test]
    fn disputed_is_final() {
        for target in [Pending, Completed, Failed, Cancelled, Expired] {
            assert_eq!(Disputed.transition_to(target), Transition::Rejected);
        }
        assert_eq!(Disputed.transition_to(Disputed), Transition::Same);
    }

    #[test]
    fn unknown_provider_status_fails_loudly() {
        assert!(matches!(
            "partially_refunded".parse::<ProviderStatus>(),
            Err(CreditError::UnknownProviderStatus(s)) if s == "partially_refunded"
        ));
        assert_eq!("succeeded".parse::<ProviderStatus>().unwrap().target(), Some(Completed));
        assert_eq!("processing".parse::<ProviderStatus>().unwrap().target(), None);
    }

    #[test]
    fn overdue_only_applies_to_pending() {
        let mut payment = Payment::pending(
            PaymentId::generate(),
            UserId::generate(),
            "pay_1".into(),
            1500,
            "USD".into(),
            15,
            Duration::seconds(300),
        );
        let later = payment.created_at + Duration::seconds(301);
        assert!(!payment.is_overdue(payment.created_at));
        assert!(payment.is_overdue(later));
        payment.status = Completed;
        assert!(!payment.is_overdue(later));
    }
}
