//! Key encoding utilities for `RocksDB`.
//!
//! Integers are big-endian so that lexicographic key order matches numeric
//! order within a prefix.

use chrono::{DateTime, Utc};

use sprout_billing_core::{PaymentId, TransactionType, UserId};

/// Balance key.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Ledger entry key.
///
/// Format: `user_id (16 bytes) || sequence (8 bytes BE)`
#[must_use]
pub fn entry_key(user_id: &UserId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Prefix for iterating all entries of a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Idempotency key for a payment-linked entry.
#[must_use]
pub fn payment_entry_key(payment_id: &PaymentId, transaction_type: TransactionType) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + transaction_type.as_str().len());
    key.extend_from_slice(payment_id.as_bytes());
    key.extend_from_slice(transaction_type.as_str().as_bytes());
    key
}

/// Payment key.
#[must_use]
pub fn payment_key(payment_id: &PaymentId) -> Vec<u8> {
    payment_id.as_bytes().to_vec()
}

/// Provider payment ID index key.
#[must_use]
pub fn provider_key(provider_payment_id: &str) -> Vec<u8> {
    provider_payment_id.as_bytes().to_vec()
}

/// User-payment index key.
///
/// Format: `user_id (16) || created_ms (8 BE) || payment_id (16)`
#[must_use]
pub fn user_payment_key(
    user_id: &UserId,
    created_at: DateTime<Utc>,
    payment_id: &PaymentId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&millis(created_at).to_be_bytes());
    key.extend_from_slice(payment_id.as_bytes());
    key
}

/// Pending-payment index key.
///
/// Format: `expires_ms (8 BE) || payment_id (16)`
#[must_use]
pub fn pending_key(expires_at: DateTime<Utc>, payment_id: &PaymentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&millis(expires_at).to_be_bytes());
    key.extend_from_slice(payment_id.as_bytes());
    key
}

/// Upper bound (exclusive) of pending keys expiring at or before `now`.
#[must_use]
pub fn pending_upper_bound(now: DateTime<Utc>) -> Vec<u8> {
    millis(now).saturating_add(1).to_be_bytes().to_vec()
}

/// Extract the payment ID from the last 16 bytes of an index key.
///
/// Returns `None` if the key is shorter than 16 bytes.
#[must_use]
pub fn trailing_payment_id(key: &[u8]) -> Option<PaymentId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(PaymentId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

/// Milliseconds since the epoch, clamped at zero.
fn millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_sort_by_sequence() {
        let user_id = UserId::generate();
        let k2 = entry_key(&user_id, 2);
        let k10 = entry_key(&user_id, 10);
        assert_eq!(k2.len(), 24);
        assert!(k2 < k10);
        assert!(k10.starts_with(&user_prefix(&user_id)));
    }

    #[test]
    fn payment_entry_keys_differ_by_type() {
        let payment_id = PaymentId::generate();
        assert_ne!(
            payment_entry_key(&payment_id, TransactionType::Purchase),
            payment_entry_key(&payment_id, TransactionType::Refund)
        );
    }

    #[test]
    fn trailing_payment_id_from_index_keys() {
        let payment_id = PaymentId::generate();
        let now = Utc::now();
        assert_eq!(trailing_payment_id(&pending_key(now, &payment_id)), Some(payment_id));
        assert_eq!(
            trailing_payment_id(&user_payment_key(&UserId::generate(), now, &payment_id)),
            Some(payment_id)
        );
        assert_eq!(trailing_payment_id(&[0u8; 4]), None);
    }

    #[test]
    fn pending_bound_includes_now() {
        let now = Utc::now();
        let key = pending_key(now, &PaymentId::generate());
        assert!(key < pending_upper_bound(now));
        let later = pending_key(now + chrono::Duration::milliseconds(1), &PaymentId::generate());
        assert!(later >= pending_upper_bound(now));
    }
}
