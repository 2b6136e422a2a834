//! Webhook signature verification (Standard Webhooks scheme).

use axum::http::HeaderMap;
use base64::{engine::general_purpose, Engine as _};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sprout_billing_core::CreditError;

use crate::crypto::{constant_time_eq, hmac_sha256};

/// Header carrying the unique delivery ID.
pub const HEADER_ID: &str = "webhook-id";
/// Header carrying the delivery timestamp (unix seconds).
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
/// Header carrying one or more space-separated `v1,<base64>` signatures.
pub const HEADER_SIGNATURE: &str = "webhook-signature";

/// Verifies webhook deliveries against the shared secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// Create a verifier from a `whsec_`-style secret.
    ///
    /// The part after `whsec_` is base64-decoded; secrets that are not valid
    /// base64 are used as raw bytes.
    #[must_use]
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
        let key = general_purpose::STANDARD
            .decode(encoded)
            .unwrap_or_else(|_| encoded.as_bytes().to_vec());
        Self { key, tolerance }
    }

    /// Signature header value for a payload, as the provider would send it.
    #[must_use]
    pub fn sign(&self, id: &str, timestamp: i64, body: &str) -> String {
        let mac = hmac_sha256(&self.key, format!("{id}.{timestamp}.{body}").as_bytes());
        format!("v1,{}", general_purpose::STANDARD.encode(mac))
    }

    /// Verify a delivery.
    ///
    /// `now` is unix seconds.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::WebhookSignatureInvalid` when a header is
    /// missing, the timestamp is outside the tolerance, or no signature
    /// matches.
    pub fn verify(&self, headers: &HeaderMap, body: &str, now: i64) -> Result<(), CreditError> {
        let id = header(headers, HEADER_ID)?;
        let timestamp = header(headers, HEADER_TIMESTAMP)?;
        let signatures = header(headers, HEADER_SIGNATURE)?;

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| invalid("malformed timestamp"))?;
        if now.abs_diff(ts) > self.tolerance.as_secs() {
            return Err(invalid("timestamp outside tolerance"));
        }

        let expected = hmac_sha256(&self.key, format!("{id}.{ts}.{body}").as_bytes());

        let valid = signatures
            .split_whitespace()
            .filter_map(|sig| sig.strip_prefix("v1,"))
            .filter_map(|sig| general_purpose::STANDARD.decode(sig).ok())
            .any(|sig| constant_time_eq(&expected, &sig));

        if valid {
            Ok(())
        } else {
            Err(invalid("no matching signature"))
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, CreditError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| invalid(&format!("missing {name} header")))
}

fn invalid(reason: &str) -> CreditError {
    CreditError::WebhookSignatureInvalid(reason.to_string())
}

/// Counts signature failures in a sliding window and alerts on bursts.
#[derive(Debug)]
pub struct SignatureFailureMonitor {
    failures: Mutex<VecDeque<Instant>>,
    window: Duration,
    threshold: usize,
}

impl Default for SignatureFailureMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 10)
    }
}

impl SignatureFailureMonitor {
    /// Create a monitor alerting at `threshold` failures within `window`.
    #[must_use]
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            window,
            threshold,
        }
    }

    /// Record a failure; returns the number of failures in the window.
    pub fn record(&self, reason: &str) -> usize {
        let now = Instant::now();
        let count = {
            let mut failures = self
                .failures
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while failures
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.window)
            {
                failures.pop_front();
            }
            failures.push_back(now);
            failures.len()
        };

        tracing::warn!(
            reason = %reason,
            recent_failures = count,
            "Webhook signature verification failed"
        );
        if count >= self.threshold {
            tracing::error!(
                recent_failures = count,
                window_secs = self.window.as_secs(),
                "Repeated webhook signature failures; possible forgery attempt"
            );
        }
        count
    }
}
