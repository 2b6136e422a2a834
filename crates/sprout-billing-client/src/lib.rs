//! SproutCV billing client SDK.
//!
//! Typed access to the billing API for the presentation layer: balances,
//! ledger history, and credit-pack checkouts.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use sprout_billing_client::SproutBillingClient;
//!
//! # async fn example() -> Result<(), sprout_billing_client::ClientError> {
//! let client = SproutBillingClient::new("https://billing.sproutcv.app", "user-jwt")?;
//!
//! let payment = client.create_payment(1500, 15).await?;
//! println!("Pay at {:?}", payment.checkout_url);
//!
//! let result = client
//!     .wait_for_payment(
//!         &payment.provider_payment_id,
//!         Duration::from_secs(300),
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//! println!("Payment is {}", result.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, SproutBillingClient};
pub use error::ClientError;
pub use types::*;
