//! Core types for SproutCV billing.
//!
//! This crate provides the foundational types of the credit ledger:
//!
//! - **Identifiers**: `UserId`, `PaymentId`, `EntryId`
//! - **Balances**: `Balance`, `BalanceDelta`, `Overdraft`
//! - **Ledger**: `LedgerEntry`, `TransactionType`, `AppendRequest`, `Replay`
//! - **Payments**: `Payment`, `PaymentStatus`, `ProviderStatus`, `Transition`
//! - **Errors**: `CreditError`, `Diagnostic`
//!
//! # Credits
//!
//! A credit is the unit consumed by one AI resume analysis. Credits are
//! whole numbers stored as `i64`; payments are charged in minor currency
//! units (cents) and each payment names how many credits it yields.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod payment;

pub use balance::{AppliedDelta, Balance, BalanceDelta, Overdraft, DEFAULT_WELCOME_BONUS};
pub use error::{CreditError, Diagnostic, Result};
pub use ids::{EntryId, IdError, PaymentId, UserId};
pub use ledger::{AppendRequest, EntryStatus, LedgerEntry, Replay, TransactionType};
pub use payment::{Payment, PaymentStatus, ProviderStatus, Transition};
