//! Domain-specific errors for the merchant ledger.
//!
//! Contains error variants for:
//! - Request validation (missing merchant, non-positive amount, missing currency)
//! - Ledger Store failures (duplicate reference or ledger entry, storage errors)
//! - Aggregate Store and notification failures
//!
//! Only validation and durability failures reach the caller of a create.
//! Aggregate and notification failures are logged by the dispatcher.

use thiserror::Error;

use crate::model::{MerchantId, TransactionId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("merchant_id is required")]
    MissingMerchantId,

    #[error("amount must be positive")]
    AmountMustBePositive,

    #[error("amount {0} does not fit in minor units")]
    AmountOutOfRange(rust_decimal::Decimal),

    #[error("currency is required")]
    MissingCurrency,

    #[error("transaction reference {0:?} already exists")]
    DuplicateReference(String),

    #[error("transaction {0} already has a ledger entry")]
    DuplicateLedgerEntry(TransactionId),

    #[error("balance of merchant {0} would overflow")]
    BalanceOverflow(MerchantId),

    #[error("transaction {0:?} not found")]
    TransactionNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("stored row is malformed: {0}")]
    CorruptRow(String),

    #[error("aggregate store error for merchant {merchant}: {reason}")]
    Aggregate { merchant: MerchantId, reason: String },

    #[error("balance notification failed: {0}")]
    Notification(#[from] reqwest::Error),

    #[error("balance service returned {status}: {body}")]
    NotificationRejected { status: u16, body: String },
}

impl Error {
    /// Validation errors are rejected before any write and carry no side effects.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingMerchantId
                | Error::AmountMustBePositive
                | Error::AmountOutOfRange(_)
                | Error::MissingCurrency
        )
    }
}
