//! Core records shared by the Ledger Store, the Aggregate Store and the writer.
//!
//! Money is always held as `i64` minor units inside the crate. Display units
//! (`Decimal`) only appear at the request/response edge.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Status and payment method value that keeps a transaction out of settlement.
pub const PAYOUT: &str = "payout";
pub const DEFAULT_PAYMENT_METHOD: &str = "card";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MerchantId(pub i64);

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionStatus {
    #[default]
    Success,
    Payout,
    Captured,
    Refunded,
    Other(String),
}

impl TransactionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Payout => PAYOUT,
            TransactionStatus::Captured => "captured",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Other(s) => s,
        }
    }
}

impl From<&str> for TransactionStatus {
    fn from(value: &str) -> Self {
        match value {
            "success" => TransactionStatus::Success,
            PAYOUT => TransactionStatus::Payout,
            "captured" => TransactionStatus::Captured,
            "refunded" => TransactionStatus::Refunded,
            other => TransactionStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for TransactionStatus {
    fn from(value: String) -> Self {
        TransactionStatus::from(value.as_str())
    }
}

impl From<TransactionStatus> for String {
    fn from(value: TransactionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payout-category transaction (by status or by payment method) never
/// reaches the Settlement Aggregator or the balance notification.
pub fn settlement_eligible(status: &TransactionStatus, payment_method: &str) -> bool {
    *status != TransactionStatus::Payout && payment_method != PAYOUT
}

/// A validated transaction that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub reference: String,
    pub merchant_id: MerchantId,
    pub customer_id: Option<i64>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: String,
    pub description: Option<String>,
}

impl NewTransaction {
    /// Builds a `success`/`card` transaction with a generated reference.
    pub fn new(merchant_id: MerchantId, amount: i64, currency: impl Into<String>) -> Self {
        Self {
            reference: generate_reference(),
            merchant_id,
            customer_id: None,
            customer_email: None,
            customer_name: None,
            amount,
            currency: currency.into(),
            status: TransactionStatus::Success,
            payment_method: DEFAULT_PAYMENT_METHOD.to_string(),
            description: None,
        }
    }

    /// Stamps the store-assigned identity onto the record.
    pub fn into_transaction(self, id: TransactionId, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            reference: self.reference,
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            customer_email: self.customer_email,
            customer_name: self.customer_name,
            amount: self.amount,
            currency: self.currency,
            status: self.status,
            payment_method: self.payment_method,
            description: self.description,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub reference: String,
    pub merchant_id: MerchantId,
    pub customer_id: Option<i64>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once a settlement consumer has durably taken this transaction.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_settlement_eligible(&self) -> bool {
        settlement_eligible(&self.status, &self.payment_method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Credit => "credit",
            EntryType::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credit" => Some(EntryType::Credit),
            "debit" => Some(EntryType::Debit),
            _ => None,
        }
    }

    /// Applies the entry direction to an unsigned minor-unit amount.
    pub fn signed(self, amount: i64) -> i64 {
        match self {
            EntryType::Credit => amount,
            EntryType::Debit => -amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub transaction_id: TransactionId,
    pub entry_type: EntryType,
    /// Signed minor units.
    pub amount: i64,
    pub balance_after: i64,
    pub currency: String,
    pub description: Option<String>,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

pub fn generate_reference() -> String {
    format!("txn_{}", uuid::Uuid::new_v4().simple())
}

/// Converts display units to minor units, rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|scaled| scaled.to_i64())
        .ok_or(Error::AmountOutOfRange(amount))
}

pub fn to_display_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
