use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};

use crate::model::{to_display_units, MerchantId, Transaction, TransactionId};

/// Inbound create request. `amount` is in display units (e.g. NGN, not kobo).
///
/// Missing or empty merchant id, amount and currency decode to zero or empty
/// values so that validation rejects the request rather than the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "deserialize_merchant_id")]
    pub merchant_id: i64,
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_amount")]
    pub amount: Decimal,
    #[serde(default, deserialize_with = "deserialize_currency")]
    pub currency: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl CreateTransactionRequest {
    pub fn new(merchant_id: i64, amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            reference: None,
            merchant_id,
            customer_id: None,
            customer_email: None,
            customer_name: None,
            amount,
            currency: currency.into(),
            payment_method: None,
            description: None,
            status: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = Some(method.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

fn deserialize_merchant_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<i64>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Parses the amount from its text so no digit passes through a float.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(text) = Option::<String>::deserialize(deserializer)? else {
        return Ok(Decimal::ZERO);
    };
    let text = text.trim();
    if text.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str_exact(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| D::Error::custom(format!("invalid amount {text:?}: {e}")))
}

fn deserialize_currency<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
        .map(|code| code.unwrap_or_default().trim().to_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: TransactionId,
    pub reference: String,
    pub merchant_id: MerchantId,
    pub customer_id: Option<i64>,
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Display units.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            reference: tx.reference.clone(),
            merchant_id: tx.merchant_id,
            customer_id: tx.customer_id,
            customer_email: tx.customer_email.clone(),
            customer_name: tx.customer_name.clone(),
            amount: to_display_units(tx.amount),
            currency: tx.currency.clone(),
            status: tx.status.to_string(),
            payment_method: tx.payment_method.clone(),
            description: tx.description.clone(),
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionListResponse {
    pub transactions: Vec<TransactionResponse>,
    pub total: usize,
}

impl FromIterator<TransactionResponse> for TransactionListResponse {
    fn from_iter<I: IntoIterator<Item = TransactionResponse>>(iter: I) -> Self {
        let transactions: Vec<_> = iter.into_iter().collect();
        let total = transactions.len();
        Self {
            transactions,
            total,
        }
    }
}

/// Capture/refund acknowledgement. These only echo the requested status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub reference: String,
    pub status: String,
}

/// One output row per merchant: durable balance next to the pending aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceRow {
    pub merchant_id: MerchantId,
    pub balance: Decimal,
    pub pending_amount: Decimal,
    pub pending_transactions: usize,
}
