//! The Transaction Writer: validates a create request, makes it durable in the
//! ledger and hands the settlement side effects to the dispatcher.

use std::sync::Arc;

use tracing::info;

use crate::dispatch::{Dispatcher, PendingUpdate};
use crate::dto::{
    CreateTransactionRequest, StatusResponse, TransactionListResponse, TransactionResponse,
};
use crate::error::{Error, Result};
use crate::model::{
    generate_reference, to_display_units, to_minor_units, MerchantId, NewTransaction,
    TransactionStatus, DEFAULT_PAYMENT_METHOD,
};
use crate::notify::BalanceUpdate;
use crate::stores::{LedgerStore, Recorded};

pub struct TransactionWriter {
    ledger: Arc<dyn LedgerStore>,
    dispatcher: Dispatcher,
}

impl TransactionWriter {
    pub fn new(ledger: Arc<dyn LedgerStore>, dispatcher: Dispatcher) -> Self {
        Self { ledger, dispatcher }
    }

    /// Records a transaction.
    ///
    /// Returns once the transaction row is durable. The ledger entry, the
    /// pending settlement update and the balance notification may each fail
    /// without failing the call; the response is built from the stored row.
    pub async fn create(&self, request: CreateTransactionRequest) -> Result<TransactionResponse> {
        let new = validate(request)?;
        let Recorded { transaction, entry } = self.ledger.record_transaction(new).await?;

        if transaction.is_settlement_eligible() {
            self.dispatcher.dispatch_pending(PendingUpdate {
                merchant_id: transaction.merchant_id,
                amount: transaction.amount,
                currency: transaction.currency.clone(),
                transaction_id: transaction.id,
            });
            self.dispatcher.dispatch_notification(BalanceUpdate {
                merchant_id: transaction.merchant_id,
                currency: transaction.currency.clone(),
                amount: to_display_units(transaction.amount),
            });
        }

        info!(
            merchant_id = %transaction.merchant_id,
            transaction_id = %transaction.id,
            reference = %transaction.reference,
            amount = transaction.amount,
            status = %transaction.status,
            balance_after = entry.as_ref().map(|e| e.balance_after),
            "transaction recorded"
        );
        Ok(TransactionResponse::from(&transaction))
    }

    pub async fn get(&self, reference: &str) -> Result<TransactionResponse> {
        self.ledger
            .fetch_by_reference(reference)
            .await?
            .map(|tx| TransactionResponse::from(&tx))
            .ok_or_else(|| Error::TransactionNotFound(reference.to_string()))
    }

    pub async fn list_by_merchant(
        &self,
        merchant: MerchantId,
        limit: usize,
    ) -> Result<TransactionListResponse> {
        Ok(self
            .ledger
            .list_by_merchant(merchant, limit)
            .await?
            .iter()
            .map(TransactionResponse::from)
            .collect())
    }

    pub async fn list_by_status(
        &self,
        status: &str,
        limit: usize,
    ) -> Result<TransactionListResponse> {
        Ok(self
            .ledger
            .list_by_status(status.trim(), limit)
            .await?
            .iter()
            .map(TransactionResponse::from)
            .collect())
    }

    /// Acknowledges a capture. Nothing is stored.
    pub fn capture(&self, reference: &str) -> StatusResponse {
        StatusResponse {
            reference: reference.to_string(),
            status: TransactionStatus::Captured.to_string(),
        }
    }

    /// Acknowledges a refund. Nothing is stored.
    pub fn refund(&self, reference: &str) -> StatusResponse {
        StatusResponse {
            reference: reference.to_string(),
            status: TransactionStatus::Refunded.to_string(),
        }
    }

    /// Drains the side-effect queues.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Checks a create request and turns it into the record the ledger stores:
/// trimmed and upper-cased currency, minor-unit amount, generated reference
/// and `success`/`card` defaults.
pub fn validate(request: CreateTransactionRequest) -> Result<NewTransaction> {
    if request.merchant_id <= 0 {
        return Err(Error::MissingMerchantId);
    }
    if request.amount <= rust_decimal::Decimal::ZERO {
        return Err(Error::AmountMustBePositive);
    }
    let currency = request.currency.trim().to_ascii_uppercase();
    if currency.is_empty() {
        return Err(Error::MissingCurrency);
    }
    // Sub-minor amounts round to nothing.
    let amount = to_minor_units(request.amount)?;
    if amount <= 0 {
        return Err(Error::AmountMustBePositive);
    }

    Ok(NewTransaction {
        reference: non_empty(request.reference).unwrap_or_else(generate_reference),
        merchant_id: MerchantId(request.merchant_id),
        customer_id: request.customer_id,
        customer_email: non_empty(request.customer_email),
        customer_name: non_empty(request.customer_name),
        amount,
        currency,
        status: non_empty(request.status)
            .map(TransactionStatus::from)
            .unwrap_or_default(),
        payment_method: non_empty(request.payment_method)
            .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string()),
        description: non_empty(request.description),
    })
}
