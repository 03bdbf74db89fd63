pub mod config;
pub mod csv_utils;
pub mod dispatch;
pub mod dto;
mod error;
pub mod model;
pub mod notify;
pub mod reconcile;
mod runner;
pub mod stores;
#[cfg(test)]
mod testing;
pub mod writer;

pub use dispatch::Dispatcher;
pub use dto::{BalanceRow, CreateTransactionRequest, TransactionResponse};
pub use error::{Error, Result};
pub use model::{MerchantId, TransactionId};
pub use reconcile::{ReconcileReport, Reconciler};
pub use runner::{balance_rows, check_requests, ingest, write_balances, IngestSummary};
pub use writer::TransactionWriter;
