//! The runner streams create requests from a CSV file through the
//! [`TransactionWriter`](crate::writer::TransactionWriter) and reports the
//! resulting per-merchant balances. [`check_requests`] validates a file
//! without writing anything.
//!
mod async_runner;
mod check;

pub use async_runner::{balance_rows, ingest, write_balances, IngestSummary};
pub use check::check_requests;
