//! Storage layer for the merchant ledger. Provides:
//! - The durable ledger of transactions and balance entries ([`LedgerStore`]),
//!   backed by SQLite ([`SqliteLedgerStore`]) or memory ([`MemoryLedgerStore`])
//! - The ephemeral per-merchant pending settlement aggregate ([`AggregateStore`])
//!
//! The in-memory stores serialize their mutating operations per merchant
//! only. The SQLite ledger funnels every statement through one connection.

mod aggregate;
mod ledger;
mod memory_ledger;
mod sqlite_ledger;

pub use aggregate::{
    keys, AggregateStore, KeyValue, MemoryAggregateStore, PendingSnapshot, DEFAULT_PENDING_TTL,
};
pub use ledger::{LedgerStore, Recorded};
pub use memory_ledger::MemoryLedgerStore;
pub use sqlite_ledger::SqliteLedgerStore;
