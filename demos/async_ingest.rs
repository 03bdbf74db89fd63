//! Ingests a request CSV into throwaway in-memory stores and prints the
//! per-merchant balances. Nothing is persisted and no notifications are sent.
//!
//! ```bash
//! cargo run --example async_ingest data/example_requests.csv
//! ```

use std::env;
use std::error::Error;
use std::process;
use std::sync::Arc;

use merchant_ledger::dispatch::DEFAULT_DISPATCH_CAPACITY;
use merchant_ledger::notify::NoopNotifier;
use merchant_ledger::stores::{MemoryAggregateStore, MemoryLedgerStore};
use merchant_ledger::{balance_rows, ingest, write_balances, Dispatcher, TransactionWriter};

#[tokio::main]
async fn main() {
    if let Err(err) = run_app().await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

async fn run_app() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        return Err("Usage: cargo run --example async_ingest -- requests.csv".into());
    }

    let ledger = Arc::new(MemoryLedgerStore::new());
    let aggregate = Arc::new(MemoryAggregateStore::default());
    let dispatcher = Dispatcher::spawn(
        aggregate.clone(),
        Arc::new(NoopNotifier),
        DEFAULT_DISPATCH_CAPACITY,
    );
    let writer = TransactionWriter::new(ledger.clone(), dispatcher);

    let summary = ingest(&args[1], writer).await?;
    eprintln!("accepted {}, rejected {}", summary.accepted, summary.rejected);

    let rows = balance_rows(ledger.as_ref(), aggregate.as_ref()).await?;
    write_balances(std::io::stdout(), rows)?;
    Ok(())
}
