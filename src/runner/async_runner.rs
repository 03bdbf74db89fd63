use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::{
    csv_utils::write_csv,
    dto::{BalanceRow, CreateTransactionRequest},
    model::to_display_units,
    stores::{AggregateStore, LedgerStore},
    writer::TransactionWriter,
};

use csv_async::{AsyncReaderBuilder, Error as CsvError, Trim};
use serde::Serialize;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{info, warn};

const BUFFER_SIZE: usize = 1024;
/// Creates awaiting the ledger at once.
const MAX_IN_FLIGHT: usize = 64;

type Result<T, E = Box<dyn Error + Send + Sync>> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Streams create requests from `input_path` through `writer`.
/// Spawns two tasks:
/// * CSV reader - streams rows from the input file, deserializes them and sends them to the processor via channel.
/// * Processor - receives requests and runs up to [`MAX_IN_FLIGHT`] creates concurrently until the channel is closed.
///
/// Returns after the writer's side-effect queues have drained, so the
/// aggregate reflects every accepted transaction.
///
/// # Errors
/// Returns an error if:
/// * The input file cannot be read
/// * The CSV is malformed
///
/// Requests the writer rejects are logged and counted, not returned.
pub async fn ingest<P>(input_path: P, writer: TransactionWriter) -> Result<IngestSummary>
where
    P: AsRef<Path>,
{
    let (tx, rx) = mpsc::channel(BUFFER_SIZE);
    let input_path = input_path.as_ref().to_owned();

    let reader_handle = tokio::spawn(read_requests(input_path, tx));
    let processor_handle = tokio::spawn(process_requests(Arc::new(writer), rx));

    // A reader failure closes the channel, so the processor still finishes.
    let read_result = reader_handle.await?;
    let (writer, summary) = processor_handle.await?;
    read_result?;

    let writer = Arc::try_unwrap(writer).map_err(|_| "transaction writer is still shared")?;
    writer.shutdown().await;

    info!(accepted = summary.accepted, rejected = summary.rejected, "ingest finished");
    Ok(summary)
}

/// Reads and deserializes create requests from a CSV file.
/// Returns them through the provided channel.
async fn read_requests(
    input_path: impl AsRef<Path> + Send,
    tx: mpsc::Sender<CreateTransactionRequest>,
) -> Result<(), CsvError> {
    let file = File::open(input_path).await?;
    let mut csv_reader = AsyncReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .create_deserializer(file);

    let mut records = csv_reader.deserialize::<CreateTransactionRequest>();
    while let Some(result) = records.next().await {
        // CSV parsing errors are critical - propagate them
        let request = result?;
        if tx.send(request).await.is_err() {
            // Receiver dropped, exit gracefully
            break;
        }
    }
    Ok(())
}

async fn process_requests(
    writer: Arc<TransactionWriter>,
    mut rx: mpsc::Receiver<CreateTransactionRequest>,
) -> (Arc<TransactionWriter>, IngestSummary) {
    let mut summary = IngestSummary::default();
    let mut in_flight = JoinSet::new();

    while let Some(request) = rx.recv().await {
        if in_flight.len() >= MAX_IN_FLIGHT {
            if let Some(done) = in_flight.join_next().await {
                tally(&mut summary, done);
            }
        }
        let writer = Arc::clone(&writer);
        in_flight.spawn(async move { writer.create(request).await });
    }
    while let Some(done) = in_flight.join_next().await {
        tally(&mut summary, done);
    }
    (writer, summary)
}

fn tally<T>(
    summary: &mut IngestSummary,
    done: std::result::Result<crate::Result<T>, tokio::task::JoinError>,
) {
    match done {
        Ok(Ok(_)) => summary.accepted += 1,
        Ok(Err(e)) => {
            warn!(error = %e, "request rejected");
            summary.rejected += 1;
        }
        Err(e) => {
            warn!(error = %e, "create task failed");
            summary.rejected += 1;
        }
    }
}

/// One row per merchant with a ledger balance, sorted by merchant id.
pub async fn balance_rows(
    ledger: &dyn LedgerStore,
    aggregate: &dyn AggregateStore,
) -> crate::Result<Vec<BalanceRow>> {
    let mut rows = Vec::new();
    for merchant_id in ledger.merchants().await? {
        rows.push(BalanceRow {
            merchant_id,
            balance: to_display_units(ledger.balance(merchant_id).await?),
            pending_amount: to_display_units(aggregate.get_pending_amount(merchant_id).await?),
            pending_transactions: aggregate.pending_transactions(merchant_id).await?.len(),
        });
    }
    Ok(rows)
}

pub fn write_balances<W: Write>(writer: W, rows: Vec<BalanceRow>) -> csv::Result<()> {
    write_csv(writer, rows.into_iter())
}
