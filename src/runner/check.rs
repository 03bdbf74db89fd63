use std::collections::HashSet;
use std::error::Error;
use std::path::Path;

use tracing::warn;

use super::async_runner::IngestSummary;
use crate::{csv_utils::read_csv, dto::CreateTransactionRequest, writer::validate};

/// Runs every request in `input_path` through the writer's validation without
/// touching a store. A reference repeated within the file counts as rejected
/// after its first use.
///
/// # Errors
/// Returns an error if:
/// * The input file cannot be read
/// * The CSV is malformed
pub fn check_requests<P>(input_path: P) -> Result<IngestSummary, Box<dyn Error + Send + Sync>>
where
    P: AsRef<Path>,
{
    let mut summary = IngestSummary::default();
    let mut references = HashSet::new();

    let requests = read_csv::<CreateTransactionRequest, _>(input_path)?;
    for (index, request) in requests.enumerate() {
        // CSV parsing errors are critical - propagate them
        let request = request?;
        let row = index + 1;
        match validate(request) {
            Ok(new) if references.insert(new.reference.clone()) => summary.accepted += 1,
            Ok(new) => {
                warn!(row, reference = %new.reference, "duplicate reference");
                summary.rejected += 1;
            }
            Err(e) => {
                warn!(row, error = %e, "request would be rejected");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}
