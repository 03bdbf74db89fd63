//! This example generates a CSV file of create requests (configurable through the constants)
//! for a number of merchants supplied as a command-line argument.
//!
//! The CSV file can then be fed to `merchant-ledger ingest`.
//!
//! Example (100 merchants):
//! ```bash
//! cargo run --example generator 100 > data/100_merchants.csv
//! ```
//! ### Maths
//! Based on the constants, the ending state of any merchant is known up front.
//!
//! Let:
//! - S = NUM_SALES, P = NUM_PAYOUTS, R = NUM_REJECTED,
//! - A_s = BASE_SALE_AMOUNT, A_p = BASE_PAYOUT_AMOUNT, and i = merchant id.
//!
//! **Sales**
//! Every sale is credited to the ledger and added to the pending settlement:
//! S·A_s·i = 40·2.50·i = 100·i.
//!
//! **Payouts**
//! Payouts are credited to the ledger too, but never reach the pending settlement:
//! P·A_p·i = 5·4.00·i = 20·i.
//!
//! **Rejected requests**
//! R requests per merchant carry a zero amount and are rejected before any write.
//!
//! **Final State for merchant i:**
//! - **balance** = 120·i
//! - **pending_amount** = 100·i
//! - **pending_transactions** = 40
//!
//! Payouts alternate between being marked by status and by payment method, so
//! both exclusion paths are exercised. References are unique, so the file can be
//! ingested once per database.
//!

use csv::Writer;
use merchant_ledger::CreateTransactionRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{env, error::Error};

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: cargo run --example generator <num_merchants>");
        std::process::exit(1);
    }

    let num_merchants: u32 = match args[1].parse() {
        Ok(n) if n > 0 => n,
        _ => {
            eprintln!("Error: <num_merchants> must be a positive integer.");
            std::process::exit(1);
        }
    };

    const NUM_SALES: usize = 40;
    const NUM_PAYOUTS: usize = 5;
    const NUM_REJECTED: usize = 2;
    const TOTAL_PER_MERCHANT: usize = NUM_SALES + NUM_PAYOUTS + NUM_REJECTED;

    // Scaled by the merchant id.
    const BASE_SALE_AMOUNT: Decimal = dec!(2.50);
    const BASE_PAYOUT_AMOUNT: Decimal = dec!(4.00);

    let mut wtr = Writer::from_writer(std::io::stdout());

    // Round-robin over merchants so that consecutive rows hit different merchants.
    for round in 0..TOTAL_PER_MERCHANT {
        for merchant in 1..=num_merchants {
            let merchant_decimal = Decimal::from(merchant);
            let reference = format!("gen-{merchant}-{round}");
            let request = if round < NUM_SALES {
                CreateTransactionRequest::new(
                    merchant.into(),
                    BASE_SALE_AMOUNT * merchant_decimal,
                    "NGN",
                )
            } else if round < NUM_SALES + NUM_PAYOUTS {
                let payout = CreateTransactionRequest::new(
                    merchant.into(),
                    BASE_PAYOUT_AMOUNT * merchant_decimal,
                    "NGN",
                );
                if round % 2 == 0 {
                    payout.with_status("payout")
                } else {
                    payout.with_payment_method("payout")
                }
            } else {
                CreateTransactionRequest::new(merchant.into(), Decimal::ZERO, "NGN")
            };
            wtr.serialize(request.with_reference(reference))?;
        }
    }
    wtr.flush()?;
    Ok(())
}
