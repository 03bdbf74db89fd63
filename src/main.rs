use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use merchant_ledger::config::{Cli, Command, Config};
use merchant_ledger::notify::{BalanceNotifier, HttpBalanceNotifier, NoopNotifier};
use merchant_ledger::stores::{LedgerStore, MemoryAggregateStore, SqliteLedgerStore};
use merchant_ledger::{
    balance_rows, check_requests, ingest, write_balances, Dispatcher, MerchantId, Reconciler,
    TransactionWriter,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Command::Check { input } => {
            let summary = check_requests(&input)
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("check of {} failed", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Ingest { input } => {
            let (ledger, aggregate) = open_stores(&config)?;
            let reconciler = Arc::new(
                Reconciler::new(ledger.clone(), aggregate.clone())
                    .with_grace(config.reconcile_grace())
                    .with_batch_size(config.reconcile_batch),
            );
            let (stop, stopped) = watch::channel(false);
            let background = {
                let reconciler = Arc::clone(&reconciler);
                let period = config.reconcile_interval();
                tokio::spawn(async move { reconciler.run_periodic(period, stopped).await })
            };

            let writer = TransactionWriter::new(
                ledger.clone(),
                Dispatcher::spawn(aggregate.clone(), notifier(&config)?, config.dispatch_capacity),
            );
            let result = tokio::select! {
                result = ingest(&input, writer) => result.map_err(|e| anyhow!(e)),
                _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
            };
            stop.send(true).ok();
            background.await.ok();
            let summary = result.with_context(|| format!("ingest of {} failed", input.display()))?;
            if summary.rejected > 0 {
                warn!(rejected = summary.rejected, "some requests were rejected");
            }
            // Earlier runs' unsettled transactions only exist in the ledger.
            rebuild(&ledger, &aggregate, &config).await?;

            let rows = balance_rows(ledger.as_ref(), aggregate.as_ref()).await?;
            write_balances(io::stdout(), rows)?;
        }
        Command::Reconcile => {
            let (ledger, aggregate) = open_stores(&config)?;
            let report = rebuild(&ledger, &aggregate, &config).await?;
            info!(?report, "pending settlement rebuilt from ledger");
            println!("{}", serde_json::to_string_pretty(&aggregate.keyspace_snapshot())?);
        }
        Command::Settle { merchant_id } => {
            if merchant_id <= 0 {
                bail!("merchant id must be positive");
            }
            let (ledger, aggregate) = open_stores(&config)?;
            let reconciler = rebuild_reconciler(&ledger, &aggregate, &config);
            reconciler.run_once().await?;
            let snapshot = reconciler.settle_merchant(MerchantId(merchant_id)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::List {
            merchant_id,
            status,
            limit,
        } => {
            let (ledger, aggregate) = open_stores(&config)?;
            // Reads only, so nothing is ever queued.
            let writer = TransactionWriter::new(
                ledger,
                Dispatcher::spawn(aggregate, Arc::new(NoopNotifier), 1),
            );
            let listed = match (merchant_id, status) {
                (Some(merchant_id), _) => {
                    writer.list_by_merchant(MerchantId(merchant_id), limit).await
                }
                (None, Some(status)) => writer.list_by_status(&status, limit).await,
                (None, None) => bail!("list needs --merchant-id or --status"),
            };
            writer.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&listed?)?);
        }
    }
    Ok(())
}

fn open_stores(config: &Config) -> Result<(Arc<dyn LedgerStore>, Arc<MemoryAggregateStore>)> {
    let ledger = SqliteLedgerStore::open(&config.database_path).with_context(|| {
        format!("failed to open ledger at {}", config.database_path.display())
    })?;
    // Empty until a command rebuilds it from the ledger.
    let aggregate = MemoryAggregateStore::new(config.pending_ttl());
    Ok((Arc::new(ledger), Arc::new(aggregate)))
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("merchant_ledger=info"));
    // stdout carries the report.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn notifier(config: &Config) -> Result<Arc<dyn BalanceNotifier>> {
    if config.disable_notifications {
        info!("balance notifications disabled");
        return Ok(Arc::new(NoopNotifier));
    }
    let notifier = HttpBalanceNotifier::new(&config.merchant_service_url, config.notify_timeout())
        .context("failed to build balance notifier")?;
    info!(endpoint = notifier.endpoint(), "balance notifications enabled");
    Ok(Arc::new(notifier))
}

/// A reconciler that takes every unsettled transaction, however recent.
/// Nothing else writes while these commands run.
fn rebuild_reconciler(
    ledger: &Arc<dyn LedgerStore>,
    aggregate: &Arc<MemoryAggregateStore>,
    config: &Config,
) -> Reconciler {
    Reconciler::new(ledger.clone(), aggregate.clone())
        .with_grace(Duration::ZERO)
        .with_batch_size(config.reconcile_batch)
}

async fn rebuild(
    ledger: &Arc<dyn LedgerStore>,
    aggregate: &Arc<MemoryAggregateStore>,
    config: &Config,
) -> Result<merchant_ledger::ReconcileReport> {
    Ok(rebuild_reconciler(ledger, aggregate, config).run_once().await?)
}
