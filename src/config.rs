//! Command line and environment configuration.
//!
//! Every setting can come from a flag or from the environment (a `.env` file
//! is loaded first by the binary). Flags win over the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "merchant-ledger")]
#[command(about = "Merchant transaction ledger with pending settlement aggregation")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stream create requests from a CSV file and print per-merchant balances
    Ingest { input: PathBuf },

    /// Validate a request CSV without writing anything
    Check { input: PathBuf },

    /// Rebuild pending settlement state from the ledger and print the settlement keyspace
    Reconcile,

    /// Rebuild, then clear one merchant's pending settlement and print it
    Settle { merchant_id: i64 },

    /// Print stored transactions of one merchant or with one status, newest first
    #[command(group(ArgGroup::new("filter").required(true).args(["merchant_id", "status"])))]
    List {
        #[arg(long)]
        merchant_id: Option<i64>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// SQLite ledger database
    #[arg(long, env = "DATABASE_PATH", default_value = "merchant_ledger.db")]
    pub database_path: PathBuf,

    /// Base URL of the merchant balance service
    #[arg(long, env = "MERCHANT_SERVICE_URL", default_value = "http://merchant-service:7002")]
    pub merchant_service_url: String,

    #[arg(long, env = "NOTIFY_TIMEOUT_SECS", default_value = "5")]
    pub notify_timeout_secs: u64,

    #[arg(long, env = "DISABLE_NOTIFICATIONS")]
    pub disable_notifications: bool,

    /// Lifetime of a merchant's pending state without new activity
    #[arg(long, env = "PENDING_TTL_DAYS", default_value = "30")]
    pub pending_ttl_days: u64,

    /// Capacity of each side-effect queue
    #[arg(long, env = "DISPATCH_CAPACITY", default_value = "1024")]
    pub dispatch_capacity: usize,

    #[arg(long, env = "RECONCILE_GRACE_SECS", default_value = "60")]
    pub reconcile_grace_secs: u64,

    #[arg(long, env = "RECONCILE_BATCH", default_value = "500")]
    pub reconcile_batch: usize,

    /// Period of the background reconciliation pass while ingesting
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "30")]
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_days * 24 * 60 * 60)
    }

    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile_grace_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}
