//! Reconciliation job and the settlement clear path.
//!
//! The ledger is the source of truth. A pass appends ledger entries that a
//! degraded create left out, then rebuilds every merchant's pending
//! settlement state from the ledger's unsettled transactions. Settling a
//! merchant clears its pending state and marks the cleared transactions
//! settled in the ledger, so a later pass does not put them back.
//!
//! Both the rebuild of one merchant and its settlement run under the same
//! per-merchant lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::MerchantId;
use crate::stores::{AggregateStore, LedgerStore, PendingSnapshot};

pub const DEFAULT_RECONCILE_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONCILE_BATCH: usize = 500;

/// Counts from one [`Reconciler::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ledger_entries_appended: usize,
    pub ledger_entry_failures: usize,
    pub pending_restored: usize,
    pub pending_failures: usize,
    pub expired_purged: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.ledger_entry_failures == 0 && self.pending_failures == 0
    }
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    aggregate: Arc<dyn AggregateStore>,
    /// Transactions younger than this may still have their live aggregate
    /// update in the dispatch queue and are left alone.
    grace: Duration,
    batch_size: usize,
    merchant_locks: DashMap<MerchantId, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, aggregate: Arc<dyn AggregateStore>) -> Self {
        Self {
            ledger,
            aggregate,
            grace: DEFAULT_RECONCILE_GRACE,
            batch_size: DEFAULT_RECONCILE_BATCH,
            merchant_locks: DashMap::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn merchant_lock(&self, merchant: MerchantId) -> Arc<Mutex<()>> {
        Arc::clone(self.merchant_locks.entry(merchant).or_default().value())
    }

    /// Transactions created at or after this may still be mid-create.
    fn cutoff(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        Utc::now() - grace
    }

    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let cutoff = self.cutoff();
        self.repair_ledger(cutoff, &mut report).await?;
        self.restore_pending(cutoff, &mut report).await?;
        report.expired_purged = self.aggregate.purge_expired().await?;

        if report.is_clean() {
            info!(?report, "reconciliation pass finished");
        } else {
            warn!(?report, "reconciliation pass finished with failures");
        }
        metrics::counter!("reconcile_ledger_entries_appended_total", report.ledger_entries_appended as u64);
        metrics::counter!("reconcile_pending_restored_total", report.pending_restored as u64);
        Ok(report)
    }

    /// Appends the credit entry of every transaction older than `cutoff`
    /// that lacks one.
    async fn repair_ledger(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        loop {
            let batch = self
                .ledger
                .transactions_without_entry(cutoff, self.batch_size)
                .await?;
            let full_batch = batch.len() == self.batch_size;
            let mut appended = 0;
            for tx in batch {
                match self.ledger.append_credit(&tx).await {
                    Ok(entry) => {
                        debug!(
                            merchant_id = %tx.merchant_id,
                            transaction_id = %tx.id,
                            balance_after = entry.balance_after,
                            "ledger entry appended"
                        );
                        appended += 1;
                    }
                    // A concurrent pass got there first.
                    Err(Error::DuplicateLedgerEntry(_)) => {}
                    Err(e) => {
                        warn!(
                            merchant_id = %tx.merchant_id,
                            transaction_id = %tx.id,
                            error = %e,
                            "could not append missing ledger entry"
                        );
                        report.ledger_entry_failures += 1;
                    }
                }
            }
            report.ledger_entries_appended += appended;
            if !full_batch || appended == 0 {
                return Ok(());
            }
        }
    }

    async fn restore_pending(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for merchant in self.ledger.merchants().await? {
            let lock = self.merchant_lock(merchant);
            let _guard = lock.lock().await;

            let included = match self.aggregate.pending_transactions(merchant).await {
                Ok(included) => included,
                Err(e) => {
                    warn!(merchant_id = %merchant, error = %e, "could not read pending settlement");
                    report.pending_failures += 1;
                    continue;
                }
            };
            let unsettled = self.ledger.unsettled_transactions(merchant, cutoff).await?;
            for tx in unsettled.into_iter().filter(|tx| !included.contains(&tx.id)) {
                match self
                    .aggregate
                    .add_to_pending(merchant, tx.amount, &tx.currency, tx.id)
                    .await
                {
                    Ok(true) => report.pending_restored += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            merchant_id = %merchant,
                            transaction_id = %tx.id,
                            error = %e,
                            "could not restore pending settlement"
                        );
                        report.pending_failures += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Takes the merchant's pending state for payout.
    ///
    /// The returned snapshot is what the consumer must pay. An error means the
    /// merchant is not settled: either nothing was cleared, or the ledger did
    /// not record the settlement and the next pass restores the pending state.
    pub async fn settle_merchant(&self, merchant: MerchantId) -> Result<PendingSnapshot> {
        let lock = self.merchant_lock(merchant);
        let _guard = lock.lock().await;

        let snapshot = self.aggregate.clear_pending(merchant).await?;
        if snapshot.is_empty() {
            return Ok(snapshot);
        }
        let ids: Vec<_> = snapshot.transaction_ids.iter().copied().collect();
        let marked = self.ledger.mark_settled(merchant, &ids).await?;
        if marked != ids.len() {
            warn!(
                merchant_id = %merchant,
                cleared = ids.len(),
                marked,
                "some cleared transactions were already settled"
            );
        }
        info!(
            merchant_id = %merchant,
            amount = snapshot.amount,
            transactions = ids.len(),
            "merchant settled"
        );
        Ok(snapshot)
    }

    /// Runs a pass every `period` until `shutdown` flips to `true` or its
    /// sender goes away. A failed pass is logged and the loop carries on.
    pub async fn run_periodic(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("reconciler stopping");
                        return;
                    }
                }
            }
        }
    }
}
