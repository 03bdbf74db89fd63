//! Background dispatch of the side effects that follow a durable write.
//!
//! Each effect kind gets its own bounded channel and a single worker task that
//! drains it. Enqueueing never waits: when a queue is full (or already closed)
//! the effect is dropped, logged and counted, and the reconciliation job is
//! left to restore what was lost. Nothing here is retried inline.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::model::{MerchantId, TransactionId};
use crate::notify::{BalanceNotifier, BalanceUpdate};
use crate::stores::AggregateStore;

pub const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

const AGGREGATE: &str = "aggregate";
const NOTIFICATION: &str = "notification";

/// One qualifying transaction on its way into the Settlement Aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub merchant_id: MerchantId,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub transaction_id: TransactionId,
}

pub struct Dispatcher {
    pending: mpsc::Sender<PendingUpdate>,
    notifications: mpsc::Sender<BalanceUpdate>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the workers on the current tokio runtime.
    pub fn spawn(
        aggregate: Arc<dyn AggregateStore>,
        notifier: Arc<dyn BalanceNotifier>,
        capacity: usize,
    ) -> Self {
        let (pending, pending_rx) = mpsc::channel(capacity.max(1));
        let (notifications, notifications_rx) = mpsc::channel(capacity.max(1));
        let workers = vec![
            tokio::spawn(apply_pending(aggregate, pending_rx)),
            tokio::spawn(send_notifications(notifier, notifications_rx)),
        ];
        Self {
            pending,
            notifications,
            workers,
        }
    }

    /// Queues an aggregate update. Returns `false` if it was dropped.
    pub fn dispatch_pending(&self, update: PendingUpdate) -> bool {
        let merchant_id = update.merchant_id;
        let transaction_id = update.transaction_id;
        enqueue(&self.pending, update, AGGREGATE, merchant_id, Some(transaction_id))
    }

    /// Queues a balance notification. Returns `false` if it was dropped.
    pub fn dispatch_notification(&self, update: BalanceUpdate) -> bool {
        let merchant_id = update.merchant_id;
        enqueue(&self.notifications, update, NOTIFICATION, merchant_id, None)
    }

    /// Closes both queues and waits until everything already queued is handled.
    pub async fn shutdown(self) {
        let Self {
            pending,
            notifications,
            workers,
        } = self;
        drop(pending);
        drop(notifications);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "side effect worker panicked");
            }
        }
    }
}

fn enqueue<T>(
    queue: &mpsc::Sender<T>,
    item: T,
    kind: &'static str,
    merchant_id: MerchantId,
    transaction_id: Option<TransactionId>,
) -> bool {
    let reason = match queue.try_send(item) {
        Ok(()) => return true,
        Err(TrySendError::Full(_)) => "queue full",
        Err(TrySendError::Closed(_)) => "queue closed",
    };
    warn!(
        kind,
        merchant_id = %merchant_id,
        transaction_id = ?transaction_id,
        reason,
        "side effect dropped"
    );
    metrics::counter!("side_effects_dropped_total", 1, "kind" => kind);
    false
}

fn record_outcome(kind: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!("side_effects_total", 1, "kind" => kind, "outcome" => outcome);
}

async fn apply_pending(aggregate: Arc<dyn AggregateStore>, mut rx: mpsc::Receiver<PendingUpdate>) {
    while let Some(update) = rx.recv().await {
        let result = aggregate
            .add_to_pending(
                update.merchant_id,
                update.amount,
                &update.currency,
                update.transaction_id,
            )
            .await;
        match result {
            Ok(added) => {
                debug!(
                    merchant_id = %update.merchant_id,
                    transaction_id = %update.transaction_id,
                    added,
                    "pending settlement updated"
                );
                record_outcome(AGGREGATE, true);
            }
            Err(e) => {
                error!(
                    merchant_id = %update.merchant_id,
                    transaction_id = %update.transaction_id,
                    error = %e,
                    "failed to add transaction to pending settlement"
                );
                record_outcome(AGGREGATE, false);
            }
        }
    }
}

async fn send_notifications(
    notifier: Arc<dyn BalanceNotifier>,
    mut rx: mpsc::Receiver<BalanceUpdate>,
) {
    while let Some(update) = rx.recv().await {
        match notifier.notify(&update).await {
            Ok(()) => record_outcome(NOTIFICATION, true),
            Err(e) => {
                warn!(
                    merchant_id = %update.merchant_id,
                    error = %e,
                    "balance notification failed"
                );
                record_outcome(NOTIFICATION, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryAggregateStore;
    use crate::testing::{FailingAggregateStore, RecordingNotifier};
    use rust_decimal_macros::dec;

    fn pending(merchant: i64, amount: i64, id: i64) -> PendingUpdate {
        PendingUpdate {
            merchant_id: MerchantId(merchant),
            amount,
            currency: "NGN".to_string(),
            transaction_id: TransactionId(id),
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_effects() {
        let aggregate = Arc::new(MemoryAggregateStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::spawn(aggregate.clone(), notifier.clone(), 16);

        for id in 1..=10 {
            assert!(dispatcher.dispatch_pending(pending(1, 100, id)));
        }
        assert!(dispatcher.dispatch_notification(BalanceUpdate {
            merchant_id: MerchantId(1),
            currency: "NGN".to_string(),
            amount: dec!(1.00),
        }));
        dispatcher.shutdown().await;

        assert_eq!(aggregate.get_pending_amount(MerchantId(1)).await.unwrap(), 1000);
        assert_eq!(notifier.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let aggregate = Arc::new(MemoryAggregateStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        // The current-thread runtime cannot run the worker until this test
        // yields, so the single slot stays occupied.
        let dispatcher = Dispatcher::spawn(aggregate.clone(), notifier, 1);

        assert!(dispatcher.dispatch_pending(pending(1, 100, 1)));
        assert!(!dispatcher.dispatch_pending(pending(1, 200, 2)));
        dispatcher.shutdown().await;

        assert_eq!(aggregate.get_pending_amount(MerchantId(1)).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_worker_survives_store_errors() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::spawn(Arc::new(FailingAggregateStore), notifier.clone(), 8);

        assert!(dispatcher.dispatch_pending(pending(1, 100, 1)));
        assert!(dispatcher.dispatch_pending(pending(1, 100, 2)));
        assert!(dispatcher.dispatch_notification(BalanceUpdate {
            merchant_id: MerchantId(1),
            currency: "NGN".to_string(),
            amount: dec!(2.00),
        }));
        dispatcher.shutdown().await;

        assert_eq!(notifier.updates().len(), 1);
    }
}
