//! Collaborator doubles shared by the test modules.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::model::{MerchantId, TransactionId};
use crate::notify::{BalanceNotifier, BalanceUpdate};
use crate::stores::{AggregateStore, PendingSnapshot};

#[derive(Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<BalanceUpdate>>,
}

impl RecordingNotifier {
    pub fn updates(&self) -> Vec<BalanceUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl BalanceNotifier for RecordingNotifier {
    async fn notify(&self, update: &BalanceUpdate) -> Result<()> {
        self.updates.lock().push(update.clone());
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl BalanceNotifier for FailingNotifier {
    async fn notify(&self, _update: &BalanceUpdate) -> Result<()> {
        Err(Error::NotificationRejected {
            status: 503,
            body: "unavailable".to_string(),
        })
    }
}

/// An aggregate store that is permanently unreachable.
pub struct FailingAggregateStore;

fn unreachable_store(merchant: MerchantId) -> Error {
    Error::Aggregate {
        merchant,
        reason: "store unreachable".to_string(),
    }
}

#[async_trait]
impl AggregateStore for FailingAggregateStore {
    async fn add_to_pending(
        &self,
        merchant: MerchantId,
        _amount: i64,
        _currency: &str,
        _transaction: TransactionId,
    ) -> Result<bool> {
        Err(unreachable_store(merchant))
    }

    async fn list_pending_merchants(&self) -> Result<Vec<MerchantId>> {
        Err(unreachable_store(MerchantId::default()))
    }

    async fn get_pending_amount(&self, merchant: MerchantId) -> Result<i64> {
        Err(unreachable_store(merchant))
    }

    async fn pending_transactions(&self, merchant: MerchantId) -> Result<BTreeSet<TransactionId>> {
        Err(unreachable_store(merchant))
    }

    async fn clear_pending(&self, merchant: MerchantId) -> Result<PendingSnapshot> {
        Err(unreachable_store(merchant))
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
