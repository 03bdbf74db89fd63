//! The Settlement Aggregator's store: per-merchant pending settlement state.
//!
//! Every merchant's state is a single document holding the three facets the
//! settlement consumer reads (pending marker, unsettled amount, included
//! transaction ids). Adds and clears for a merchant go through that merchant's
//! map entry lock, so a document is never observed half-updated and an add
//! racing a clear lands either in the cleared snapshot or in a fresh document.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{MerchantId, TransactionId};

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Key names of the external settlement keyspace. Consumers depend on these.
pub mod keys {
    use crate::model::MerchantId;

    pub const PENDING_MERCHANTS: &str = "settlements:merchants:pending";

    pub fn amount(merchant: MerchantId) -> String {
        format!("settlements:amounts:{merchant}")
    }

    pub fn transactions(merchant: MerchantId) -> String {
        format!("settlements:txns:{merchant}")
    }
}

/// Value of one key in [`MemoryAggregateStore::keyspace_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Counter(i64),
    Set(BTreeSet<String>),
}

/// What a clear took out of the aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    pub merchant_id: MerchantId,
    /// Minor units.
    pub amount: i64,
    pub currency: Option<String>,
    pub transaction_ids: BTreeSet<TransactionId>,
    /// Number of adds applied to the document.
    pub version: u64,
}

impl PendingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.transaction_ids.is_empty()
    }
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Marks the merchant pending, adds `amount` to its counter and records
    /// `transaction`, as one unit, refreshing the TTL.
    ///
    /// Returns `false` (and changes nothing but the TTL) when the transaction
    /// is already included.
    async fn add_to_pending(
        &self,
        merchant: MerchantId,
        amount: i64,
        currency: &str,
        transaction: TransactionId,
    ) -> Result<bool>;

    /// Merchants with a nonzero pending amount, ascending.
    async fn list_pending_merchants(&self) -> Result<Vec<MerchantId>>;

    /// 0 when the merchant has no pending state.
    async fn get_pending_amount(&self, merchant: MerchantId) -> Result<i64>;

    async fn pending_transactions(&self, merchant: MerchantId) -> Result<BTreeSet<TransactionId>>;

    /// Atomically removes and returns the merchant's pending state.
    async fn clear_pending(&self, merchant: MerchantId) -> Result<PendingSnapshot>;

    /// Drops documents whose TTL ran out. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug)]
struct PendingDocument {
    amount: i64,
    currency: String,
    transaction_ids: BTreeSet<TransactionId>,
    version: u64,
    expires_at: Instant,
}

impl PendingDocument {
    fn new(currency: &str, expires_at: Instant) -> Self {
        Self {
            amount: 0,
            currency: currency.to_string(),
            transaction_ids: BTreeSet::new(),
            version: 0,
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn into_snapshot(self, merchant_id: MerchantId) -> PendingSnapshot {
        PendingSnapshot {
            merchant_id,
            amount: self.amount,
            currency: Some(self.currency),
            transaction_ids: self.transaction_ids,
            version: self.version,
        }
    }
}

pub struct MemoryAggregateStore {
    ttl: Duration,
    documents: DashMap<MerchantId, PendingDocument>,
}

impl Default for MemoryAggregateStore {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}

impl MemoryAggregateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            documents: DashMap::new(),
        }
    }

    /// Renders the live state under the external key names.
    pub fn keyspace_snapshot(&self) -> BTreeMap<String, KeyValue> {
        let now = Instant::now();
        let mut keyspace = BTreeMap::new();
        let mut pending = BTreeSet::new();
        for doc in self.documents.iter() {
            if doc.is_expired(now) {
                continue;
            }
            let merchant = *doc.key();
            if doc.amount != 0 {
                pending.insert(merchant.to_string());
            }
            keyspace.insert(keys::amount(merchant), KeyValue::Counter(doc.amount));
            keyspace.insert(
                keys::transactions(merchant),
                KeyValue::Set(doc.transaction_ids.iter().map(|id| id.to_string()).collect()),
            );
        }
        if !pending.is_empty() {
            keyspace.insert(keys::PENDING_MERCHANTS.to_string(), KeyValue::Set(pending));
        }
        keyspace
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn add_to_pending(
        &self,
        merchant: MerchantId,
        amount: i64,
        currency: &str,
        transaction: TransactionId,
    ) -> Result<bool> {
        if amount <= 0 {
            return Err(Error::Aggregate {
                merchant,
                reason: format!("refusing non-positive amount {amount} for transaction {transaction}"),
            });
        }

        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut doc = self
            .documents
            .entry(merchant)
            .or_insert_with(|| PendingDocument::new(currency, expires_at));
        if doc.is_expired(now) {
            *doc = PendingDocument::new(currency, expires_at);
        }
        doc.expires_at = expires_at;

        if doc.transaction_ids.contains(&transaction) {
            return Ok(false);
        }
        let pending = doc.amount.checked_add(amount).ok_or_else(|| Error::Aggregate {
            merchant,
            reason: format!("pending amount overflow adding transaction {transaction}"),
        })?;
        // Id and amount go in together or not at all.
        doc.transaction_ids.insert(transaction);
        doc.amount = pending;
        doc.version += 1;
        if doc.currency != currency {
            warn!(
                merchant_id = %merchant,
                pending_currency = %doc.currency,
                currency,
                "mixed currencies in one pending settlement"
            );
        }
        Ok(true)
    }

    async fn list_pending_merchants(&self) -> Result<Vec<MerchantId>> {
        let now = Instant::now();
        let mut merchants: Vec<_> = self
            .documents
            .iter()
            .filter(|doc| !doc.is_expired(now) && doc.amount != 0)
            .map(|doc| *doc.key())
            .collect();
        merchants.sort();
        Ok(merchants)
    }

    async fn get_pending_amount(&self, merchant: MerchantId) -> Result<i64> {
        let now = Instant::now();
        Ok(self
            .documents
            .get(&merchant)
            .filter(|doc| !doc.is_expired(now))
            .map(|doc| doc.amount)
            .unwrap_or(0))
    }

    async fn pending_transactions(&self, merchant: MerchantId) -> Result<BTreeSet<TransactionId>> {
        let now = Instant::now();
        Ok(self
            .documents
            .get(&merchant)
            .filter(|doc| !doc.is_expired(now))
            .map(|doc| doc.transaction_ids.clone())
            .unwrap_or_default())
    }

    async fn clear_pending(&self, merchant: MerchantId) -> Result<PendingSnapshot> {
        let now = Instant::now();
        Ok(match self.documents.remove(&merchant) {
            Some((_, doc)) if !doc.is_expired(now) => doc.into_snapshot(merchant),
            _ => PendingSnapshot {
                merchant_id: merchant,
                ..PendingSnapshot::default()
            },
        })
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .documents
            .iter()
            .filter(|doc| doc.is_expired(now))
            .map(|doc| *doc.key())
            .collect();
        Ok(expired
            .into_iter()
            .filter(|merchant| {
                self.documents
                    .remove_if(merchant, |_, doc| doc.is_expired(now))
                    .is_some()
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const M1: MerchantId = MerchantId(1);

    #[tokio::test]
    async fn test_pending_amount_is_sum_of_adds() {
        let store = MemoryAggregateStore::default();
        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 0);

        assert!(store.add_to_pending(M1, 15000, "NGN", TransactionId(1)).await.unwrap());
        assert!(store.add_to_pending(M1, 5000, "NGN", TransactionId(2)).await.unwrap());

        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 20000);
        assert_eq!(
            store.pending_transactions(M1).await.unwrap(),
            BTreeSet::from([TransactionId(1), TransactionId(2)])
        );
        assert_eq!(store.list_pending_merchants().await.unwrap(), vec![M1]);
    }

    #[tokio::test]
    async fn test_repeated_transaction_is_counted_once() {
        let store = MemoryAggregateStore::default();
        assert!(store.add_to_pending(M1, 700, "NGN", TransactionId(3)).await.unwrap());
        assert!(!store.add_to_pending(M1, 700, "NGN", TransactionId(3)).await.unwrap());

        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 700);
        assert_eq!(store.pending_transactions(M1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_rejected() {
        let store = MemoryAggregateStore::default();
        let err = store.add_to_pending(M1, 0, "NGN", TransactionId(1)).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { merchant, .. } if merchant == M1));
        assert!(store.pending_transactions(M1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_returns_state_and_resets() {
        let store = MemoryAggregateStore::default();
        store.add_to_pending(M1, 15000, "NGN", TransactionId(1)).await.unwrap();
        store.add_to_pending(MerchantId(2), 10, "USD", TransactionId(2)).await.unwrap();

        let snapshot = store.clear_pending(M1).await.unwrap();
        assert_eq!(snapshot.amount, 15000);
        assert_eq!(snapshot.currency.as_deref(), Some("NGN"));
        assert_eq!(snapshot.transaction_ids, BTreeSet::from([TransactionId(1)]));
        assert_eq!(snapshot.version, 1);

        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 0);
        assert_eq!(store.list_pending_merchants().await.unwrap(), vec![MerchantId(2)]);

        let again = store.clear_pending(M1).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.amount, 0);
    }

    #[tokio::test]
    async fn test_expired_state_reads_as_absent() {
        let store = MemoryAggregateStore::new(Duration::ZERO);
        store.add_to_pending(M1, 100, "NGN", TransactionId(1)).await.unwrap();

        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 0);
        assert!(store.list_pending_merchants().await.unwrap().is_empty());
        assert!(store.keyspace_snapshot().is_empty());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflowing_add_changes_nothing() {
        let store = MemoryAggregateStore::default();
        store.add_to_pending(M1, i64::MAX - 10, "NGN", TransactionId(1)).await.unwrap();

        let err = store.add_to_pending(M1, 100, "NGN", TransactionId(2)).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { merchant, .. } if merchant == M1));
        assert_eq!(store.get_pending_amount(M1).await.unwrap(), i64::MAX - 10);
        assert_eq!(
            store.pending_transactions(M1).await.unwrap(),
            BTreeSet::from([TransactionId(1)])
        );

        // A later add that fits still lands.
        assert!(store.add_to_pending(M1, 10, "NGN", TransactionId(3)).await.unwrap());
        let snapshot = store.clear_pending(M1).await.unwrap();
        assert_eq!(snapshot.amount, i64::MAX);
        assert_eq!(snapshot.transaction_ids, BTreeSet::from([TransactionId(1), TransactionId(3)]));
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_every_add_refreshes_ttl() {
        let store = MemoryAggregateStore::new(Duration::from_millis(400));
        store.add_to_pending(M1, 100, "NGN", TransactionId(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        store.add_to_pending(M1, 50, "NGN", TransactionId(2)).await.unwrap();

        // Past the first add's expiry, inside the second's.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 150);
        assert_eq!(store.list_pending_merchants().await.unwrap(), vec![M1]);
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        // A repeated id refreshes the TTL too.
        assert!(!store.add_to_pending(M1, 50, "NGN", TransactionId(2)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.get_pending_amount(M1).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_keyspace_uses_stable_names() {
        let store = MemoryAggregateStore::default();
        store.add_to_pending(M1, 15000, "NGN", TransactionId(10)).await.unwrap();
        store.add_to_pending(M1, 5000, "NGN", TransactionId(11)).await.unwrap();

        let keyspace = store.keyspace_snapshot();
        assert_eq!(
            keyspace.get("settlements:merchants:pending"),
            Some(&KeyValue::Set(BTreeSet::from(["1".to_string()])))
        );
        assert_eq!(keyspace.get("settlements:amounts:1"), Some(&KeyValue::Counter(20000)));
        assert_eq!(
            keyspace.get("settlements:txns:1"),
            Some(&KeyValue::Set(BTreeSet::from(["10".to_string(), "11".to_string()])))
        );
    }

    /// Adds racing clears: every transaction ends up in exactly one cleared
    /// snapshot or in the final pending state, and amounts agree with ids.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adds_racing_clears_are_never_lost() {
        const N: i64 = 2000;
        let store = Arc::new(MemoryAggregateStore::default());

        let adder = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 1..=N {
                    store.add_to_pending(M1, i, "NGN", TransactionId(i)).await.unwrap();
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let clearer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut snapshots = Vec::new();
                for _ in 0..200 {
                    snapshots.push(store.clear_pending(M1).await.unwrap());
                    tokio::task::yield_now().await;
                }
                snapshots
            })
        };

        adder.await.unwrap();
        let mut snapshots = clearer.await.unwrap();
        snapshots.push(store.clear_pending(M1).await.unwrap());

        let mut seen = BTreeSet::new();
        let mut total = 0;
        for snapshot in snapshots {
            let ids_sum: i64 = snapshot.transaction_ids.iter().map(|id| id.0).sum();
            assert_eq!(snapshot.amount, ids_sum);
            for id in snapshot.transaction_ids {
                assert!(seen.insert(id), "transaction {id} settled twice");
            }
            total += snapshot.amount;
        }
        assert_eq!(seen.len() as i64, N);
        assert_eq!(total, N * (N + 1) / 2);
    }
}
