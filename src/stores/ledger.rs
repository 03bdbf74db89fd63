//! The Ledger Store contract.
//!
//! The ledger owns the authoritative running balance of every merchant. The
//! balance lives in a dedicated per-merchant cell that is incremented
//! atomically together with the append of its ledger entry, so
//! `balance_after` is never derived from a read that may already be stale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::Result;
use crate::model::{LedgerEntry, MerchantId, NewTransaction, Transaction, TransactionId};

/// Result of [`LedgerStore::record_transaction`].
///
/// `entry` is `None` when the transaction row was written but its ledger entry
/// was not. The transaction still exists; reconciliation appends the entry later.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub transaction: Transaction,
    pub entry: Option<LedgerEntry>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Writes the transaction row and assigns its id and timestamps.
    /// Fails with `DuplicateReference` if the reference is taken.
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction>;

    /// Increments the merchant's balance cell by the transaction amount and
    /// appends the matching credit entry, as one unit.
    /// Fails with `DuplicateLedgerEntry` if the transaction already has an entry.
    async fn append_credit(&self, transaction: &Transaction) -> Result<LedgerEntry>;

    async fn fetch_by_reference(&self, reference: &str) -> Result<Option<Transaction>>;

    /// Newest first.
    async fn list_by_merchant(&self, merchant: MerchantId, limit: usize)
        -> Result<Vec<Transaction>>;

    /// Transactions of every merchant carrying `status`, newest first.
    async fn list_by_status(&self, status: &str, limit: usize) -> Result<Vec<Transaction>>;

    /// Creation order.
    async fn ledger_entries(&self, merchant: MerchantId) -> Result<Vec<LedgerEntry>>;

    /// Current value of the merchant's balance cell, 0 if it has none.
    async fn balance(&self, merchant: MerchantId) -> Result<i64>;

    /// Merchants that own at least one transaction, ascending.
    async fn merchants(&self) -> Result<Vec<MerchantId>>;

    /// Transactions created before `created_before` whose ledger entry is
    /// missing, oldest first.
    async fn transactions_without_entry(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// The merchant's settlement-eligible transactions created before
    /// `created_before` that have not been marked settled, oldest first.
    async fn unsettled_transactions(
        &self,
        merchant: MerchantId,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;

    /// Stamps `settled_at` on the given transactions of `merchant`.
    /// Returns how many rows changed.
    async fn mark_settled(&self, merchant: MerchantId, ids: &[TransactionId]) -> Result<usize>;

    /// Writes the transaction and its credit entry.
    ///
    /// A failed transaction write aborts the call. A failed ledger append is
    /// logged and reported as `entry: None`: the transaction exists and the
    /// missing entry is picked up by reconciliation.
    async fn record_transaction(&self, new: NewTransaction) -> Result<Recorded> {
        let transaction = self.insert_transaction(new).await?;
        let entry = match self.append_credit(&transaction).await {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!(
                    merchant_id = %transaction.merchant_id,
                    transaction_id = %transaction.id,
                    error = %err,
                    "ledger entry write failed, balance needs reconciliation"
                );
                metrics::counter!("ledger_entry_failures_total", 1);
                None
            }
        };
        Ok(Recorded { transaction, entry })
    }
}

/// Behaviour every [`LedgerStore`] implementation must show. Each backend's
/// test module runs these against a fresh store.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::error::Error;
    use crate::model::{EntryType, TransactionStatus, PAYOUT};
    use std::sync::Arc;

    fn credit(merchant: i64, amount: i64) -> NewTransaction {
        NewTransaction::new(MerchantId(merchant), amount, "NGN")
    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(1)
    }

    pub async fn record_assigns_identity_and_running_balance(store: &dyn LedgerStore) {
        let first = store.record_transaction(credit(1, 15000)).await.unwrap();
        let second = store.record_transaction(credit(1, 5000)).await.unwrap();

        assert_ne!(first.transaction.id, second.transaction.id);
        assert_eq!(first.transaction.created_at, first.transaction.updated_at);

        let first_entry = first.entry.unwrap();
        assert_eq!(first_entry.entry_type, EntryType::Credit);
        assert_eq!(first_entry.amount, 15000);
        assert_eq!(first_entry.balance_after, 15000);
        assert_eq!(first_entry.transaction_id, first.transaction.id);
        assert_eq!(first_entry.reference, first.transaction.reference);
        assert_eq!(second.entry.unwrap().balance_after, 20000);
        assert_eq!(store.balance(MerchantId(1)).await.unwrap(), 20000);
    }

    pub async fn merchants_have_independent_balances(store: &dyn LedgerStore) {
        store.record_transaction(credit(1, 100)).await.unwrap();
        store.record_transaction(credit(2, 700)).await.unwrap();
        store.record_transaction(credit(1, 300)).await.unwrap();

        assert_eq!(store.balance(MerchantId(1)).await.unwrap(), 400);
        assert_eq!(store.balance(MerchantId(2)).await.unwrap(), 700);
        assert_eq!(store.balance(MerchantId(3)).await.unwrap(), 0);
        assert_eq!(
            store.merchants().await.unwrap(),
            vec![MerchantId(1), MerchantId(2)]
        );
    }

    pub async fn duplicate_reference_is_rejected(store: &dyn LedgerStore) {
        let mut new = credit(1, 100);
        new.reference = "ref-dup".to_string();
        store.record_transaction(new.clone()).await.unwrap();

        let err = store.record_transaction(new).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateReference(r) if r == "ref-dup"));
        assert_eq!(store.balance(MerchantId(1)).await.unwrap(), 100);
    }

    pub async fn second_append_for_same_transaction_is_rejected(store: &dyn LedgerStore) {
        let recorded = store.record_transaction(credit(1, 250)).await.unwrap();

        let err = store.append_credit(&recorded.transaction).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateLedgerEntry(id) if id == recorded.transaction.id));
        assert_eq!(store.balance(MerchantId(1)).await.unwrap(), 250);
        assert_eq!(store.ledger_entries(MerchantId(1)).await.unwrap().len(), 1);
    }

    pub async fn fetch_and_list(store: &dyn LedgerStore) {
        let mut ids = Vec::new();
        for amount in [100, 200, 300] {
            ids.push(store.record_transaction(credit(5, amount)).await.unwrap().transaction);
        }
        store.record_transaction(credit(6, 999)).await.unwrap();

        let fetched = store
            .fetch_by_reference(&ids[1].reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, ids[1]);
        assert!(store.fetch_by_reference("missing").await.unwrap().is_none());

        let listed = store.list_by_merchant(MerchantId(5), 2).await.unwrap();
        assert_eq!(
            listed.iter().map(|t| t.amount).collect::<Vec<_>>(),
            vec![300, 200]
        );
        assert!(store.list_by_merchant(MerchantId(7), 10).await.unwrap().is_empty());
    }

    pub async fn missing_entries_are_found_and_repaired(store: &dyn LedgerStore) {
        let orphan = store.insert_transaction(credit(1, 400)).await.unwrap();
        store.record_transaction(credit(1, 100)).await.unwrap();

        let missing = store.transactions_without_entry(soon(), 10).await.unwrap();
        assert_eq!(missing, vec![orphan.clone()]);
        // Too young to be considered missing.
        let before = orphan.created_at;
        assert!(store.transactions_without_entry(before, 10).await.unwrap().is_empty());

        let entry = store.append_credit(&orphan).await.unwrap();
        assert_eq!(entry.balance_after, 500);
        assert!(store.transactions_without_entry(soon(), 10).await.unwrap().is_empty());
    }

    pub async fn list_by_status_spans_merchants(store: &dyn LedgerStore) {
        let mut payouts = Vec::new();
        for merchant in [1, 2, 1] {
            let mut payout = credit(merchant, 100 * merchant);
            payout.status = TransactionStatus::Payout;
            payouts.push(store.record_transaction(payout).await.unwrap().transaction);
        }
        store.record_transaction(credit(1, 5)).await.unwrap();
        let mut review = credit(3, 7);
        review.status = TransactionStatus::Other("pending_review".to_string());
        store.record_transaction(review).await.unwrap();

        let listed = store.list_by_status(PAYOUT, 10).await.unwrap();
        assert_eq!(
            listed.iter().map(|t| t.id).collect::<Vec<_>>(),
            payouts.iter().rev().map(|t| t.id).collect::<Vec<_>>()
        );
        assert_eq!(store.list_by_status(PAYOUT, 2).await.unwrap().len(), 2);
        assert_eq!(store.list_by_status("success", 10).await.unwrap().len(), 1);
        assert_eq!(
            store.list_by_status("pending_review", 10).await.unwrap()[0].merchant_id,
            MerchantId(3)
        );
        assert!(store.list_by_status("refunded", 10).await.unwrap().is_empty());
    }

    /// A credit that would overflow the balance cell is refused without
    /// touching the balance, and the transaction stays eligible for repair.
    pub async fn overflowing_credit_is_not_applied(store: &dyn LedgerStore) {
        const BIG: i64 = 5_000_000_000_000_000_000;
        store.record_transaction(credit(1, BIG)).await.unwrap();
        let second = store.record_transaction(credit(1, BIG)).await.unwrap();

        assert!(second.entry.is_none());
        assert_eq!(store.balance(MerchantId(1)).await.unwrap(), BIG);
        assert_eq!(store.ledger_entries(MerchantId(1)).await.unwrap().len(), 1);

        let err = store.append_credit(&second.transaction).await.unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow(m) if m == MerchantId(1)));
        assert_eq!(
            store.transactions_without_entry(soon(), 10).await.unwrap(),
            vec![second.transaction]
        );
        // Other merchants are unaffected.
        let other = store.record_transaction(credit(2, BIG)).await.unwrap();
        assert_eq!(other.entry.unwrap().balance_after, BIG);
    }

    pub async fn unsettled_excludes_payouts_and_settled(store: &dyn LedgerStore) {
        let a = store.record_transaction(credit(1, 100)).await.unwrap().transaction;
        let b = store.record_transaction(credit(1, 200)).await.unwrap().transaction;
        let mut payout = credit(1, 300);
        payout.status = TransactionStatus::Payout;
        store.record_transaction(payout).await.unwrap();
        let mut payout_method = credit(1, 400);
        payout_method.payment_method = PAYOUT.to_string();
        store.record_transaction(payout_method).await.unwrap();

        store.record_transaction(credit(2, 500)).await.unwrap();

        let cutoff = soon();
        let unsettled = store.unsettled_transactions(MerchantId(1), cutoff).await.unwrap();
        assert_eq!(unsettled.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        // Another merchant's id is ignored.
        assert_eq!(store.mark_settled(MerchantId(2), &[a.id]).await.unwrap(), 0);
        assert_eq!(store.mark_settled(MerchantId(1), &[a.id]).await.unwrap(), 1);
        assert_eq!(store.mark_settled(MerchantId(1), &[a.id]).await.unwrap(), 0);

        let unsettled = store.unsettled_transactions(MerchantId(1), cutoff).await.unwrap();
        assert_eq!(unsettled.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b.id]);
        assert_eq!(store.unsettled_transactions(MerchantId(2), cutoff).await.unwrap().len(), 1);

        let past = a.created_at - chrono::Duration::seconds(1);
        assert!(store.unsettled_transactions(MerchantId(1), past).await.unwrap().is_empty());
    }

    /// N concurrent creates for one merchant: no lost or duplicated increments,
    /// and `balance_after` forms a running sum in creation order.
    pub async fn concurrent_creates_form_running_sum(store: Arc<dyn LedgerStore>) {
        const N: i64 = 64;
        let mut handles = Vec::new();
        for i in 1..=N {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.record_transaction(credit(9, i)).await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().entry.is_some());
        }

        let entries = store.ledger_entries(MerchantId(9)).await.unwrap();
        assert_eq!(entries.len() as i64, N);
        let mut running = 0;
        for entry in &entries {
            running += entry.amount;
            assert_eq!(entry.balance_after, running);
        }
        assert_eq!(running, N * (N + 1) / 2);
        assert_eq!(store.balance(MerchantId(9)).await.unwrap(), running);
    }
}
