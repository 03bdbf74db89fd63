//! In-process [`LedgerStore`].
//!
//! Each merchant owns a book behind its own lock: the balance cell, the
//! append-only entry log and the merchant's transaction ids. Appending an
//! entry holds only that merchant's lock, so merchants proceed in parallel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::ledger::LedgerStore;
use crate::error::{Error, Result};
use crate::model::{EntryType, LedgerEntry, MerchantId, NewTransaction, Transaction, TransactionId};

#[derive(Debug, Default)]
struct MerchantBook {
    /// Authoritative running balance, minor units.
    balance: i64,
    entries: Vec<LedgerEntry>,
    /// Transactions that already have a ledger entry.
    entered: HashSet<TransactionId>,
    /// Creation order.
    transactions: Vec<TransactionId>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    next_transaction_id: AtomicI64,
    next_entry_id: AtomicI64,
    transactions: DashMap<TransactionId, Transaction>,
    references: DashMap<String, TransactionId>,
    books: DashMap<MerchantId, Arc<Mutex<MerchantBook>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the merchant's book handle so the map shard is released before
    /// the book itself is locked.
    fn book(&self, merchant: MerchantId) -> Arc<Mutex<MerchantBook>> {
        Arc::clone(self.books.entry(merchant).or_default().value())
    }

    fn existing_book(&self, merchant: MerchantId) -> Option<Arc<Mutex<MerchantBook>>> {
        self.books.get(&merchant).map(|book| Arc::clone(book.value()))
    }

    fn has_entry(&self, tx: &Transaction) -> bool {
        self.existing_book(tx.merchant_id)
            .is_some_and(|book| book.lock().entered.contains(&tx.id))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        let slot = match self.references.entry(new.reference.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateReference(new.reference)),
            Entry::Vacant(slot) => slot,
        };
        let id = TransactionId(self.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1);
        let transaction = new.into_transaction(id, Utc::now());

        let book = self.book(transaction.merchant_id);
        self.transactions.insert(id, transaction.clone());
        book.lock().transactions.push(id);
        slot.insert(id);
        Ok(transaction)
    }

    async fn append_credit(&self, transaction: &Transaction) -> Result<LedgerEntry> {
        let book = self.book(transaction.merchant_id);
        let mut book = book.lock();
        if book.entered.contains(&transaction.id) {
            return Err(Error::DuplicateLedgerEntry(transaction.id));
        }

        let amount = EntryType::Credit.signed(transaction.amount);
        let balance = book
            .balance
            .checked_add(amount)
            .ok_or(Error::BalanceOverflow(transaction.merchant_id))?;
        book.entered.insert(transaction.id);
        book.balance = balance;
        let entry = LedgerEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::SeqCst) + 1,
            merchant_id: transaction.merchant_id,
            transaction_id: transaction.id,
            entry_type: EntryType::Credit,
            amount,
            balance_after: book.balance,
            currency: transaction.currency.clone(),
            description: transaction.description.clone(),
            reference: transaction.reference.clone(),
            created_at: Utc::now(),
        };
        book.entries.push(entry.clone());
        Ok(entry)
    }

    async fn fetch_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let Some(id) = self.references.get(reference).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.transactions.get(&id).map(|tx| tx.clone()))
    }

    async fn list_by_merchant(
        &self,
        merchant: MerchantId,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let Some(book) = self.existing_book(merchant) else {
            return Ok(Vec::new());
        };
        let ids: Vec<_> = book.lock().transactions.iter().rev().take(limit).copied().collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.transactions.get(&id).map(|tx| tx.clone()))
            .collect())
    }

    async fn list_by_status(&self, status: &str, limit: usize) -> Result<Vec<Transaction>> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.status.as_str() == status)
            .map(|tx| tx.value().clone())
            .collect();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn ledger_entries(&self, merchant: MerchantId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .existing_book(merchant)
            .map(|book| book.lock().entries.clone())
            .unwrap_or_default())
    }

    async fn balance(&self, merchant: MerchantId) -> Result<i64> {
        Ok(self
            .existing_book(merchant)
            .map(|book| book.lock().balance)
            .unwrap_or(0))
    }

    async fn merchants(&self) -> Result<Vec<MerchantId>> {
        let mut merchants: Vec<_> = self.books.iter().map(|book| *book.key()).collect();
        merchants.sort();
        Ok(merchants)
    }

    async fn transactions_without_entry(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let mut candidates: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.created_at < created_before)
            .map(|tx| tx.value().clone())
            .collect();
        candidates.retain(|tx| !self.has_entry(tx));
        candidates.sort_by_key(|tx| tx.id);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn unsettled_transactions(
        &self,
        merchant: MerchantId,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let Some(book) = self.existing_book(merchant) else {
            return Ok(Vec::new());
        };
        let ids = book.lock().transactions.clone();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.transactions.get(&id).map(|tx| tx.clone()))
            .filter(|tx| {
                tx.settled_at.is_none()
                    && tx.created_at < created_before
                    && tx.is_settlement_eligible()
            })
            .collect())
    }

    async fn mark_settled(&self, merchant: MerchantId, ids: &[TransactionId]) -> Result<usize> {
        let now = Utc::now();
        let mut changed = 0;
        for id in ids {
            if let Some(mut tx) = self.transactions.get_mut(id) {
                if tx.merchant_id == merchant && tx.settled_at.is_none() {
                    tx.settled_at = Some(now);
                    tx.updated_at = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ledger::conformance;
    use super::*;

    #[tokio::test]
    async fn test_record_assigns_identity_and_running_balance() {
        conformance::record_assigns_identity_and_running_balance(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_merchants_have_independent_balances() {
        conformance::merchants_have_independent_balances(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_duplicate_reference_is_rejected() {
        conformance::duplicate_reference_is_rejected(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_second_append_is_rejected() {
        conformance::second_append_for_same_transaction_is_rejected(&MemoryLedgerStore::new())
            .await;
    }

    #[tokio::test]
    async fn test_fetch_and_list() {
        conformance::fetch_and_list(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_missing_entries_are_found_and_repaired() {
        conformance::missing_entries_are_found_and_repaired(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_unsettled_excludes_payouts_and_settled() {
        conformance::unsettled_excludes_payouts_and_settled(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_by_status() {
        conformance::list_by_status_spans_merchants(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_overflowing_credit_is_not_applied() {
        conformance::overflowing_credit_is_not_applied(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_form_running_sum() {
        conformance::concurrent_creates_form_running_sum(Arc::new(MemoryLedgerStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_merchants_do_not_share_balance_cells() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut handles = Vec::new();
        for merchant in 1..=8 {
            for _ in 0..25 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store
                        .record_transaction(NewTransaction::new(MerchantId(merchant), merchant, "NGN"))
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for merchant in 1..=8 {
            assert_eq!(store.balance(MerchantId(merchant)).await.unwrap(), 25 * merchant);
        }
    }
}
