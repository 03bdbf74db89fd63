//! SQLite-backed [`LedgerStore`].
//!
//! The merchant balance is a row in `merchant_balances`, bumped with a single
//! `INSERT .. ON CONFLICT DO UPDATE .. RETURNING` inside the same SQL
//! transaction that inserts the ledger entry. `ledger_entries.transaction_id`
//! is unique, so a repeated append rolls back without touching the balance.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::ledger::LedgerStore;
use crate::error::{Error, Result};
use crate::model::{
    EntryType, LedgerEntry, MerchantId, NewTransaction, Transaction, TransactionId, PAYOUT,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference TEXT NOT NULL UNIQUE,
    merchant_id INTEGER NOT NULL,
    customer_id INTEGER,
    customer_email TEXT,
    customer_name TEXT,
    amount INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    payment_method TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    settled_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_transactions_merchant ON transactions(merchant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_transactions_unsettled ON transactions(merchant_id, settled_at);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status, created_at DESC);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    merchant_id INTEGER NOT NULL,
    transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id),
    entry_type TEXT NOT NULL CHECK (entry_type IN ('credit', 'debit')),
    amount INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    currency TEXT NOT NULL,
    description TEXT,
    reference TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_merchant ON ledger_entries(merchant_id, id);

CREATE TABLE IF NOT EXISTS merchant_balances (
    merchant_id INTEGER PRIMARY KEY,
    balance INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const TRANSACTION_COLUMNS: &str = "t.id, t.reference, t.merchant_id, t.customer_id, \
     t.customer_email, t.customer_name, t.amount, t.currency, t.status, t.payment_method, \
     t.description, t.created_at, t.updated_at, t.settled_at";

const ENTRY_COLUMNS: &str = "id, merchant_id, transaction_id, entry_type, amount, \
     balance_after, currency, description, reference, created_at";

#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "opened ledger database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Drops the entry table so every append fails until
    /// [`Self::restore_ledger_for_tests`] recreates it.
    #[cfg(test)]
    pub(crate) async fn break_ledger_for_tests(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE ledger_entries").unwrap();
    }

    #[cfg(test)]
    pub(crate) async fn restore_ledger_for_tests(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA).unwrap();
    }
}

/// Fixed-width UTC timestamps so that text order equals time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let status: String = row.get(8)?;
    Ok(Transaction {
        id: TransactionId(row.get(0)?),
        reference: row.get(1)?,
        merchant_id: MerchantId(row.get(2)?),
        customer_id: row.get(3)?,
        customer_email: row.get(4)?,
        customer_name: row.get(5)?,
        amount: row.get(6)?,
        currency: row.get(7)?,
        status: status.into(),
        payment_method: row.get(9)?,
        description: row.get(10)?,
        created_at: parse_timestamp(11, row.get(11)?)?,
        updated_at: parse_timestamp(12, row.get(12)?)?,
        settled_at: row
            .get::<_, Option<String>>(13)?
            .map(|value| parse_timestamp(13, value))
            .transpose()?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let entry_type: String = row.get(3)?;
    let entry_type = EntryType::parse(&entry_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            Box::new(Error::CorruptRow(format!("unknown entry type {entry_type:?}"))),
        )
    })?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        merchant_id: MerchantId(row.get(1)?),
        transaction_id: TransactionId(row.get(2)?),
        entry_type,
        amount: row.get(4)?,
        balance_after: row.get(5)?,
        currency: row.get(6)?,
        description: row.get(7)?,
        reference: row.get(8)?,
        created_at: parse_timestamp(9, row.get(9)?)?,
    })
}

fn insert_transaction(conn: &Connection, new: NewTransaction) -> Result<Transaction> {
    let now = Utc::now().trunc_subsecs(6);
    let inserted = conn.execute(
        "INSERT INTO transactions (reference, merchant_id, customer_id, customer_email,
             customer_name, amount, currency, status, payment_method, description,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            new.reference,
            new.merchant_id.0,
            new.customer_id,
            new.customer_email,
            new.customer_name,
            new.amount,
            new.currency,
            new.status.as_str(),
            new.payment_method,
            new.description,
            timestamp(now),
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => return Err(Error::DuplicateReference(new.reference)),
        Err(err) => return Err(err.into()),
    }
    let id = TransactionId(conn.last_insert_rowid());
    Ok(new.into_transaction(id, now))
}

fn append_credit(conn: &mut Connection, transaction: &Transaction) -> Result<LedgerEntry> {
    let now = Utc::now().trunc_subsecs(6);
    let amount = EntryType::Credit.signed(transaction.amount);

    let sql = conn.transaction()?;
    let incremented = sql.query_row(
        "INSERT INTO merchant_balances (merchant_id, balance, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(merchant_id) DO UPDATE
             SET balance = balance + excluded.balance, updated_at = excluded.updated_at
         RETURNING balance",
        params![transaction.merchant_id.0, amount, timestamp(now)],
        |row| row.get::<_, i64>(0),
    );
    let balance_after = match incremented {
        Ok(balance) => balance,
        // SQLite turns an overflowing integer sum into a REAL.
        Err(rusqlite::Error::InvalidColumnType(_, _, Type::Real)) => {
            return Err(Error::BalanceOverflow(transaction.merchant_id))
        }
        Err(err) => return Err(err.into()),
    };
    let inserted = sql.execute(
        "INSERT INTO ledger_entries (merchant_id, transaction_id, entry_type, amount,
             balance_after, currency, description, reference, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            transaction.merchant_id.0,
            transaction.id.0,
            EntryType::Credit.as_str(),
            amount,
            balance_after,
            transaction.currency,
            transaction.description,
            transaction.reference,
            timestamp(now),
        ],
    );
    match inserted {
        Ok(_) => {}
        // Dropping `sql` rolls the balance increment back.
        Err(err) if is_unique_violation(&err) => {
            return Err(Error::DuplicateLedgerEntry(transaction.id))
        }
        Err(err) => return Err(err.into()),
    }
    let id = sql.last_insert_rowid();
    sql.commit()?;

    Ok(LedgerEntry {
        id,
        merchant_id: transaction.merchant_id,
        transaction_id: transaction.id,
        entry_type: EntryType::Credit,
        amount,
        balance_after,
        currency: transaction.currency.clone(),
        description: transaction.description.clone(),
        reference: transaction.reference.clone(),
        created_at: now,
    })
}

fn mark_settled(conn: &mut Connection, merchant: MerchantId, ids: &[TransactionId]) -> Result<usize> {
    let now = timestamp(Utc::now().trunc_subsecs(6));
    let sql = conn.transaction()?;
    let mut changed = 0;
    {
        let mut stmt = sql.prepare_cached(
            "UPDATE transactions SET settled_at = ?1, updated_at = ?1
             WHERE id = ?2 AND merchant_id = ?3 AND settled_at IS NULL",
        )?;
        for id in ids {
            changed += stmt.execute(params![now, id.0, merchant.0])?;
        }
    }
    sql.commit()?;
    Ok(changed)
}

fn query_transactions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, transaction_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        let conn = self.conn.lock().await;
        insert_transaction(&conn, new)
    }

    async fn append_credit(&self, transaction: &Transaction) -> Result<LedgerEntry> {
        let mut conn = self.conn.lock().await;
        append_credit(&mut conn, transaction)
    }

    async fn fetch_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.reference = ?1");
        Ok(conn
            .query_row(&sql, params![reference], transaction_from_row)
            .optional()?)
    }

    async fn list_by_merchant(
        &self,
        merchant: MerchantId,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t
             WHERE t.merchant_id = ?1 ORDER BY t.created_at DESC, t.id DESC LIMIT ?2"
        );
        query_transactions(&conn, &sql, params![merchant.0, limit as i64])
    }

    async fn list_by_status(&self, status: &str, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t
             WHERE t.status = ?1 ORDER BY t.created_at DESC, t.id DESC LIMIT ?2"
        );
        query_transactions(&conn, &sql, params![status, limit as i64])
    }

    async fn ledger_entries(&self, merchant: MerchantId) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE merchant_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![merchant.0], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn balance(&self, merchant: MerchantId) -> Result<i64> {
        let conn = self.conn.lock().await;
        let balance = conn
            .query_row(
                "SELECT balance FROM merchant_balances WHERE merchant_id = ?1",
                params![merchant.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    async fn merchants(&self) -> Result<Vec<MerchantId>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT merchant_id FROM transactions ORDER BY merchant_id")?;
        let rows = stmt.query_map([], |row| row.get(0).map(MerchantId))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn transactions_without_entry(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t
             LEFT JOIN ledger_entries l ON l.transaction_id = t.id
             WHERE l.id IS NULL AND t.created_at < ?1 ORDER BY t.id LIMIT ?2"
        );
        query_transactions(&conn, &sql, params![timestamp(created_before), limit as i64])
    }

    async fn unsettled_transactions(
        &self,
        merchant: MerchantId,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t
             WHERE t.merchant_id = ?1 AND t.settled_at IS NULL AND t.created_at < ?2
               AND t.status != ?3 AND t.payment_method != ?3
             ORDER BY t.id"
        );
        query_transactions(
            &conn,
            &sql,
            params![merchant.0, timestamp(created_before), PAYOUT],
        )
    }

    async fn mark_settled(&self, merchant: MerchantId, ids: &[TransactionId]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        mark_settled(&mut conn, merchant, ids)
    }
}
