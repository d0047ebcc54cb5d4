//! Persistent wallet state.
//!
//! Everything is scoped by wallet name so several wallets can share one
//! database file. Tables:
//! - `addresses`: derived addresses per kind with their pool status
//! - `transactions`: per-output payment records, unique per (txid, vout)
//! - `unsent_transactions`: records still waiting to be relayed to the companion backend
//! - `raw_transactions`: every signed transaction the engine produced, with replacement links
//! - `output_locks`: outpoints reserved by an in-flight transaction
//! - `wallet_state`: small key/value cursors such as the last scanned height

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use eyre::Result;
use tokio_rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::wallet::AddressKind;
use crate::{unix_now, DatabaseLocation};

const LAST_SCANNED_HEIGHT_KEY: &str = "last_scanned_height";

pub async fn setup_wallet_database(conn: &Connection) -> Result<()> {
    let schema = r#"
        CREATE TABLE IF NOT EXISTS addresses (
            wallet_name     TEXT      NOT NULL,
            kind            TEXT      NOT NULL,  -- 'receive' | 'change'
            address_index   INTEGER   NOT NULL,
            address         TEXT      NOT NULL,
            status          TEXT      NOT NULL DEFAULT 'available',
            created_at      INTEGER   NOT NULL,
            allocated_at    INTEGER,
            used_at         INTEGER,
            block_height    INTEGER,             -- height of the first confirmed receipt
            sent_to_backend INTEGER   NOT NULL DEFAULT 0,

            PRIMARY KEY (wallet_name, kind, address_index)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_addresses_address ON addresses(wallet_name, address);
        CREATE INDEX IF NOT EXISTS idx_addresses_status ON addresses(wallet_name, kind, status, address_index);

        CREATE TABLE IF NOT EXISTS transactions (
            wallet_name     TEXT      NOT NULL,
            txid            TEXT      NOT NULL,
            vout            INTEGER   NOT NULL,
            source          TEXT      NOT NULL,
            destination     TEXT      NOT NULL,
            value_sats      INTEGER   NOT NULL,
            date            INTEGER   NOT NULL,
            block_height    INTEGER,
            sent_to_backend INTEGER   NOT NULL DEFAULT 0,
            raw_tx          TEXT      NOT NULL,  -- hex

            PRIMARY KEY (wallet_name, txid, vout)
        );

        CREATE TABLE IF NOT EXISTS unsent_transactions (
            wallet_name     TEXT      NOT NULL,
            txid            TEXT      NOT NULL,
            vout            INTEGER   NOT NULL,
            queued_at       INTEGER   NOT NULL,

            PRIMARY KEY (wallet_name, txid, vout)
        );

        CREATE TABLE IF NOT EXISTS raw_transactions (
            wallet_name      TEXT     NOT NULL,
            txid             TEXT     NOT NULL,
            raw_tx           BLOB     NOT NULL,
            fee_sats         INTEGER  NOT NULL,
            created_at       INTEGER  NOT NULL,
            replaces_txid    TEXT,
            replaced_by_txid TEXT,

            PRIMARY KEY (wallet_name, txid)
        );

        CREATE INDEX IF NOT EXISTS idx_raw_replaced ON raw_transactions(wallet_name, replaced_by_txid);

        CREATE TABLE IF NOT EXISTS output_locks (
            wallet_name     TEXT      NOT NULL,
            txid            TEXT      NOT NULL,
            vout            INTEGER   NOT NULL,
            locking_txid    TEXT,
            locked_at       INTEGER   NOT NULL,

            PRIMARY KEY (wallet_name, txid, vout)
        );

        CREATE TABLE IF NOT EXISTS wallet_state (
            wallet_name     TEXT      NOT NULL,
            key             TEXT      NOT NULL,
            value           TEXT      NOT NULL,

            PRIMARY KEY (wallet_name, key)
        );
    "#;

    conn.call(|conn| {
        conn.execute_batch(schema)?;
        Ok(())
    })
    .await?;

    info!("Custody wallet database initialized");
    Ok(())
}

fn other(message: impl Into<String>) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(message.into().into())
}

fn parse_txid(s: &str) -> RowResult<Txid> {
    Txid::from_str(s).map_err(|e| other(format!("Invalid txid {s}: {e}")))
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStatus {
    Available,
    Allocated,
    Used,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Available => "available",
            AddressStatus::Allocated => "allocated",
            AddressStatus::Used => "used",
        }
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "available" => Ok(AddressStatus::Available),
            "allocated" => Ok(AddressStatus::Allocated),
            "used" => Ok(AddressStatus::Used),
            other => Err(format!("unknown address status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub index: u32,
    pub address: String,
    pub kind: AddressKind,
    pub status: AddressStatus,
    pub allocated_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub block_height: Option<u32>,
    pub sent_to_backend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransactionRecord {
    pub txid: Txid,
    pub vout: u32,
    pub source: String,
    pub destination: String,
    pub value: Amount,
    pub block_height: Option<u32>,
    pub raw_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub txid: Txid,
    pub vout: u32,
    pub wallet_name: String,
    pub source: String,
    pub destination: String,
    pub value: Amount,
    pub date: DateTime<Utc>,
    pub block_height: Option<u32>,
    pub sent_to_backend: bool,
    pub raw_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransactionRecord {
    pub tx: Transaction,
    pub fee: Amount,
    pub created_at: DateTime<Utc>,
    pub replaces: Option<Txid>,
    pub replaced_by: Option<Txid>,
}

const ADDRESS_COLUMNS: &str = "address_index, address, kind, status, allocated_at, used_at, block_height, sent_to_backend";

type RowResult<T> = std::result::Result<T, tokio_rusqlite::Error>;

fn address_from_row(row: &tokio_rusqlite::Row<'_>) -> RowResult<AddressRecord> {
    let kind: String = row.get(2)?;
    let status: String = row.get(3)?;
    let sent_to_backend: i64 = row.get(7)?;
    Ok(AddressRecord {
        index: row.get(0)?,
        address: row.get(1)?,
        kind: AddressKind::from_str(&kind).map_err(other)?,
        status: AddressStatus::from_str(&status).map_err(other)?,
        allocated_at: timestamp(row.get(4)?),
        used_at: timestamp(row.get(5)?),
        block_height: row.get(6)?,
        sent_to_backend: sent_to_backend != 0,
    })
}

const TRANSACTION_COLUMNS: &str =
    "txid, vout, source, destination, value_sats, date, block_height, sent_to_backend, raw_tx";

fn transaction_from_row(wallet_name: &str, row: &tokio_rusqlite::Row<'_>) -> RowResult<TransactionRecord> {
    let txid: String = row.get(0)?;
    let value_sats: i64 = row.get(4)?;
    let date: i64 = row.get(5)?;
    let sent_to_backend: i64 = row.get(7)?;
    Ok(TransactionRecord {
        txid: parse_txid(&txid)?,
        vout: row.get(1)?,
        wallet_name: wallet_name.to_string(),
        source: row.get(2)?,
        destination: row.get(3)?,
        value: Amount::from_sat(value_sats as u64),
        date: timestamp(Some(date)).unwrap_or_default(),
        block_height: row.get(6)?,
        sent_to_backend: sent_to_backend != 0,
        raw_hex: row.get(8)?,
    })
}

/// Wallet-scoped handle over the sqlite database. Cloning is cheap and every
/// clone talks to the same connection.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    wallet_name: String,
}

impl Store {
    pub async fn open(location: &DatabaseLocation, wallet_name: impl Into<String>) -> Result<Self> {
        let conn = match location {
            DatabaseLocation::InMemory => Connection::open_in_memory().await?,
            DatabaseLocation::Directory(path) => {
                let db_path = format!("{}/custody_wallet.db", path);
                Connection::open(&db_path).await?
            }
        };

        setup_wallet_database(&conn).await?;

        Ok(Self {
            conn,
            wallet_name: wallet_name.into(),
        })
    }

    pub fn wallet_name(&self) -> &str {
        &self.wallet_name
    }

    /// Persists a freshly derived address at the next index for its kind.
    /// Returns `None` when the address is already known.
    pub async fn append_address(&self, kind: AddressKind, address: &Address) -> Result<Option<u32>> {
        let wallet = self.wallet_name.clone();
        let address = address.to_string();
        let now = unix_now() as i64;

        let index = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM addresses WHERE wallet_name = ?1 AND address = ?2",
                    params![wallet, address],
                    |row| row.get(0),
                )?;
                if exists > 0 {
                    return Ok(None);
                }

                let next: u32 = tx.query_row(
                    "SELECT COALESCE(MAX(address_index) + 1, 0) FROM addresses WHERE wallet_name = ?1 AND kind = ?2",
                    params![wallet, kind.as_str()],
                    |row| row.get(0),
                )?;

                tx.execute(
                    r#"
                    INSERT INTO addresses (wallet_name, kind, address_index, address, status, created_at)
                    VALUES (?1, ?2, ?3, ?4, 'available', ?5)
                    "#,
                    params![wallet, kind.as_str(), next, address, now],
                )?;

                tx.commit()?;
                Ok(Some(next))
            })
            .await?;

        if let Some(index) = index {
            debug!(%kind, index, "Stored derived address");
        }
        Ok(index)
    }

    pub async fn last_address_index(&self, kind: AddressKind) -> Result<Option<u32>> {
        let wallet = self.wallet_name.clone();
        let index = self
            .conn
            .call(move |conn| {
                let index: Option<u32> = conn.query_row(
                    "SELECT MAX(address_index) FROM addresses WHERE wallet_name = ?1 AND kind = ?2",
                    params![wallet, kind.as_str()],
                    |row| row.get(0),
                )?;
                Ok(index)
            })
            .await?;
        Ok(index)
    }

    pub async fn count_addresses(&self, kind: AddressKind, status: AddressStatus) -> Result<u64> {
        let wallet = self.wallet_name.clone();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM addresses WHERE wallet_name = ?1 AND kind = ?2 AND status = ?3",
                    params![wallet, kind.as_str(), status.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await?;
        Ok(count)
    }

    /// Moves the lowest-index available address of `kind` to allocated.
    pub(crate) async fn allocate_oldest(&self, kind: AddressKind) -> Result<Option<AddressRecord>> {
        let wallet = self.wallet_name.clone();
        let now = unix_now() as i64;

        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let row = {
                    let mut stmt = tx.prepare(&format!(
                        r#"
                        SELECT {ADDRESS_COLUMNS} FROM addresses
                        WHERE wallet_name = ?1 AND kind = ?2 AND status = 'available'
                        ORDER BY address_index ASC
                        LIMIT 1
                        "#
                    ))?;
                    let mut rows = stmt.query(params![wallet, kind.as_str()])?;
                    match rows.next()? {
                        Some(row) => Some(address_from_row(row)?),
                        None => None,
                    }
                };

                let Some(mut record) = row else {
                    return Ok(None);
                };

                tx.execute(
                    r#"
                    UPDATE addresses SET status = 'allocated', allocated_at = ?4
                    WHERE wallet_name = ?1 AND kind = ?2 AND address_index = ?3
                    "#,
                    params![wallet, kind.as_str(), record.index, now],
                )?;
                tx.commit()?;

                record.status = AddressStatus::Allocated;
                record.allocated_at = timestamp(Some(now));
                Ok(Some(record))
            })
            .await?;

        Ok(record)
    }

    /// Marks an address used. Returns false if it is unknown or already used.
    pub(crate) async fn mark_address_used(&self, address: &str, block_height: Option<u32>) -> Result<bool> {
        let wallet = self.wallet_name.clone();
        let address = address.to_string();
        let now = unix_now() as i64;

        let updated = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    r#"
                    UPDATE addresses SET status = 'used', used_at = ?3, block_height = ?4
                    WHERE wallet_name = ?1 AND address = ?2 AND status != 'used'
                    "#,
                    params![wallet, address, now, block_height],
                )?;
                Ok(affected > 0)
            })
            .await?;
        Ok(updated)
    }

    pub async fn get_address(&self, address: &str) -> Result<Option<AddressRecord>> {
        let wallet = self.wallet_name.clone();
        let address = address.to_string();

        let record = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ADDRESS_COLUMNS} FROM addresses WHERE wallet_name = ?1 AND address = ?2"
                ))?;
                let mut rows = stmt.query(params![wallet, address])?;
                match rows.next()? {
                    Some(row) => Ok(Some(address_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(record)
    }

    pub async fn is_wallet_address(&self, address: &str) -> Result<bool> {
        Ok(self.get_address(address).await?.is_some())
    }

    pub async fn unsent_addresses(&self) -> Result<Vec<AddressRecord>> {
        let wallet = self.wallet_name.clone();
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT {ADDRESS_COLUMNS} FROM addresses
                    WHERE wallet_name = ?1 AND sent_to_backend = 0
                    ORDER BY kind, address_index
                    "#
                ))?;
                let mut rows = stmt.query(params![wallet])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    records.push(address_from_row(row)?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    pub async fn mark_addresses_sent(&self, addresses: &[String]) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let addresses = addresses.to_vec();
        let count = addresses.len();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for address in addresses {
                    tx.execute(
                        "UPDATE addresses SET sent_to_backend = 1 WHERE wallet_name = ?1 AND address = ?2",
                        params![wallet, address],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(count, "Marked addresses as relayed to backend");
        Ok(())
    }

    /// Stores a signed transaction. `replaces` is recorded on the new row only;
    /// the earlier row is linked by [`Store::mark_tx_replaced`] once the
    /// replacement has been accepted somewhere.
    pub async fn save_raw_transaction(
        &self,
        tx: &Transaction,
        fee: Amount,
        replaces: Option<Txid>,
    ) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let txid = tx.compute_txid();
        let raw_tx = serialize(tx);
        let txid_str = txid.to_string();
        let replaces_str = replaces.map(|t| t.to_string());
        let fee_sats = fee.to_sat() as i64;
        let now = unix_now() as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR IGNORE INTO raw_transactions (
                        wallet_name, txid, raw_tx, fee_sats, created_at, replaces_txid
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![wallet, txid_str, raw_tx, fee_sats, now, replaces_str],
                )?;
                Ok(())
            })
            .await?;

        info!(%txid, fee = fee.to_sat(), replaces = ?replaces, "Persisted signed transaction");
        Ok(())
    }

    pub async fn mark_tx_replaced(&self, original: Txid, replacement: Txid) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let original_str = original.to_string();
        let replacement_str = replacement.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    UPDATE raw_transactions SET replaced_by_txid = ?3
                    WHERE wallet_name = ?1 AND txid = ?2
                    "#,
                    params![wallet, original_str, replacement_str],
                )?;
                Ok(())
            })
            .await?;

        info!(%original, %replacement, "Marked transaction as replaced");
        Ok(())
    }

    pub async fn raw_transaction(&self, txid: Txid) -> Result<Option<RawTransactionRecord>> {
        let wallet = self.wallet_name.clone();
        let txid_str = txid.to_string();

        let record = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT raw_tx, fee_sats, created_at, replaces_txid, replaced_by_txid
                    FROM raw_transactions WHERE wallet_name = ?1 AND txid = ?2
                    "#,
                )?;
                let mut rows = stmt.query(params![wallet, txid_str])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };

                let raw_tx: Vec<u8> = row.get(0)?;
                let fee_sats: i64 = row.get(1)?;
                let created_at: i64 = row.get(2)?;
                let replaces: Option<String> = row.get(3)?;
                let replaced_by: Option<String> = row.get(4)?;

                let tx: Transaction = deserialize(&raw_tx)
                    .map_err(|e| other(format!("Invalid raw transaction: {e}")))?;
                Ok(Some(RawTransactionRecord {
                    tx,
                    fee: Amount::from_sat(fee_sats as u64),
                    created_at: timestamp(Some(created_at)).unwrap_or_default(),
                    replaces: replaces.as_deref().map(parse_txid).transpose()?,
                    replaced_by: replaced_by.as_deref().map(parse_txid).transpose()?,
                }))
            })
            .await?;
        Ok(record)
    }

    /// Inserts a payment record and queues it for backend relay. A repeated
    /// (txid, vout) is a no-op and returns false.
    pub async fn insert_transaction_record(&self, record: NewTransactionRecord) -> Result<bool> {
        let wallet = self.wallet_name.clone();
        let now = unix_now() as i64;
        let txid = record.txid;
        let vout = record.vout;

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let txid_str = record.txid.to_string();
                let affected = tx.execute(
                    r#"
                    INSERT OR IGNORE INTO transactions (
                        wallet_name, txid, vout, source, destination, value_sats,
                        date, block_height, raw_tx
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                    params![
                        wallet,
                        txid_str,
                        record.vout,
                        record.source,
                        record.destination,
                        record.value.to_sat() as i64,
                        now,
                        record.block_height,
                        record.raw_hex
                    ],
                )?;
                if affected > 0 {
                    tx.execute(
                        r#"
                        INSERT OR IGNORE INTO unsent_transactions (wallet_name, txid, vout, queued_at)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                        params![wallet, txid_str, record.vout, now],
                    )?;
                }
                tx.commit()?;
                Ok(affected > 0)
            })
            .await?;

        if inserted {
            debug!(%txid, vout, "Recorded transaction output");
        }
        Ok(inserted)
    }

    pub async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.query_transactions(format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE wallet_name = ?1 ORDER BY date, txid, vout"
        ))
        .await
    }

    pub async fn unsent_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let columns = TRANSACTION_COLUMNS
            .split(", ")
            .map(|column| format!("t.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_transactions(format!(
            r#"
            SELECT {columns} FROM unsent_transactions u
            JOIN transactions t
              ON t.wallet_name = u.wallet_name AND t.txid = u.txid AND t.vout = u.vout
            WHERE u.wallet_name = ?1
            ORDER BY u.queued_at, u.txid, u.vout
            "#
        ))
        .await
    }

    async fn query_transactions(&self, sql: String) -> Result<Vec<TransactionRecord>> {
        let wallet = self.wallet_name.clone();
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![wallet])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    records.push(transaction_from_row(&wallet, row)?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    /// Removes a record from the unsent view once the backend acknowledged it.
    pub async fn clear_unsent(&self, txid: Txid, vout: u32) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let txid_str = txid.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM unsent_transactions WHERE wallet_name = ?1 AND txid = ?2 AND vout = ?3",
                    params![wallet, txid_str, vout],
                )?;
                tx.execute(
                    "UPDATE transactions SET sent_to_backend = 1 WHERE wallet_name = ?1 AND txid = ?2 AND vout = ?3",
                    params![wallet, txid_str, vout],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn lock_outpoints(&self, outpoints: &[OutPoint], locking_txid: Txid) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let params_list: Vec<(String, u32)> = outpoints
            .iter()
            .map(|op| (op.txid.to_string(), op.vout))
            .collect();
        let locking = locking_txid.to_string();
        let now = unix_now() as i64;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (txid, vout) in params_list {
                    tx.execute(
                        r#"
                        INSERT OR REPLACE INTO output_locks (wallet_name, txid, vout, locking_txid, locked_at)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                        params![wallet, txid, vout, locking, now],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(count = outpoints.len(), %locking_txid, "Locked outputs");
        Ok(())
    }

    pub async fn unlock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()> {
        let wallet = self.wallet_name.clone();
        let params_list: Vec<(String, u32)> = outpoints
            .iter()
            .map(|op| (op.txid.to_string(), op.vout))
            .collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (txid, vout) in params_list {
                    tx.execute(
                        "DELETE FROM output_locks WHERE wallet_name = ?1 AND txid = ?2 AND vout = ?3",
                        params![wallet, txid, vout],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(count = outpoints.len(), "Unlocked outputs");
        Ok(())
    }

    pub async fn locked_outpoints(&self) -> Result<HashSet<OutPoint>> {
        let wallet = self.wallet_name.clone();
        let locked = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT txid, vout FROM output_locks WHERE wallet_name = ?1")?;
                let rows = stmt.query_map(params![wallet], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?;
                let mut locked = HashSet::new();
                for row in rows {
                    let (txid, vout) = row?;
                    locked.insert(OutPoint::new(parse_txid(&txid)?, vout));
                }
                Ok(locked)
            })
            .await?;
        Ok(locked)
    }

    /// Drops locks older than `max_age_secs`. Returns how many were released.
    pub async fn release_stale_locks(&self, max_age_secs: u64) -> Result<usize> {
        let wallet = self.wallet_name.clone();
        let cutoff = unix_now().saturating_sub(max_age_secs) as i64;

        let released = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM output_locks WHERE wallet_name = ?1 AND locked_at < ?2",
                    params![wallet, cutoff],
                )?;
                Ok(affected)
            })
            .await?;

        if released > 0 {
            info!(released, "Released stale output locks");
        }
        Ok(released)
    }

    pub async fn last_scanned_height(&self) -> Result<Option<u32>> {
        let wallet = self.wallet_name.clone();
        let value = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT value FROM wallet_state WHERE wallet_name = ?1 AND key = ?2")?;
                let mut rows = stmt.query(params![wallet, LAST_SCANNED_HEIGHT_KEY])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;

        value
            .map(|v| v.parse::<u32>().map_err(|e| eyre::eyre!("Corrupt scan height {v}: {e}")))
            .transpose()
    }

    pub async fn set_last_scanned_height(&self, height: u32) -> Result<()> {
        let wallet = self.wallet_name.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO wallet_state (wallet_name, key, value) VALUES (?1, ?2, ?3)
                    ON CONFLICT (wallet_name, key) DO UPDATE SET value = excluded.value
                    "#,
                    params![wallet, LAST_SCANNED_HEIGHT_KEY, height.to_string()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Removes every row belonging to this wallet.
    pub async fn delete_wallet(&self) -> Result<()> {
        let wallet = self.wallet_name.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for table in [
                    "addresses",
                    "transactions",
                    "unsent_transactions",
                    "raw_transactions",
                    "output_locks",
                    "wallet_state",
                ] {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE wallet_name = ?1"),
                        params![wallet],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(wallet = %self.wallet_name, "Deleted wallet data");
        Ok(())
    }
}
