use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ordinals::RuneId;
use rusqlite::{Connection, OptionalExtension as _, Row, params};

use crate::chain::unix_millis;
use crate::pool::{BalanceDelta, PendingSwap, PoolAsset, PoolLock, PoolRecord, TxRecord};
use crate::swap::SwapKind;

/// Sqlite-backed repository for pools, the audit ledger, and the
/// append-only reservation set.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_pool(&mut self, pool: &PoolRecord) -> Result<()> {
        let (asset_kind, rune_id, divisibility, ticker) = match &pool.asset {
            PoolAsset::Rune { id, divisibility } => {
                ("rune", Some(id.to_string()), Some(*divisibility as i64), None)
            }
            PoolAsset::Brc20 { ticker } => ("brc20", None, None, Some(ticker.clone())),
        };

        self.conn
            .execute(
                r#"
INSERT INTO pools (
  address,
  asset_kind,
  rune_id,
  divisibility,
  ticker,
  pubkey,
  private_key,
  asset_amount,
  btc_sats,
  volume_sats,
  lock_owner,
  lock_acquired_at_ms,
  pending_swap
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
)
"#,
                params![
                    &pool.address,
                    asset_kind,
                    rune_id,
                    divisibility,
                    ticker,
                    &pool.pubkey,
                    &pool.private_key,
                    pool.asset_amount.to_string(),
                    i64::try_from(pool.btc_sats).context("btc_sats out of range")?,
                    i64::try_from(pool.volume_sats).context("volume_sats out of range")?,
                    pool.lock.as_ref().map(|l| l.owner.clone()),
                    pool.lock.as_ref().map(|l| l.acquired_at_ms as i64),
                    pool.pending
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()
                        .context("encode pending swap")?,
                ],
            )
            .with_context(|| format!("insert pool {}", pool.address))?;
        Ok(())
    }

    pub fn get_pool(&self, address: &str) -> Result<Option<PoolRecord>> {
        self.conn
            .query_row(
                &format!("{POOL_SELECT} WHERE address = ?1"),
                params![address],
                pool_from_row,
            )
            .optional()
            .with_context(|| format!("get pool {address}"))
    }

    pub fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{POOL_SELECT} ORDER BY address"))
            .context("prepare list pools")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map([], pool_from_row)
            .context("query list pools")?;
        for row in rows {
            out.push(row.context("read pool row")?);
        }
        Ok(out)
    }

    /// Atomic compare-and-set of the pool lease: succeeds when the lock is
    /// free, already held by `owner`, or expired under `lease_ms`. Returns
    /// false when a different holder's lease is still live.
    pub fn try_lock(
        &mut self,
        address: &str,
        owner: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool> {
        let expired_before = now_ms.saturating_sub(lease_ms) as i64;
        let rows = self
            .conn
            .execute(
                r#"
UPDATE pools
SET lock_owner = ?2, lock_acquired_at_ms = ?3
WHERE address = ?1
  AND (
    lock_owner IS NULL
    OR lock_owner = ?2
    OR lock_acquired_at_ms <= ?4
  )
"#,
                params![address, owner, now_ms as i64, expired_before],
            )
            .with_context(|| format!("lock pool {address}"))?;
        Ok(rows == 1)
    }

    /// Unconditionally returns the pool to `Free` and drops any outstanding
    /// template metadata.
    pub fn unlock(&mut self, address: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pools
                 SET lock_owner = NULL, lock_acquired_at_ms = NULL, pending_swap = NULL
                 WHERE address = ?1",
                params![address],
            )
            .with_context(|| format!("unlock pool {address}"))?;
        Ok(())
    }

    pub fn set_pending_swap(&mut self, address: &str, pending: &PendingSwap) -> Result<()> {
        let encoded = serde_json::to_string(pending).context("encode pending swap")?;
        let rows = self
            .conn
            .execute(
                "UPDATE pools SET pending_swap = ?2 WHERE address = ?1",
                params![address, encoded],
            )
            .with_context(|| format!("set pending swap for {address}"))?;
        anyhow::ensure!(rows == 1, "pool not found: {address}");
        Ok(())
    }

    /// Applies a signed swap delta to the pool balances and accumulates
    /// volume, failing on under/overflow without touching the row.
    pub fn apply_balance_delta(&mut self, address: &str, delta: &BalanceDelta) -> Result<()> {
        let tx = self.conn.transaction().context("begin balance tx")?;

        let (asset_amount, btc_sats, volume_sats): (String, i64, i64) = tx
            .query_row(
                "SELECT asset_amount, btc_sats, volume_sats FROM pools WHERE address = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .with_context(|| format!("read balances for {address}"))?;

        let asset_amount =
            u128::from_str(&asset_amount).context("parse stored asset_amount")?;
        let asset_amount = asset_amount
            .checked_add_signed(delta.asset)
            .context("pool asset balance under/overflow")?;

        let btc_sats = u64::try_from(btc_sats).context("stored btc_sats negative")?;
        let btc_sats = btc_sats
            .checked_add_signed(delta.btc)
            .context("pool btc balance under/overflow")?;

        let volume_sats = u64::try_from(volume_sats).context("stored volume_sats negative")?;
        let volume_sats = volume_sats
            .checked_add(delta.volume)
            .context("pool volume overflow")?;

        tx.execute(
            "UPDATE pools SET asset_amount = ?2, btc_sats = ?3, volume_sats = ?4 WHERE address = ?1",
            params![
                address,
                asset_amount.to_string(),
                i64::try_from(btc_sats).context("btc_sats out of range")?,
                i64::try_from(volume_sats).context("volume_sats out of range")?,
            ],
        )
        .with_context(|| format!("update balances for {address}"))?;

        tx.commit().context("commit balance tx")
    }

    pub fn insert_tx_record(&mut self, record: &TxRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO swap_txs (
  pool_address,
  user_address,
  txid,
  kind,
  asset_amount,
  btc_sats,
  vout,
  is_used,
  created_at_ms
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
)
"#,
                params![
                    &record.pool_address,
                    &record.user_address,
                    &record.txid,
                    record.kind.as_str(),
                    record.asset_amount.to_string(),
                    i64::try_from(record.btc_sats).context("btc_sats out of range")?,
                    record.vout as i64,
                    record.is_used,
                    record.created_at_ms as i64,
                ],
            )
            .with_context(|| format!("insert tx record {}", record.txid))?;
        Ok(())
    }

    pub fn mark_records_used(&mut self, pool_address: &str, txids: &[String]) -> Result<()> {
        for txid in txids {
            self.conn
                .execute(
                    "UPDATE swap_txs SET is_used = 1 WHERE pool_address = ?1 AND txid = ?2",
                    params![pool_address, txid],
                )
                .with_context(|| format!("mark tx record used {txid}"))?;
        }
        Ok(())
    }

    /// Audit-ledger change outputs the external index has not surfaced yet;
    /// ordered by commit order, rune swaps only.
    pub fn unused_pool_change(&self, pool_address: &str) -> Result<Vec<TxRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT
  pool_address,
  user_address,
  txid,
  kind,
  asset_amount,
  btc_sats,
  vout,
  is_used,
  created_at_ms
FROM swap_txs
WHERE pool_address = ?1
  AND is_used = 0
  AND kind IN ('buy_rune', 'sell_rune')
ORDER BY id
"#,
            )
            .context("prepare unused pool change")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map(params![pool_address], tx_record_from_row)
            .context("query unused pool change")?;
        for row in rows {
            out.push(row.context("read tx record row")?);
        }
        Ok(out)
    }

    /// Records a consumed UTXO; append-only and idempotent per txid.
    pub fn reserve(&mut self, txid: &str, confirming_txid: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reservations (txid, confirming_txid, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![txid, confirming_txid, unix_millis() as i64],
            )
            .with_context(|| format!("reserve {txid}"))?;
        Ok(())
    }

    pub fn is_reserved(&self, txid: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM reservations WHERE txid = ?1",
                params![txid],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("check reservation {txid}"))?;
        Ok(found.is_some())
    }

    pub fn reservation_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM reservations", [], |row| row.get(0))
            .context("count reservations")?;
        Ok(count as u64)
    }
}

const POOL_SELECT: &str = r#"
SELECT
  address,
  asset_kind,
  rune_id,
  divisibility,
  ticker,
  pubkey,
  private_key,
  asset_amount,
  btc_sats,
  volume_sats,
  lock_owner,
  lock_acquired_at_ms,
  pending_swap
FROM pools
"#;

fn column_err(col: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, message.into())
}

fn pool_from_row(row: &Row<'_>) -> rusqlite::Result<PoolRecord> {
    use rusqlite::types::Type;

    let asset_kind: String = row.get(1)?;
    let asset = match asset_kind.as_str() {
        "rune" => {
            let rune_id: String = row.get(2)?;
            let divisibility: i64 = row.get(3)?;
            PoolAsset::Rune {
                id: RuneId::from_str(&rune_id).map_err(|e| {
                    column_err(2, Type::Text, format!("invalid rune id {rune_id}: {e}"))
                })?,
                divisibility: u8::try_from(divisibility).map_err(|_| {
                    column_err(3, Type::Integer, format!("invalid divisibility {divisibility}"))
                })?,
            }
        }
        "brc20" => PoolAsset::Brc20 {
            ticker: row.get(4)?,
        },
        other => {
            return Err(column_err(1, Type::Text, format!("unknown asset kind {other}")));
        }
    };

    let asset_amount: String = row.get(7)?;
    let asset_amount = u128::from_str(&asset_amount)
        .map_err(|_| column_err(7, Type::Text, format!("invalid asset_amount {asset_amount}")))?;

    let btc_sats: i64 = row.get(8)?;
    let volume_sats: i64 = row.get(9)?;

    let lock_owner: Option<String> = row.get(10)?;
    let lock_acquired_at_ms: Option<i64> = row.get(11)?;
    let lock = match (lock_owner, lock_acquired_at_ms) {
        (Some(owner), Some(at)) => Some(PoolLock {
            owner,
            acquired_at_ms: at as u64,
        }),
        _ => None,
    };

    Ok(PoolRecord {
        address: row.get(0)?,
        asset,
        pubkey: row.get(5)?,
        private_key: row.get(6)?,
        asset_amount,
        btc_sats: u64::try_from(btc_sats)
            .map_err(|_| column_err(8, Type::Integer, format!("invalid btc_sats {btc_sats}")))?,
        volume_sats: u64::try_from(volume_sats).map_err(|_| {
            column_err(9, Type::Integer, format!("invalid volume_sats {volume_sats}"))
        })?,
        lock,
        pending: row
            .get::<_, Option<String>>(12)?
            .map(|raw| {
                serde_json::from_str::<PendingSwap>(&raw).map_err(|e| {
                    column_err(12, Type::Text, format!("invalid pending swap: {e}"))
                })
            })
            .transpose()?,
    })
}

fn tx_record_from_row(row: &Row<'_>) -> rusqlite::Result<TxRecord> {
    use rusqlite::types::Type;

    let kind: String = row.get(3)?;
    let kind = SwapKind::parse(&kind)
        .ok_or_else(|| column_err(3, Type::Text, format!("unknown swap kind {kind}")))?;

    let asset_amount: String = row.get(4)?;
    let asset_amount = u128::from_str(&asset_amount)
        .map_err(|_| column_err(4, Type::Text, format!("invalid asset_amount {asset_amount}")))?;

    let btc_sats: i64 = row.get(5)?;
    let vout: i64 = row.get(6)?;
    let created_at_ms: i64 = row.get(8)?;

    Ok(TxRecord {
        pool_address: row.get(0)?,
        user_address: row.get(1)?,
        txid: row.get(2)?,
        kind,
        asset_amount,
        btc_sats: u64::try_from(btc_sats)
            .map_err(|_| column_err(5, Type::Integer, format!("invalid btc_sats {btc_sats}")))?,
        vout: u32::try_from(vout)
            .map_err(|_| column_err(6, Type::Integer, format!("invalid vout {vout}")))?,
        is_used: row.get(7)?,
        created_at_ms: created_at_ms as u64,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS pools (
  address TEXT PRIMARY KEY,
  asset_kind TEXT NOT NULL,
  rune_id TEXT,
  divisibility INTEGER,
  ticker TEXT,
  pubkey TEXT NOT NULL,
  private_key TEXT NOT NULL,
  asset_amount TEXT NOT NULL,
  btc_sats INTEGER NOT NULL,
  volume_sats INTEGER NOT NULL,
  lock_owner TEXT,
  lock_acquired_at_ms INTEGER,
  pending_swap TEXT
);
CREATE TABLE IF NOT EXISTS swap_txs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pool_address TEXT NOT NULL,
  user_address TEXT NOT NULL,
  txid TEXT NOT NULL,
  kind TEXT NOT NULL,
  asset_amount TEXT NOT NULL,
  btc_sats INTEGER NOT NULL,
  vout INTEGER NOT NULL,
  is_used INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS swap_txs_pool_idx ON swap_txs(pool_address, is_used);
CREATE TABLE IF NOT EXISTS reservations (
  txid TEXT PRIMARY KEY,
  confirming_txid TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}
