use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::key::XOnlyPublicKey;
use ordinals::RuneId;
use serde::{Deserialize, Serialize};

use crate::swap::SwapKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolAsset {
    Rune { id: RuneId, divisibility: u8 },
    Brc20 { ticker: String },
}

impl PoolAsset {
    pub fn label(&self) -> String {
        match self {
            PoolAsset::Rune { id, .. } => id.to_string(),
            PoolAsset::Brc20 { ticker } => ticker.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLock {
    pub owner: String,
    pub acquired_at_ms: u64,
}

/// Outstanding-template metadata, persisted at generation time while a
/// workflow holds the lease. The finalize commit reads amounts, kind, and
/// consumed recovery txids from here, never from the caller's request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSwap {
    /// Txid of the unsigned template; both signed copies must resolve to it.
    pub fingerprint: String,
    pub kind: SwapKind,
    pub user_asset_amount: u128,
    pub pool_asset_amount: u128,
    pub btc_sats: u64,
    /// Audit-ledger txids consumed by the recovery pass.
    pub used_txids: Vec<String>,
}

/// One operator-custodied liquidity pool. Balances are only mutated by a
/// successful finalize commit while the pool lease is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: String,
    pub asset: PoolAsset,
    /// X-only public key of the custodial taproot wallet, hex.
    pub pubkey: String,
    /// WIF reference to the custodial secret key; opaque to the core.
    pub private_key: String,
    pub asset_amount: u128,
    pub btc_sats: u64,
    pub volume_sats: u64,
    pub lock: Option<PoolLock>,
    /// Set while a swap workflow holds the lease.
    pub pending: Option<PendingSwap>,
}

impl PoolRecord {
    pub fn x_only_pubkey(&self) -> Result<XOnlyPublicKey> {
        XOnlyPublicKey::from_str(&self.pubkey)
            .with_context(|| format!("parse pool pubkey for {}", self.address))
    }

    pub fn rune(&self) -> Option<(RuneId, u8)> {
        match &self.asset {
            PoolAsset::Rune { id, divisibility } => Some((*id, *divisibility)),
            PoolAsset::Brc20 { .. } => None,
        }
    }

    /// Current lease holder, treating an expired lease as free.
    pub fn lock_holder(&self, now_ms: u64, lease_ms: u64) -> Option<&str> {
        let lock = self.lock.as_ref()?;
        if now_ms.saturating_sub(lock.acquired_at_ms) >= lease_ms {
            return None;
        }
        Some(&lock.owner)
    }
}

/// Signed effect of one committed swap on a pool's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub asset: i128,
    pub btc: i64,
    pub volume: u64,
}

/// Audit ledger entry appended on every successful commit. `vout` points at
/// the pool-side asset output of the committed transaction; until the
/// external index picks that output up, unused records double as selection
/// candidates for the recovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub pool_address: String,
    pub user_address: String,
    pub txid: String,
    pub kind: SwapKind,
    pub asset_amount: u128,
    pub btc_sats: u64,
    pub vout: u32,
    pub is_used: bool,
    pub created_at_ms: u64,
}
