//! Seams to the external collaborators the engine consults. Production
//! implementations wrap the UTXO/asset indexers, the fee oracle, the BRC20
//! inscription service, and the broadcast endpoint; tests plug in-memory
//! fakes into the same traits.

use anyhow::Result;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use ordinals::RuneId;
use serde::Serialize;

use crate::chain::fee::FeeRate;

#[derive(Debug, Clone)]
pub struct BtcUtxo {
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
}

#[derive(Debug, Clone)]
pub struct RuneUtxo {
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
    pub rune_amount: u128,
}

#[derive(Debug, Clone)]
pub struct InscriptionUtxo {
    pub inscription_id: String,
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
}

/// A minted BRC20 transfer inscription sitting in an address, spendable to
/// move `amount` of the ticker.
#[derive(Debug, Clone)]
pub struct TransferableInscription {
    pub inscription_id: String,
    pub amount: u128,
}

/// A pending inscription order: paying `amount_sats` to `pay_address` funds
/// the reveal of a new transfer inscription.
#[derive(Debug, Clone)]
pub struct TransferOrder {
    pub order_id: String,
    pub pay_address: String,
    pub amount_sats: u64,
}

/// Candidate spendable outputs per address, in the index's preference order.
pub trait UtxoIndex: Send + Sync {
    fn btc_utxos(&self, address: &str) -> Result<Vec<BtcUtxo>>;
    fn rune_utxos(&self, address: &str, rune: RuneId) -> Result<Vec<RuneUtxo>>;
}

pub trait FeeOracle: Send + Sync {
    fn current_fee_rate(&self) -> Result<FeeRate>;
}

pub trait InscriptionIndex: Send + Sync {
    fn transferable(&self, address: &str, ticker: &str) -> Result<Vec<TransferableInscription>>;
    fn inscription_utxo(&self, address: &str, inscription_id: &str) -> Result<InscriptionUtxo>;
    fn ticker_balance(&self, address: &str, ticker: &str) -> Result<u128>;
    fn create_transfer_order(
        &self,
        address: &str,
        fee_rate: FeeRate,
        ticker: &str,
        amount: u128,
    ) -> Result<TransferOrder>;
}

pub trait Broadcaster: Send + Sync {
    fn submit(&self, tx: &Transaction) -> Result<Txid>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolEvent {
    pub pool_address: String,
    pub asset_amount: String,
    pub btc_sats: u64,
    pub volume_sats: u64,
    pub txid: String,
}

/// Fire-and-forget pool-state-changed publication; not required for
/// correctness, so implementations must not fail the commit path.
pub trait NotificationBus: Send + Sync {
    fn pool_changed(&self, event: &PoolEvent);
}

/// No-op bus for deployments without a realtime feed.
#[derive(Debug, Default)]
pub struct NullBus;

impl NotificationBus for NullBus {
    fn pool_changed(&self, _event: &PoolEvent) {}
}
