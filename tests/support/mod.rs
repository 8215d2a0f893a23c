#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bitcoin::hashes::Hash as _;
use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, OutPoint, PrivateKey, ScriptBuf, Transaction, Txid};
use ordinals::RuneId;

use btc_pool_swap::chain::fee::FeeRate;
use btc_pool_swap::chain::sign::sign_key_spend;
use btc_pool_swap::chain::template::psbt_from_hex;
use btc_pool_swap::index::{
    Broadcaster, BtcUtxo, FeeOracle, InscriptionIndex, InscriptionUtxo, NotificationBus,
    PoolEvent, RuneUtxo, TransferOrder, TransferableInscription, UtxoIndex,
};
use btc_pool_swap::pool::{PoolAsset, PoolRecord};
use btc_pool_swap::swap::engine::{EngineConfig, SwapEngine};
use btc_pool_swap::swap::store::SqliteStore;
use btc_pool_swap::swap::{FinalizeRequest, TemplatePayload};

/// One keyed participant: a taproot wallet with no script path.
pub struct Party {
    pub key: PrivateKey,
    pub xonly: XOnlyPublicKey,
    pub address: Address,
}

pub fn party(seed: u8) -> Party {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _) = keypair.x_only_public_key();
    Party {
        key: PrivateKey::new(sk, Network::Regtest),
        xonly,
        address: Address::p2tr(&secp, xonly, None, Network::Regtest),
    }
}

pub fn fake_outpoint(tag: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([tag; 32]),
        vout,
    }
}

pub fn test_rune() -> RuneId {
    RuneId {
        block: 840_000,
        tx: 1,
    }
}

#[derive(Default)]
pub struct MockIndex {
    btc: Mutex<HashMap<String, Vec<BtcUtxo>>>,
    runes: Mutex<HashMap<String, Vec<RuneUtxo>>>,
}

impl MockIndex {
    pub fn add_btc(&self, address: &Address, tag: u8, value_sats: u64) {
        self.btc
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(BtcUtxo {
                outpoint: fake_outpoint(tag, 0),
                value_sats,
                script_pubkey: address.script_pubkey(),
            });
    }

    pub fn add_rune(&self, address: &Address, tag: u8, rune_amount: u128) {
        self.runes
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(RuneUtxo {
                outpoint: fake_outpoint(tag, 1),
                value_sats: 546,
                script_pubkey: address.script_pubkey(),
                rune_amount,
            });
    }
}

impl UtxoIndex for MockIndex {
    fn btc_utxos(&self, address: &str) -> Result<Vec<BtcUtxo>> {
        Ok(self
            .btc
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    fn rune_utxos(&self, address: &str, _rune: RuneId) -> Result<Vec<RuneUtxo>> {
        Ok(self
            .runes
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct FixedFeeOracle(pub f64);

impl FeeOracle for FixedFeeOracle {
    fn current_fee_rate(&self) -> Result<FeeRate> {
        FeeRate::try_from(self.0)
    }
}

#[derive(Default)]
pub struct MockBroadcaster {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<Transaction>>,
}

impl MockBroadcaster {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<Transaction> {
        self.sent.lock().unwrap().last().cloned()
    }
}

impl Broadcaster for MockBroadcaster {
    fn submit(&self, tx: &Transaction) -> Result<Txid> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("mempool rejected transaction");
        }
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

#[derive(Default)]
pub struct MockInscriptions {
    transferable: Mutex<HashMap<(String, String), Vec<TransferableInscription>>>,
    utxos: Mutex<HashMap<String, InscriptionUtxo>>,
    balances: Mutex<HashMap<(String, String), u128>>,
    pub orders: Mutex<Vec<TransferOrder>>,
    pub order_pay_address: Mutex<Option<String>>,
}

impl MockInscriptions {
    pub fn add_transferable(&self, address: &Address, ticker: &str, id: &str, amount: u128, tag: u8) {
        self.transferable
            .lock()
            .unwrap()
            .entry((address.to_string(), ticker.to_string()))
            .or_default()
            .push(TransferableInscription {
                inscription_id: id.to_string(),
                amount,
            });
        self.utxos.lock().unwrap().insert(
            id.to_string(),
            InscriptionUtxo {
                inscription_id: id.to_string(),
                outpoint: fake_outpoint(tag, 0),
                value_sats: 546,
                script_pubkey: address.script_pubkey(),
            },
        );
    }

    pub fn set_order_pay_address(&self, address: &Address) {
        *self.order_pay_address.lock().unwrap() = Some(address.to_string());
    }

    pub fn set_ticker_balance(&self, address: &Address, ticker: &str, balance: u128) {
        self.balances
            .lock()
            .unwrap()
            .insert((address.to_string(), ticker.to_string()), balance);
    }
}

impl InscriptionIndex for MockInscriptions {
    fn transferable(&self, address: &str, ticker: &str) -> Result<Vec<TransferableInscription>> {
        Ok(self
            .transferable
            .lock()
            .unwrap()
            .get(&(address.to_string(), ticker.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn inscription_utxo(&self, _address: &str, inscription_id: &str) -> Result<InscriptionUtxo> {
        self.utxos
            .lock()
            .unwrap()
            .get(inscription_id)
            .cloned()
            .with_context(|| format!("no utxo for inscription {inscription_id}"))
    }

    fn ticker_balance(&self, address: &str, ticker: &str) -> Result<u128> {
        if let Some(balance) = self
            .balances
            .lock()
            .unwrap()
            .get(&(address.to_string(), ticker.to_string()))
        {
            return Ok(*balance);
        }
        // fall back to the transferable total
        Ok(self
            .transferable(address, ticker)?
            .iter()
            .map(|t| t.amount)
            .sum())
    }

    fn create_transfer_order(
        &self,
        _address: &str,
        _fee_rate: FeeRate,
        _ticker: &str,
        _amount: u128,
    ) -> Result<TransferOrder> {
        let pay_address = self
            .order_pay_address
            .lock()
            .unwrap()
            .clone()
            .context("order pay address not configured")?;
        let mut orders = self.orders.lock().unwrap();
        let order = TransferOrder {
            order_id: format!("order-{}", orders.len()),
            pay_address,
            amount_sats: 5_000,
        };
        orders.push(order.clone());
        Ok(order)
    }
}

#[derive(Default)]
pub struct RecordingBus {
    pub events: Mutex<Vec<PoolEvent>>,
}

impl NotificationBus for RecordingBus {
    fn pool_changed(&self, event: &PoolEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub engine: SwapEngine,
    pub store: Arc<Mutex<SqliteStore>>,
    pub index: Arc<MockIndex>,
    pub inscriptions: Arc<MockInscriptions>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub bus: Arc<RecordingBus>,
    _dir: tempfile::TempDir,
}

pub fn harness(lock_lease: Duration) -> Result<Harness> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let store = Arc::new(Mutex::new(
        SqliteStore::open(dir.path().join("pools.sqlite")).context("open store")?,
    ));
    let index = Arc::new(MockIndex::default());
    let inscriptions = Arc::new(MockInscriptions::default());
    let broadcaster = Arc::new(MockBroadcaster::default());
    let bus = Arc::new(RecordingBus::default());

    let cfg = EngineConfig {
        network: Network::Regtest,
        postage_sats: 546,
        min_btc_candidate_sats: 1_000,
        lock_lease,
        settle_delay: Duration::ZERO,
    };

    let engine = SwapEngine::new(
        cfg,
        store.clone(),
        index.clone(),
        Arc::new(FixedFeeOracle(1.0)),
        inscriptions.clone(),
        broadcaster.clone(),
        bus.clone(),
    );

    Ok(Harness {
        engine,
        store,
        index,
        inscriptions,
        broadcaster,
        bus,
        _dir: dir,
    })
}

impl Harness {
    pub fn insert_rune_pool(
        &self,
        owner: &Party,
        divisibility: u8,
        asset_amount: u128,
        btc_sats: u64,
    ) -> Result<PoolRecord> {
        let pool = PoolRecord {
            address: owner.address.to_string(),
            asset: PoolAsset::Rune {
                id: test_rune(),
                divisibility,
            },
            pubkey: owner.xonly.to_string(),
            private_key: owner.key.to_wif(),
            asset_amount,
            btc_sats,
            volume_sats: 0,
            lock: None,
            pending: None,
        };
        self.store
            .lock()
            .unwrap()
            .insert_pool(&pool)
            .context("insert rune pool")?;
        Ok(pool)
    }

    pub fn insert_brc20_pool(
        &self,
        owner: &Party,
        ticker: &str,
        asset_amount: u128,
        btc_sats: u64,
    ) -> Result<PoolRecord> {
        let pool = PoolRecord {
            address: owner.address.to_string(),
            asset: PoolAsset::Brc20 {
                ticker: ticker.to_string(),
            },
            pubkey: owner.xonly.to_string(),
            private_key: owner.key.to_wif(),
            asset_amount,
            btc_sats,
            volume_sats: 0,
            lock: None,
            pending: None,
        };
        self.store
            .lock()
            .unwrap()
            .insert_pool(&pool)
            .context("insert brc20 pool")?;
        Ok(pool)
    }

    pub fn pool(&self, address: &str) -> Result<PoolRecord> {
        self.store
            .lock()
            .unwrap()
            .get_pool(address)?
            .context("pool missing")
    }

    pub fn lock_owner(&self, address: &str) -> Result<Option<String>> {
        Ok(self.pool(address)?.lock.map(|l| l.owner))
    }
}

/// Signs the user-owned template positions the way a client wallet would.
pub fn sign_as_user(psbt_hex: &str, user_inputs: &[usize], key: &PrivateKey) -> Result<String> {
    let mut psbt = psbt_from_hex(psbt_hex)?;
    sign_key_spend(&mut psbt, user_inputs, key)?;
    Ok(hex::encode(psbt.serialize()))
}

pub fn finalize_request(
    pool: &PoolRecord,
    user: &Party,
    payload: &TemplatePayload,
    user_signed_psbt_hex: String,
) -> FinalizeRequest {
    FinalizeRequest {
        pool_address: pool.address.clone(),
        user_address: user.address.to_string(),
        template_psbt_hex: payload.psbt_hex.clone(),
        user_signed_psbt_hex,
        user_inputs: payload.user_inputs.clone(),
        pool_inputs: payload.pool_inputs.clone(),
    }
}

pub fn script_of(address: &Address) -> ScriptBuf {
    address.script_pubkey()
}
