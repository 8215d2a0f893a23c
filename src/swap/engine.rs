use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::{Address, Amount, Network, PrivateKey, ScriptBuf, TxOut};

use crate::chain::sign::{merged_transaction, sign_key_spend};
use crate::chain::template::{InputOwner, psbt_from_hex};
use crate::chain::unix_millis;
use crate::error::{Envelope, SwapError};
use crate::index::{
    Broadcaster, FeeOracle, InscriptionIndex, NotificationBus, PoolEvent, TransferOrder,
    TransferableInscription, UtxoIndex,
};
use crate::pool::{BalanceDelta, PendingSwap, PoolAsset, PoolRecord, TxRecord};
use crate::swap::build::{POOL_RUNE_VOUT, TemplateBuilder, USER_RUNE_VOUT};
use crate::swap::finalize::verify_and_merge;
use crate::swap::lock::LockManager;
use crate::swap::select::{assemble_rune_candidates, select_prefix};
use crate::swap::store::SqliteStore;
use crate::swap::{
    Brc20Status, Brc20SwapRequest, Brc20TemplatePayload, FinalizePayload, FinalizeRequest,
    OrderPayload, RuneSwapRequest, SwapDirection, SwapKind, TemplatePayload,
};
use tracing::Instrument as _;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: Network,
    /// Value carried by every asset postage output.
    pub postage_sats: u64,
    /// BTC candidates below this value are skipped during covering.
    pub min_btc_candidate_sats: u64,
    /// Maximum duration one workflow may hold a pool lease.
    pub lock_lease: Duration,
    /// Fixed wait after a dependent broadcast before the inscription
    /// service is queried again.
    pub settle_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            postage_sats: 546,
            min_btc_candidate_sats: 1_000,
            lock_lease: Duration::from_secs(60),
            settle_delay: Duration::from_secs(15),
        }
    }
}

/// The swap orchestration engine: template generation, co-signing
/// finalization, and the resulting ledger commits, across all four swap
/// pipelines. Independent pools proceed in parallel; within one pool the
/// lease serializes the whole multi-call workflow.
pub struct SwapEngine {
    cfg: EngineConfig,
    store: Arc<Mutex<SqliteStore>>,
    utxos: Arc<dyn UtxoIndex>,
    fees: Arc<dyn FeeOracle>,
    inscriptions: Arc<dyn InscriptionIndex>,
    broadcaster: Arc<dyn Broadcaster>,
    bus: Arc<dyn NotificationBus>,
    locks: LockManager,
}

impl SwapEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        store: Arc<Mutex<SqliteStore>>,
        utxos: Arc<dyn UtxoIndex>,
        fees: Arc<dyn FeeOracle>,
        inscriptions: Arc<dyn InscriptionIndex>,
        broadcaster: Arc<dyn Broadcaster>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        let locks = LockManager::new(store.clone(), cfg.lock_lease);
        Self {
            cfg,
            store,
            utxos,
            fees,
            inscriptions,
            broadcaster,
            bus,
            locks,
        }
    }

    fn load_pool(&self, address: &str) -> Result<PoolRecord, SwapError> {
        let pool = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_pool(address)
            .context("load pool")?;
        pool.ok_or_else(|| SwapError::PoolNotFound(address.to_string()))
    }

    fn script_of(&self, address: &str) -> Result<ScriptBuf, SwapError> {
        let address = Address::from_str(address)
            .and_then(|a| a.require_network(self.cfg.network))
            .with_context(|| format!("parse address {address}"))?;
        Ok(address.script_pubkey())
    }

    fn user_key(&self, pubkey_hex: &str) -> Result<XOnlyPublicKey, SwapError> {
        Ok(XOnlyPublicKey::from_str(pubkey_hex).context("parse user pubkey")?)
    }

    /// Rejects early when another workflow's live lease holds the pool,
    /// then takes the lease for this user.
    fn take_lease(&self, pool: &PoolRecord, user_address: &str) -> Result<(), SwapError> {
        if let Some(holder) = self.locks.holder(pool)
            && holder != user_address
        {
            return Err(SwapError::PoolLocked {
                pool: pool.address.clone(),
                holder,
            });
        }
        self.locks.acquire(pool, user_address)
    }

    // ---- rune pipelines -------------------------------------------------

    pub async fn build_rune_swap(&self, req: &RuneSwapRequest) -> Envelope<TemplatePayload> {
        let span = tracing::info_span!("build_rune_swap", request_id = %Uuid::new_v4());
        let result = span.in_scope(|| self.build_rune_swap_inner(req));
        if let Err(err) = &result {
            tracing::warn!(pool = %req.pool_address, user = %req.user_address, error = %err, "rune swap template failed");
        }
        Envelope::from_result("swap template generated", result)
    }

    fn build_rune_swap_inner(&self, req: &RuneSwapRequest) -> Result<TemplatePayload, SwapError> {
        let pool = self.load_pool(&req.pool_address)?;
        let (rune_id, divisibility) = pool
            .rune()
            .ok_or_else(|| anyhow!("pool {} does not hold a rune", pool.address))
            .map_err(SwapError::External)?;

        self.take_lease(&pool, &req.user_address)?;

        let kind = match req.direction {
            SwapDirection::BuyAsset => SwapKind::BuyRune,
            SwapDirection::SellAsset => SwapKind::SellRune,
        };

        let built = self.build_rune_template(&pool, rune_id, divisibility, req);
        match built {
            Ok(payload) => {
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .set_pending_swap(&pool.address, &pending_of(kind, &payload))
                    .context("persist pending swap")
                    .inspect_err(|_| {
                        let _ = self.locks.release(&pool.address);
                    })?;
                Ok(payload)
            }
            Err(err) => {
                let _ = self.locks.release(&pool.address);
                Err(err)
            }
        }
    }

    fn build_rune_template(
        &self,
        pool: &PoolRecord,
        rune_id: ordinals::RuneId,
        divisibility: u8,
        req: &RuneSwapRequest,
    ) -> Result<TemplatePayload, SwapError> {
        let pool_script = self.script_of(&pool.address)?;
        let user_script = self.script_of(&req.user_address)?;
        let pool_key = pool.x_only_pubkey().map_err(SwapError::External)?;
        let user_key = self.user_key(&req.user_pubkey)?;

        let required = (req.asset_amount as u128)
            .checked_mul(10u128.pow(divisibility as u32))
            .ok_or_else(|| anyhow!("requested rune amount overflows its divisibility"))
            .map_err(SwapError::External)?;

        let fee_rate = self
            .fees
            .current_fee_rate()
            .context("query fee oracle")?;

        let (asset_address, asset_owner, asset_script, asset_tap) = match req.direction {
            SwapDirection::BuyAsset => {
                (pool.address.as_str(), InputOwner::Pool, &pool_script, pool_key)
            }
            SwapDirection::SellAsset => (
                req.user_address.as_str(),
                InputOwner::User,
                &user_script,
                user_key,
            ),
        };

        let primary = self
            .utxos
            .rune_utxos(asset_address, rune_id)
            .context("list rune utxos")?;

        // The recovery pass only applies to pool-owned liquidity: change
        // outputs the engine itself committed but the index has not seen.
        let recovery = match req.direction {
            SwapDirection::BuyAsset => self
                .store
                .lock()
                .expect("store mutex poisoned")
                .unused_pool_change(&pool.address)
                .context("list audit ledger change")?,
            SwapDirection::SellAsset => Vec::new(),
        };

        let candidates = assemble_rune_candidates(
            primary,
            recovery,
            self.cfg.postage_sats,
            asset_script,
            |txid| {
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .is_reserved(txid)
            },
        )
        .context("assemble rune candidates")?;

        let available: u128 = candidates.iter().map(|c| c.asset_amount).sum();
        let selection = select_prefix(&candidates, required).ok_or_else(|| {
            SwapError::InsufficientAssetBalance {
                asset: pool.asset.label(),
                available,
                required,
            }
        })?;
        let surplus = selection.total - required;

        let used_txids: Vec<String> = selection
            .picked
            .iter()
            .filter(|c| c.recovered)
            .map(|c| c.outpoint.txid.to_string())
            .collect();

        let mut builder = TemplateBuilder::new(
            self.cfg.postage_sats,
            self.cfg.min_btc_candidate_sats,
            fee_rate,
        );
        builder.push_asset_inputs(asset_owner, &selection.picked, asset_tap);

        // Output 0 is the runestone; the required amount moves to the
        // counterparty's postage output, the surplus returns to the sender's.
        let (required_vout, surplus_vout) = match req.direction {
            SwapDirection::BuyAsset => (USER_RUNE_VOUT, POOL_RUNE_VOUT),
            SwapDirection::SellAsset => (POOL_RUNE_VOUT, USER_RUNE_VOUT),
        };
        builder.push_runestone(rune_id, required, surplus, required_vout, surplus_vout);
        builder.push_postage_output(user_script.clone());
        builder.push_postage_output(pool_script.clone());

        let fee_sats = match req.direction {
            SwapDirection::BuyAsset => {
                builder.push_output(pool_script.clone(), req.btc_sats);
                let user_btc = self
                    .utxos
                    .btc_utxos(&req.user_address)
                    .context("list user btc utxos")?;
                builder
                    .cover_btc_and_fee(
                        InputOwner::User,
                        req.btc_sats,
                        &user_btc,
                        user_key,
                        &user_script,
                    )?
                    .fee_sats
            }
            SwapDirection::SellAsset => {
                builder.push_output(user_script.clone(), req.btc_sats);
                let pool_btc = self
                    .utxos
                    .btc_utxos(&pool.address)
                    .context("list pool btc utxos")?;
                builder.cover_btc_exact(
                    InputOwner::Pool,
                    req.btc_sats,
                    &pool_btc,
                    pool_key,
                    &pool_script,
                )?;
                let user_btc = self
                    .utxos
                    .btc_utxos(&req.user_address)
                    .context("list user btc utxos")?;
                builder
                    .cover_btc_and_fee(InputOwner::User, 0, &user_btc, user_key, &user_script)?
                    .fee_sats
            }
        };

        let template = builder.finish();
        let (user_asset_amount, pool_asset_amount) = match req.direction {
            SwapDirection::BuyAsset => (required, surplus),
            SwapDirection::SellAsset => (surplus, required),
        };

        let payload = TemplatePayload {
            psbt_hex: template.psbt_hex().map_err(SwapError::External)?,
            fingerprint: template.fingerprint().to_string(),
            user_inputs: template.positions(InputOwner::User),
            pool_inputs: template.positions(InputOwner::Pool),
            used_txids,
            user_asset_amount,
            pool_asset_amount,
            btc_sats: req.btc_sats,
            fee_sats,
        };

        tracing::info!(
            pool = %pool.address,
            user = %req.user_address,
            fingerprint = %payload.fingerprint,
            fee_sats,
            "rune swap template generated"
        );
        Ok(payload)
    }

    // ---- brc20 pipelines ------------------------------------------------

    pub async fn build_brc20_swap(&self, req: &Brc20SwapRequest) -> Envelope<Brc20TemplatePayload> {
        let span = tracing::info_span!("build_brc20_swap", request_id = %Uuid::new_v4());
        let result = self.build_brc20_swap_inner(req).instrument(span).await;
        if let Err(err) = &result {
            tracing::warn!(pool = %req.pool_address, user = %req.user_address, error = %err, "brc20 swap failed");
        }
        Envelope::from_result("brc20 swap processed", result)
    }

    async fn build_brc20_swap_inner(
        &self,
        req: &Brc20SwapRequest,
    ) -> Result<Brc20TemplatePayload, SwapError> {
        let pool = self.load_pool(&req.pool_address)?;
        let PoolAsset::Brc20 { ticker } = pool.asset.clone() else {
            return Err(SwapError::External(anyhow!(
                "pool {} does not hold a brc20 token",
                pool.address
            )));
        };

        let inventory_address = match req.direction {
            SwapDirection::SellAsset => req.user_address.as_str(),
            SwapDirection::BuyAsset => pool.address.as_str(),
        };

        let transferable = self
            .inscriptions
            .transferable(inventory_address, &ticker)
            .context("list transferable inscriptions")?;
        let matching = transferable
            .into_iter()
            .find(|inscription| inscription.amount == req.amount);

        // Without a matching transfer inscription the swap cannot run yet:
        // emit the inscription-order artifact and leave the pool unlocked.
        let Some(inscription) = matching else {
            return self.build_inscribe_artifact(&pool, &ticker, req).await;
        };

        self.take_lease(&pool, &req.user_address)?;

        let kind = match req.direction {
            SwapDirection::BuyAsset => SwapKind::BuyBrc20,
            SwapDirection::SellAsset => SwapKind::SellBrc20,
        };

        match self.build_brc20_transfer(&pool, inventory_address, &inscription, req) {
            Ok(payload) => {
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .set_pending_swap(&pool.address, &pending_of(kind, &payload))
                    .context("persist pending swap")
                    .inspect_err(|_| {
                        let _ = self.locks.release(&pool.address);
                    })?;
                Ok(Brc20TemplatePayload {
                    status: Brc20Status::Transfer,
                    order: None,
                    template: Some(payload),
                })
            }
            Err(err) => {
                let _ = self.locks.release(&pool.address);
                Err(err)
            }
        }
    }

    fn build_brc20_transfer(
        &self,
        pool: &PoolRecord,
        inventory_address: &str,
        inscription: &TransferableInscription,
        req: &Brc20SwapRequest,
    ) -> Result<TemplatePayload, SwapError> {
        let pool_script = self.script_of(&pool.address)?;
        let user_script = self.script_of(&req.user_address)?;
        let pool_key = pool.x_only_pubkey().map_err(SwapError::External)?;
        let user_key = self.user_key(&req.user_pubkey)?;

        let utxo = self
            .inscriptions
            .inscription_utxo(inventory_address, &inscription.inscription_id)
            .context("fetch inscription utxo")?;

        let reserved = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .is_reserved(&utxo.outpoint.txid.to_string())
            .context("check inscription reservation")?;
        if reserved {
            return Err(SwapError::InscriptionMissing {
                address: inventory_address.to_string(),
                ticker: pool.asset.label(),
                amount: req.amount,
            });
        }

        let fee_rate = self
            .fees
            .current_fee_rate()
            .context("query fee oracle")?;

        let mut builder = TemplateBuilder::new(
            self.cfg.postage_sats,
            self.cfg.min_btc_candidate_sats,
            fee_rate,
        );

        let (inscription_owner, inscription_tap) = match req.direction {
            SwapDirection::SellAsset => (InputOwner::User, user_key),
            SwapDirection::BuyAsset => (InputOwner::Pool, pool_key),
        };
        builder.push_input(
            inscription_owner,
            utxo.outpoint,
            TxOut {
                value: Amount::from_sat(utxo.value_sats),
                script_pubkey: utxo.script_pubkey.clone(),
            },
            inscription_tap,
        );

        // The inscription forwards at its carried value to whoever receives
        // the token.
        let recipient_script = match req.direction {
            SwapDirection::BuyAsset => user_script.clone(),
            SwapDirection::SellAsset => pool_script.clone(),
        };
        builder.push_output(recipient_script, utxo.value_sats);

        let fee_sats = match req.direction {
            SwapDirection::BuyAsset => {
                builder.push_output(pool_script.clone(), req.btc_sats);
                let user_btc = self
                    .utxos
                    .btc_utxos(&req.user_address)
                    .context("list user btc utxos")?;
                builder
                    .cover_btc_and_fee(
                        InputOwner::User,
                        req.btc_sats,
                        &user_btc,
                        user_key,
                        &user_script,
                    )?
                    .fee_sats
            }
            SwapDirection::SellAsset => {
                builder.push_output(user_script.clone(), req.btc_sats);
                let pool_btc = self
                    .utxos
                    .btc_utxos(&pool.address)
                    .context("list pool btc utxos")?;
                builder.cover_btc_exact(
                    InputOwner::Pool,
                    req.btc_sats,
                    &pool_btc,
                    pool_key,
                    &pool_script,
                )?;
                let user_btc = self
                    .utxos
                    .btc_utxos(&req.user_address)
                    .context("list user btc utxos")?;
                builder
                    .cover_btc_and_fee(InputOwner::User, 0, &user_btc, user_key, &user_script)?
                    .fee_sats
            }
        };

        let template = builder.finish();
        let (user_asset_amount, pool_asset_amount) = match req.direction {
            SwapDirection::BuyAsset => (req.amount, 0),
            SwapDirection::SellAsset => (0, req.amount),
        };

        Ok(TemplatePayload {
            psbt_hex: template.psbt_hex().map_err(SwapError::External)?,
            fingerprint: template.fingerprint().to_string(),
            user_inputs: template.positions(InputOwner::User),
            pool_inputs: template.positions(InputOwner::Pool),
            used_txids: Vec::new(),
            user_asset_amount,
            pool_asset_amount,
            btc_sats: req.btc_sats,
            fee_sats,
        })
    }

    async fn build_inscribe_artifact(
        &self,
        pool: &PoolRecord,
        ticker: &str,
        req: &Brc20SwapRequest,
    ) -> Result<Brc20TemplatePayload, SwapError> {
        let fee_rate = self
            .fees
            .current_fee_rate()
            .context("query fee oracle")?;

        let inventory_address = match req.direction {
            SwapDirection::SellAsset => req.user_address.as_str(),
            SwapDirection::BuyAsset => pool.address.as_str(),
        };

        // No point inscribing a transfer the inventory side cannot back.
        let balance = self
            .inscriptions
            .ticker_balance(inventory_address, ticker)
            .context("query ticker balance")?;
        if balance < req.amount {
            return Err(SwapError::InsufficientAssetBalance {
                asset: ticker.to_string(),
                available: balance,
                required: req.amount,
            });
        }

        let order = self
            .inscriptions
            .create_transfer_order(inventory_address, fee_rate, ticker, req.amount)
            .context("create transfer order")?;
        let pay_script = self.script_of(&order.pay_address)?;

        let order_payload = OrderPayload {
            order_id: order.order_id.clone(),
            pay_address: order.pay_address.clone(),
            amount_sats: order.amount_sats,
        };

        match req.direction {
            SwapDirection::SellAsset => {
                // The user funds the order: hand back an all-user funding
                // template to sign and submit.
                let user_script = self.script_of(&req.user_address)?;
                let user_key = self.user_key(&req.user_pubkey)?;
                let user_btc = self
                    .utxos
                    .btc_utxos(&req.user_address)
                    .context("list user btc utxos")?;

                let mut builder = TemplateBuilder::new(
                    self.cfg.postage_sats,
                    self.cfg.min_btc_candidate_sats,
                    fee_rate,
                );
                builder.push_output(pay_script, order.amount_sats);
                let leg = builder.cover_btc_and_fee(
                    InputOwner::User,
                    order.amount_sats,
                    &user_btc,
                    user_key,
                    &user_script,
                )?;
                let template = builder.finish();

                tracing::info!(
                    pool = %pool.address,
                    user = %req.user_address,
                    order = %order.order_id,
                    "inscription order created, funding template returned"
                );

                Ok(Brc20TemplatePayload {
                    status: Brc20Status::Inscribe,
                    order: Some(order_payload),
                    template: Some(TemplatePayload {
                        psbt_hex: template.psbt_hex().map_err(SwapError::External)?,
                        fingerprint: template.fingerprint().to_string(),
                        user_inputs: template.positions(InputOwner::User),
                        pool_inputs: Vec::new(),
                        used_txids: Vec::new(),
                        user_asset_amount: 0,
                        pool_asset_amount: 0,
                        btc_sats: order.amount_sats,
                        fee_sats: leg.fee_sats,
                    }),
                })
            }
            SwapDirection::BuyAsset => {
                // The pool funds its own order: sign, broadcast, then wait
                // the fixed settle delay before the caller retries.
                self.fund_pool_order(pool, &order, &pay_script).await?;
                Ok(Brc20TemplatePayload {
                    status: Brc20Status::Inscribe,
                    order: Some(order_payload),
                    template: None,
                })
            }
        }
    }

    async fn fund_pool_order(
        &self,
        pool: &PoolRecord,
        order: &TransferOrder,
        pay_script: &ScriptBuf,
    ) -> Result<(), SwapError> {
        let pool_script = self.script_of(&pool.address)?;
        let pool_tap = pool.x_only_pubkey().map_err(SwapError::External)?;
        let pool_key = PrivateKey::from_wif(&pool.private_key)
            .context("parse pool private key")
            .map_err(SwapError::External)?;

        let fee_rate = self
            .fees
            .current_fee_rate()
            .context("query fee oracle")?;
        let pool_btc = self
            .utxos
            .btc_utxos(&pool.address)
            .context("list pool btc utxos")?;

        let mut builder = TemplateBuilder::new(
            self.cfg.postage_sats,
            self.cfg.min_btc_candidate_sats,
            fee_rate,
        );
        builder.push_output(pay_script.clone(), order.amount_sats);
        builder.cover_btc_and_fee(
            InputOwner::Pool,
            order.amount_sats,
            &pool_btc,
            pool_tap,
            &pool_script,
        )?;
        let template = builder.finish();

        let mut psbt = template.to_psbt().map_err(SwapError::External)?;
        sign_key_spend(&mut psbt, &template.positions(InputOwner::Pool), &pool_key)
            .map_err(SwapError::External)?;
        let tx = merged_transaction(&template.unsigned_tx(), &psbt, &psbt, &template.owners())
            .map_err(SwapError::External)?;

        let txid = self
            .broadcaster
            .submit(&tx)
            .map_err(|e| SwapError::BroadcastFailed(format!("{e:#}")))?;

        tracing::info!(
            pool = %pool.address,
            order = %order.order_id,
            txid = %txid,
            "pool inscription order funded"
        );

        tokio::time::sleep(self.cfg.settle_delay).await;
        Ok(())
    }

    // ---- finalization ---------------------------------------------------

    pub async fn finalize_swap(&self, req: &FinalizeRequest) -> Envelope<FinalizePayload> {
        let span = tracing::info_span!("finalize_swap", request_id = %Uuid::new_v4());
        let result = span.in_scope(|| self.finalize_swap_inner(req));
        if let Err(err) = &result {
            tracing::warn!(pool = %req.pool_address, user = %req.user_address, error = %err, "finalize failed");
        }
        Envelope::from_result("swap finalized and broadcast", result)
    }

    fn finalize_swap_inner(&self, req: &FinalizeRequest) -> Result<FinalizePayload, SwapError> {
        let pool = self.load_pool(&req.pool_address)?;

        let holder = self.locks.holder(&pool);
        if holder.as_deref() != Some(req.user_address.as_str()) {
            return Err(SwapError::PoolLocked {
                pool: pool.address.clone(),
                holder: holder.unwrap_or_else(|| "nobody".to_string()),
            });
        }

        // The persisted pending record is the single source of truth for
        // what this swap moves; the request only carries the signed copies.
        let pending = pool.pending.clone().ok_or_else(|| {
            SwapError::TemplateMismatch("no outstanding template for this pool".to_string())
        })?;

        let pool_script = self.script_of(&pool.address)?;
        let pool_key = PrivateKey::from_wif(&pool.private_key)
            .context("parse pool private key")
            .map_err(SwapError::External)?;

        let tx = match verify_and_merge(
            &req.template_psbt_hex,
            &req.user_signed_psbt_hex,
            &pending.fingerprint,
            &req.user_inputs,
            &req.pool_inputs,
            &pool_script,
            &pool_key,
        ) {
            Ok(tx) => tx,
            Err(err) => {
                let _ = self.locks.release(&pool.address);
                return Err(err);
            }
        };

        let txid = match self.broadcaster.submit(&tx) {
            Ok(txid) => txid,
            Err(err) => {
                // The one failure path with an external side effect already
                // attempted: no ledger state is committed without a txid.
                let _ = self.locks.release(&pool.address);
                return Err(SwapError::BroadcastFailed(format!("{err:#}")));
            }
        };

        let commit = self.commit_swap(&pool, &req.user_address, &pending, &tx, &txid.to_string());
        let _ = self.locks.release(&pool.address);
        commit?;

        if let Ok(Some(updated)) = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_pool(&pool.address)
        {
            self.bus.pool_changed(&PoolEvent {
                pool_address: updated.address.clone(),
                asset_amount: updated.asset_amount.to_string(),
                btc_sats: updated.btc_sats,
                volume_sats: updated.volume_sats,
                txid: txid.to_string(),
            });
        }

        tracing::info!(pool = %pool.address, user = %req.user_address, txid = %txid, "swap committed");
        Ok(FinalizePayload {
            txid: txid.to_string(),
        })
    }

    /// Ledger effects of a broadcast swap, applied in order: reservations
    /// for every consumed input, the signed balance delta, the audit
    /// record, and the used flags for recovered change.
    fn commit_swap(
        &self,
        pool: &PoolRecord,
        user_address: &str,
        pending: &PendingSwap,
        tx: &bitcoin::Transaction,
        txid: &str,
    ) -> Result<(), SwapError> {
        let delta = balance_delta(pending)?;

        let mut store = self.store.lock().expect("store mutex poisoned");

        for input in &tx.input {
            store
                .reserve(&input.previous_output.txid.to_string(), txid)
                .context("record reservation")?;
        }

        store
            .apply_balance_delta(&pool.address, &delta)
            .context("apply balance delta")?;

        let vout = match pending.kind {
            SwapKind::BuyRune | SwapKind::SellRune => POOL_RUNE_VOUT,
            SwapKind::BuyBrc20 | SwapKind::SellBrc20 => 0,
        };
        store
            .insert_tx_record(&TxRecord {
                pool_address: pool.address.clone(),
                user_address: user_address.to_string(),
                txid: txid.to_string(),
                kind: pending.kind,
                asset_amount: pending.pool_asset_amount,
                btc_sats: pending.btc_sats,
                vout,
                is_used: false,
                created_at_ms: unix_millis(),
            })
            .context("append audit record")?;

        store
            .mark_records_used(&pool.address, &pending.used_txids)
            .context("flag recovered change as used")?;

        Ok(())
    }

    /// Broadcasts a user-signed inscription funding transaction, then waits
    /// the fixed settle delay so the inscription service observes it before
    /// the caller retries the swap.
    pub async fn finalize_inscription_funding(
        &self,
        user_signed_psbt_hex: &str,
    ) -> Envelope<FinalizePayload> {
        let span = tracing::info_span!("finalize_funding", request_id = %Uuid::new_v4());
        let result = self
            .finalize_inscription_funding_inner(user_signed_psbt_hex)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "inscription funding broadcast failed");
        }
        Envelope::from_result("inscription funding broadcast", result)
    }

    async fn finalize_inscription_funding_inner(
        &self,
        user_signed_psbt_hex: &str,
    ) -> Result<FinalizePayload, SwapError> {
        let mut psbt = psbt_from_hex(user_signed_psbt_hex)
            .map_err(|e| SwapError::TemplateMismatch(format!("funding copy: {e:#}")))?;

        let owners = vec![InputOwner::User; psbt.inputs.len()];
        for index in 0..psbt.inputs.len() {
            crate::chain::sign::finalize_key_spend(&mut psbt, index)
                .map_err(|e| SwapError::TemplateMismatch(format!("{e:#}")))?;
        }
        let unsigned_tx = psbt.unsigned_tx.clone();
        let tx = merged_transaction(&unsigned_tx, &psbt, &psbt, &owners)
            .map_err(SwapError::External)?;

        let txid = self
            .broadcaster
            .submit(&tx)
            .map_err(|e| SwapError::BroadcastFailed(format!("{e:#}")))?;

        tracing::info!(txid = %txid, "inscription funding broadcast");
        tokio::time::sleep(self.cfg.settle_delay).await;

        Ok(FinalizePayload {
            txid: txid.to_string(),
        })
    }

    /// Explicit cancellation of an abandoned workflow: releases the lease
    /// when the caller holds it. Idempotent.
    pub async fn cancel_swap(&self, pool_address: &str, user_address: &str) -> Envelope<()> {
        let result = self.cancel_swap_inner(pool_address, user_address);
        Envelope::from_result("swap cancelled", result)
    }

    fn cancel_swap_inner(&self, pool_address: &str, user_address: &str) -> Result<(), SwapError> {
        let pool = self.load_pool(pool_address)?;
        if let Some(holder) = self.locks.holder(&pool)
            && holder == user_address
        {
            self.locks.release(&pool.address)?;
        }
        Ok(())
    }
}

fn pending_of(kind: SwapKind, payload: &TemplatePayload) -> PendingSwap {
    PendingSwap {
        fingerprint: payload.fingerprint.clone(),
        kind,
        user_asset_amount: payload.user_asset_amount,
        pool_asset_amount: payload.pool_asset_amount,
        btc_sats: payload.btc_sats,
        used_txids: payload.used_txids.clone(),
    }
}

fn balance_delta(pending: &PendingSwap) -> Result<BalanceDelta, SwapError> {
    let btc = i64::try_from(pending.btc_sats)
        .context("btc amount out of range")
        .map_err(SwapError::External)?;

    Ok(match pending.kind.direction() {
        SwapDirection::BuyAsset => BalanceDelta {
            asset: -(i128::try_from(pending.user_asset_amount)
                .context("asset amount out of range")
                .map_err(SwapError::External)?),
            btc,
            volume: pending.btc_sats,
        },
        SwapDirection::SellAsset => BalanceDelta {
            asset: i128::try_from(pending.pool_asset_amount)
                .context("asset amount out of range")
                .map_err(SwapError::External)?,
            btc: -btc,
            volume: pending.btc_sats,
        },
    })
}
