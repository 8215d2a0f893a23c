use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::transaction::Version;
use bitcoin::{OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// Which co-signer owns (and must sign) a template input position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOwner {
    User,
    Pool,
}

#[derive(Debug, Clone)]
pub struct TemplateInput {
    pub outpoint: OutPoint,
    pub witness_utxo: TxOut,
    pub tap_internal_key: XOnlyPublicKey,
    pub owner: InputOwner,
}

/// The unsigned swap transaction both parties must co-sign. Immutable once
/// handed to the client; its identity is the unsigned transaction's txid,
/// which commits to the exact input and output sequence.
#[derive(Debug, Clone)]
pub struct SwapTemplate {
    pub inputs: Vec<TemplateInput>,
    pub outputs: Vec<TxOut>,
}

impl SwapTemplate {
    pub fn unsigned_tx(&self) -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Default::default(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }

    pub fn fingerprint(&self) -> Txid {
        self.unsigned_tx().compute_txid()
    }

    pub fn to_psbt(&self) -> Result<Psbt> {
        let mut psbt =
            Psbt::from_unsigned_tx(self.unsigned_tx()).context("build psbt from unsigned tx")?;

        for (psbt_input, input) in psbt.inputs.iter_mut().zip(&self.inputs) {
            psbt_input.witness_utxo = Some(input.witness_utxo.clone());
            psbt_input.tap_internal_key = Some(input.tap_internal_key);
        }

        Ok(psbt)
    }

    pub fn psbt_hex(&self) -> Result<String> {
        Ok(hex::encode(self.to_psbt()?.serialize()))
    }

    pub fn positions(&self, owner: InputOwner) -> Vec<usize> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.owner == owner)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn owners(&self) -> Vec<InputOwner> {
        self.inputs.iter().map(|input| input.owner).collect()
    }
}

pub fn psbt_from_hex(psbt_hex: &str) -> Result<Psbt> {
    let bytes = hex::decode(psbt_hex).context("decode psbt hex")?;
    Psbt::deserialize(&bytes).context("deserialize psbt")
}

/// Canonical fingerprint of a partially signed copy: the txid of its
/// unsigned transaction, which witness data cannot change.
pub fn unsigned_txid(psbt: &Psbt) -> Txid {
    psbt.unsigned_tx.compute_txid()
}
