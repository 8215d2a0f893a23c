use bitcoin::key::XOnlyPublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use ordinals::{Edict, RuneId, Runestone};

use crate::chain::fee::{FeeRate, estimate_vsize};
use crate::chain::template::{InputOwner, SwapTemplate, TemplateInput};
use crate::error::SwapError;
use crate::index::BtcUtxo;
use crate::swap::select::Candidate;

/// Fixed output positions of a rune swap template. The runestone sits at
/// output 0 and its edicts point at these.
pub const USER_RUNE_VOUT: u32 = 1;
pub const POOL_RUNE_VOUT: u32 = 2;

/// Accumulates a swap template input by input. Output set is fixed before
/// the BTC covering loop runs, so the projected fee can only grow as BTC
/// inputs are appended.
pub struct TemplateBuilder {
    postage: Amount,
    min_btc_candidate: Amount,
    fee_rate: FeeRate,
    inputs: Vec<TemplateInput>,
    outputs: Vec<TxOut>,
}

/// Result of covering one BTC leg.
#[derive(Debug, Clone, Copy)]
pub struct BtcLeg {
    pub selected_sats: u64,
    pub required_sats: u64,
    pub change_sats: u64,
    pub change_vout: u32,
    pub fee_sats: u64,
}

impl TemplateBuilder {
    pub fn new(postage_sats: u64, min_btc_candidate_sats: u64, fee_rate: FeeRate) -> Self {
        Self {
            postage: Amount::from_sat(postage_sats),
            min_btc_candidate: Amount::from_sat(min_btc_candidate_sats),
            fee_rate,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn push_input(
        &mut self,
        owner: InputOwner,
        outpoint: OutPoint,
        witness_utxo: TxOut,
        tap_internal_key: XOnlyPublicKey,
    ) -> usize {
        self.inputs.push(TemplateInput {
            outpoint,
            witness_utxo,
            tap_internal_key,
            owner,
        });
        self.inputs.len() - 1
    }

    /// Appends the selected asset-side candidates as inputs, returning their
    /// positional indices.
    pub fn push_asset_inputs(
        &mut self,
        owner: InputOwner,
        picked: &[Candidate],
        tap_internal_key: XOnlyPublicKey,
    ) -> Vec<usize> {
        picked
            .iter()
            .map(|candidate| {
                self.push_input(
                    owner,
                    candidate.outpoint,
                    TxOut {
                        value: Amount::from_sat(candidate.value_sats),
                        script_pubkey: candidate.script_pubkey.clone(),
                    },
                    tap_internal_key,
                )
            })
            .collect()
    }

    pub fn push_output(&mut self, script_pubkey: ScriptBuf, value_sats: u64) -> u32 {
        self.outputs.push(TxOut {
            value: Amount::from_sat(value_sats),
            script_pubkey,
        });
        (self.outputs.len() - 1) as u32
    }

    pub fn push_postage_output(&mut self, script_pubkey: ScriptBuf) -> u32 {
        self.push_output(script_pubkey, self.postage.to_sat())
    }

    /// Emits the data-carrying runestone output. Two edicts are always
    /// present, and `required + surplus` equals the selected input total by
    /// construction, so the encoding conserves the asset exactly.
    pub fn push_runestone(
        &mut self,
        rune: RuneId,
        required: u128,
        surplus: u128,
        required_vout: u32,
        surplus_vout: u32,
    ) -> u32 {
        let runestone = Runestone {
            edicts: vec![
                Edict {
                    id: rune,
                    amount: required,
                    output: required_vout,
                },
                Edict {
                    id: rune,
                    amount: surplus,
                    output: surplus_vout,
                },
            ],
            etching: None,
            mint: None,
            pointer: None,
        };

        self.outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: runestone.encipher(),
        });
        (self.outputs.len() - 1) as u32
    }

    fn projected_fee_sats(&self, change_script: &ScriptBuf) -> u64 {
        let mut outputs = self.outputs.clone();
        outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: change_script.clone(),
        });
        self.fee_rate
            .fee(estimate_vsize(self.inputs.len(), &outputs))
            .to_sat()
    }

    /// Covers `payment_sats` plus the network fee from `candidates`. The
    /// required total is recomputed from the projected transaction size on
    /// every iteration, so it grows monotonically as inputs are appended;
    /// this is a single forward pass, not a fixed-point solve. The change
    /// output returning `selected − required` is always appended, zero
    /// value included.
    pub fn cover_btc_and_fee(
        &mut self,
        owner: InputOwner,
        payment_sats: u64,
        candidates: &[BtcUtxo],
        tap_internal_key: XOnlyPublicKey,
        change_script: &ScriptBuf,
    ) -> Result<BtcLeg, SwapError> {
        let mut total: u64 = 0;
        let mut iter = candidates.iter();

        loop {
            let fee_sats = self.projected_fee_sats(change_script);
            let required_sats = payment_sats.saturating_add(fee_sats);

            if total >= required_sats {
                let change_sats = total - required_sats;
                let change_vout = self.push_output(change_script.clone(), change_sats);
                return Ok(BtcLeg {
                    selected_sats: total,
                    required_sats,
                    change_sats,
                    change_vout,
                    fee_sats,
                });
            }

            let Some(utxo) = iter.next() else {
                return Err(SwapError::InsufficientBtcBalance {
                    available: total,
                    required: required_sats,
                });
            };

            if Amount::from_sat(utxo.value_sats) < self.min_btc_candidate {
                continue;
            }

            self.push_input(
                owner,
                utxo.outpoint,
                TxOut {
                    value: Amount::from_sat(utxo.value_sats),
                    script_pubkey: utxo.script_pubkey.clone(),
                },
                tap_internal_key,
            );
            total = total.saturating_add(utxo.value_sats);
        }
    }

    /// Covers an exact BTC target without a fee component (the payout leg;
    /// the fee is carried by the counterparty's leg). Appends the leg's
    /// change output.
    pub fn cover_btc_exact(
        &mut self,
        owner: InputOwner,
        target_sats: u64,
        candidates: &[BtcUtxo],
        tap_internal_key: XOnlyPublicKey,
        change_script: &ScriptBuf,
    ) -> Result<BtcLeg, SwapError> {
        let mut total: u64 = 0;

        for utxo in candidates {
            if total >= target_sats {
                break;
            }
            if Amount::from_sat(utxo.value_sats) < self.min_btc_candidate {
                continue;
            }
            self.push_input(
                owner,
                utxo.outpoint,
                TxOut {
                    value: Amount::from_sat(utxo.value_sats),
                    script_pubkey: utxo.script_pubkey.clone(),
                },
                tap_internal_key,
            );
            total = total.saturating_add(utxo.value_sats);
        }

        if total < target_sats {
            return Err(SwapError::InsufficientBtcBalance {
                available: total,
                required: target_sats,
            });
        }

        let change_sats = total - target_sats;
        let change_vout = self.push_output(change_script.clone(), change_sats);
        Ok(BtcLeg {
            selected_sats: total,
            required_sats: target_sats,
            change_sats,
            change_vout,
            fee_sats: 0,
        })
    }

    pub fn finish(self) -> SwapTemplate {
        SwapTemplate {
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}
