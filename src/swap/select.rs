use std::collections::HashSet;
use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::{OutPoint, ScriptBuf, Txid};

use crate::index::RuneUtxo;
use crate::pool::TxRecord;

/// One selectable asset-side candidate, in source order: primary index
/// results first, then audit-ledger recovery entries.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
    pub asset_amount: u128,
    /// True when the candidate came from the recovery pass rather than the
    /// external index.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub picked: Vec<Candidate>,
    pub total: u128,
}

/// Selects the first prefix of `candidates` whose cumulative asset amount
/// reaches or exceeds `target`. Not necessarily minimal; candidates after
/// the prefix are never considered.
pub fn select_prefix(candidates: &[Candidate], target: u128) -> Option<Selection> {
    let mut picked = Vec::new();
    let mut total: u128 = 0;

    for candidate in candidates {
        if total >= target {
            break;
        }
        total = total.saturating_add(candidate.asset_amount);
        picked.push(candidate.clone());
    }

    (total >= target).then_some(Selection { picked, total })
}

/// Orders and filters the asset-side candidate list: primary index results,
/// then not-yet-indexed pool change outputs from the audit ledger, with
/// anything already committed by the reservation ledger excluded from both
/// passes. Recovery entries duplicating a primary txid are dropped.
pub fn assemble_rune_candidates(
    primary: Vec<RuneUtxo>,
    recovery: Vec<TxRecord>,
    postage_sats: u64,
    owner_script: &ScriptBuf,
    mut is_reserved: impl FnMut(&str) -> Result<bool>,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    let mut seen: HashSet<Txid> = HashSet::new();

    for utxo in primary {
        if is_reserved(&utxo.outpoint.txid.to_string())? {
            continue;
        }
        seen.insert(utxo.outpoint.txid);
        out.push(Candidate {
            outpoint: utxo.outpoint,
            value_sats: utxo.value_sats,
            script_pubkey: utxo.script_pubkey,
            asset_amount: utxo.rune_amount,
            recovered: false,
        });
    }

    for record in recovery {
        let txid = Txid::from_str(&record.txid)
            .with_context(|| format!("parse audit ledger txid {}", record.txid))?;
        if seen.contains(&txid) || is_reserved(&record.txid)? {
            continue;
        }
        out.push(Candidate {
            outpoint: OutPoint {
                txid,
                vout: record.vout,
            },
            value_sats: postage_sats,
            script_pubkey: owner_script.clone(),
            asset_amount: record.asset_amount,
            recovered: true,
        });
    }

    Ok(out)
}
