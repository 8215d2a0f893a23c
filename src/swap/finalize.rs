use std::collections::HashSet;

use bitcoin::{PrivateKey, ScriptBuf, Transaction};

use crate::chain::sign::{finalize_key_spend, merged_transaction, sign_key_spend};
use crate::chain::template::{InputOwner, psbt_from_hex, unsigned_txid};
use crate::error::SwapError;

fn mismatch(reason: impl Into<String>) -> SwapError {
    SwapError::TemplateMismatch(reason.into())
}

/// Runs the merge half of the co-signing protocol: checks that both partial
/// copies resolve to the fingerprinted unsigned template, finalizes the
/// user-owned positions on the client's copy, signs and finalizes the
/// pool-owned positions on the server's own copy, and merges the final
/// witnesses by position. The client-supplied template is never trusted
/// directly; it must match the fingerprint persisted at generation time.
pub(crate) fn verify_and_merge(
    template_psbt_hex: &str,
    user_signed_psbt_hex: &str,
    expected_fingerprint: &str,
    user_inputs: &[usize],
    pool_inputs: &[usize],
    pool_script: &ScriptBuf,
    pool_key: &PrivateKey,
) -> Result<Transaction, SwapError> {
    let mut pool_copy =
        psbt_from_hex(template_psbt_hex).map_err(|e| mismatch(format!("template copy: {e:#}")))?;
    let mut user_copy = psbt_from_hex(user_signed_psbt_hex)
        .map_err(|e| mismatch(format!("user signed copy: {e:#}")))?;

    let template_fp = unsigned_txid(&pool_copy).to_string();
    let user_fp = unsigned_txid(&user_copy).to_string();

    if template_fp != expected_fingerprint {
        return Err(mismatch(format!(
            "template fingerprint {template_fp} does not match generated {expected_fingerprint}"
        )));
    }
    if user_fp != expected_fingerprint {
        return Err(mismatch(format!(
            "user copy fingerprint {user_fp} does not match generated {expected_fingerprint}"
        )));
    }

    let input_count = pool_copy.unsigned_tx.input.len();
    let mut owners = vec![None; input_count];
    for &index in user_inputs {
        let slot = owners
            .get_mut(index)
            .ok_or_else(|| mismatch(format!("user input index {index} out of range")))?;
        *slot = Some(InputOwner::User);
    }
    for &index in pool_inputs {
        let slot = owners
            .get_mut(index)
            .ok_or_else(|| mismatch(format!("pool input index {index} out of range")))?;
        if slot.is_some() {
            return Err(mismatch(format!("input {index} claimed by both parties")));
        }
        *slot = Some(InputOwner::Pool);
    }
    let owners: Vec<InputOwner> = owners
        .into_iter()
        .enumerate()
        .map(|(index, owner)| owner.ok_or_else(|| mismatch(format!("input {index} has no owner"))))
        .collect::<Result<_, _>>()?;

    // The index arrays come from the client; the witness utxos inside the
    // fingerprinted template decide which positions the pool may sign.
    let pool_set: HashSet<usize> = pool_inputs.iter().copied().collect();
    for (index, input) in pool_copy.inputs.iter().enumerate() {
        let script = input
            .witness_utxo
            .as_ref()
            .map(|utxo| &utxo.script_pubkey)
            .ok_or_else(|| mismatch(format!("input {index} is missing its witness utxo")))?;
        let pool_owned = script == pool_script;
        if pool_owned != pool_set.contains(&index) {
            return Err(mismatch(format!(
                "input {index} ownership does not match its witness utxo"
            )));
        }
    }

    for &index in user_inputs {
        finalize_key_spend(&mut user_copy, index)
            .map_err(|e| mismatch(format!("finalize user input {index}: {e:#}")))?;
    }

    sign_key_spend(&mut pool_copy, pool_inputs, pool_key)?;

    let unsigned_tx = pool_copy.unsigned_tx.clone();
    let tx = merged_transaction(&unsigned_tx, &user_copy, &pool_copy, &owners)?;
    Ok(tx)
}
