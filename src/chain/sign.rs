use anyhow::{Context as _, Result, bail, ensure};
use bitcoin::hashes::Hash as _;
use bitcoin::key::{Keypair, TapTweak as _};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::{PrivateKey, Psbt, TapSighashType, Transaction, TxOut, Witness};

use super::template::InputOwner;

fn all_prevouts(psbt: &Psbt) -> Result<Vec<TxOut>> {
    psbt.inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            input
                .witness_utxo
                .clone()
                .with_context(|| format!("input {i} is missing its witness utxo"))
        })
        .collect()
}

/// Signs and finalizes the given input positions as taproot key path spends.
/// The secret key is tweaked with the empty merkle root, matching the p2tr
/// addresses the pools and users hold funds on.
pub fn sign_key_spend(psbt: &mut Psbt, indices: &[usize], key: &PrivateKey) -> Result<()> {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, &key.inner);
    let tweaked = keypair.tap_tweak(&secp, None);

    let prevouts = all_prevouts(psbt)?;
    let unsigned_tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);

    for &index in indices {
        ensure!(
            index < psbt.inputs.len(),
            "input index {index} out of range ({} inputs)",
            psbt.inputs.len()
        );

        let sighash = cache
            .taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )
            .with_context(|| format!("compute key spend sighash for input {index}"))?;

        let message = Message::from_digest(sighash.to_byte_array());
        let signature = secp.sign_schnorr_no_aux_rand(&message, &tweaked.to_inner());

        psbt.inputs[index].tap_key_sig = Some(bitcoin::taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        });

        finalize_key_spend(psbt, index)?;
    }

    Ok(())
}

/// Converts a key path signature on the input into its final witness. Inputs
/// the counterparty wallet already finalized are left untouched.
pub fn finalize_key_spend(psbt: &mut Psbt, index: usize) -> Result<()> {
    ensure!(
        index < psbt.inputs.len(),
        "input index {index} out of range ({} inputs)",
        psbt.inputs.len()
    );

    let input = &mut psbt.inputs[index];
    if input.final_script_witness.is_some() {
        return Ok(());
    }

    let Some(signature) = input.tap_key_sig else {
        bail!("input {index} carries no key path signature to finalize");
    };

    input.final_script_witness = Some(Witness::p2tr_key_spend(&signature));
    Ok(())
}

/// Merges the two finalized copies into one broadcastable transaction: each
/// input's witness is taken from whichever party's copy owns that position.
pub fn merged_transaction(
    template: &Transaction,
    user_copy: &Psbt,
    pool_copy: &Psbt,
    owners: &[InputOwner],
) -> Result<Transaction> {
    ensure!(
        owners.len() == template.input.len(),
        "ownership map covers {} inputs, template has {}",
        owners.len(),
        template.input.len()
    );

    let mut tx = template.clone();
    for (index, owner) in owners.iter().enumerate() {
        let source = match owner {
            InputOwner::User => user_copy,
            InputOwner::Pool => pool_copy,
        };

        tx.input[index].witness = source
            .inputs
            .get(index)
            .and_then(|input| input.final_script_witness.clone())
            .with_context(|| format!("input {index} is missing its final witness"))?;
    }

    Ok(tx)
}
