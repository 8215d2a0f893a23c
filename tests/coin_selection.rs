use std::collections::HashSet;

use anyhow::Result;
use bitcoin::ScriptBuf;
use bitcoin::hashes::Hash as _;
use bitcoin::{OutPoint, Txid};

use btc_pool_swap::chain::fee::{FeeRate, estimate_vsize};
use btc_pool_swap::chain::template::InputOwner;
use btc_pool_swap::index::{BtcUtxo, RuneUtxo};
use btc_pool_swap::pool::TxRecord;
use btc_pool_swap::swap::SwapKind;
use btc_pool_swap::swap::build::TemplateBuilder;
use btc_pool_swap::swap::select::{Candidate, assemble_rune_candidates, select_prefix};

fn outpoint(tag: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([tag; 32]),
        vout: 1,
    }
}

fn candidate(tag: u8, asset_amount: u128) -> Candidate {
    Candidate {
        outpoint: outpoint(tag),
        value_sats: 546,
        script_pubkey: ScriptBuf::new(),
        asset_amount,
        recovered: false,
    }
}

fn rune_utxo(tag: u8, rune_amount: u128) -> RuneUtxo {
    RuneUtxo {
        outpoint: outpoint(tag),
        value_sats: 546,
        script_pubkey: ScriptBuf::new(),
        rune_amount,
    }
}

fn change_record(txid: &str, asset_amount: u128) -> TxRecord {
    TxRecord {
        pool_address: "pool-a".to_string(),
        user_address: "user-a".to_string(),
        txid: txid.to_string(),
        kind: SwapKind::BuyRune,
        asset_amount,
        btc_sats: 10_000,
        vout: 2,
        is_used: false,
        created_at_ms: 1,
    }
}

#[test]
fn prefix_selection_is_deterministic() {
    // 100 + 200 reaches 250; the trailing 50 is never considered even
    // though 200 + 50 would be a tighter pick
    let candidates = vec![candidate(1, 100), candidate(2, 200), candidate(3, 50)];
    let selection = select_prefix(&candidates, 250).unwrap();
    assert_eq!(selection.total, 300);
    assert_eq!(
        selection.picked.iter().map(|c| c.asset_amount).collect::<Vec<_>>(),
        vec![100, 200]
    );
}

#[test]
fn prefix_selection_stops_at_exact_target() {
    let candidates = vec![candidate(1, 100), candidate(2, 150), candidate(3, 75)];
    let selection = select_prefix(&candidates, 250).unwrap();
    assert_eq!(selection.total, 250);
    assert_eq!(selection.picked.len(), 2);
}

#[test]
fn prefix_selection_fails_when_short() {
    let candidates = vec![candidate(1, 100), candidate(2, 100)];
    assert!(select_prefix(&candidates, 250).is_none());
    assert!(select_prefix(&[], 1).is_none());
}

#[test]
fn zero_target_selects_nothing() {
    let candidates = vec![candidate(1, 100)];
    let selection = select_prefix(&candidates, 0).unwrap();
    assert!(selection.picked.is_empty());
}

#[test]
fn assembly_filters_reserved_and_appends_recovery() -> Result<()> {
    let owner_script = ScriptBuf::from_bytes(vec![0x51]);
    let reserved: HashSet<String> = [outpoint(2).txid.to_string()].into();

    let primary = vec![rune_utxo(1, 600), rune_utxo(2, 500)];
    let recovery = vec![change_record(&Txid::from_byte_array([9; 32]).to_string(), 300)];

    let candidates = assemble_rune_candidates(primary, recovery, 546, &owner_script, |txid| {
        Ok(reserved.contains(txid))
    })?;

    // reserved primary is gone; recovery entry trails the remaining primary
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].asset_amount, 600);
    assert!(!candidates[0].recovered);

    assert_eq!(candidates[1].asset_amount, 300);
    assert!(candidates[1].recovered);
    assert_eq!(candidates[1].value_sats, 546);
    assert_eq!(candidates[1].script_pubkey, owner_script);
    assert_eq!(candidates[1].outpoint.vout, 2);
    Ok(())
}

#[test]
fn assembly_drops_recovery_duplicating_primary() -> Result<()> {
    let owner_script = ScriptBuf::new();
    let primary = vec![rune_utxo(1, 600)];
    // same txid as the primary utxo: the index caught up, keep its copy
    let recovery = vec![change_record(&outpoint(1).txid.to_string(), 600)];

    let candidates =
        assemble_rune_candidates(primary, recovery, 546, &owner_script, |_| Ok(false))?;
    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].recovered);
    Ok(())
}

#[test]
fn assembly_filters_reserved_recovery() -> Result<()> {
    let owner_script = ScriptBuf::new();
    let txid = Txid::from_byte_array([9; 32]).to_string();
    let recovery = vec![change_record(&txid, 300)];

    let candidates =
        assemble_rune_candidates(Vec::new(), recovery, 546, &owner_script, |t| {
            Ok(t == txid)
        })?;
    assert!(candidates.is_empty());
    Ok(())
}

fn builder_key() -> bitcoin::key::XOnlyPublicKey {
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let sk = bitcoin::secp256k1::SecretKey::from_slice(&[7u8; 32]).unwrap();
    sk.x_only_public_key(&secp).0
}

#[test]
fn exact_btc_cover_still_emits_the_zero_value_change() -> Result<()> {
    let pay_script = ScriptBuf::from_bytes(vec![0x51; 34]);
    let change_script = ScriptBuf::from_bytes(vec![0x52; 34]);
    let fee_rate = FeeRate::try_from(1.0)?;

    // projected output set after one input: the payment plus zero change
    let projected = vec![
        bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(10_000),
            script_pubkey: pay_script.clone(),
        },
        bitcoin::TxOut {
            value: bitcoin::Amount::ZERO,
            script_pubkey: change_script.clone(),
        },
    ];
    let fee_sats = fee_rate.fee(estimate_vsize(1, &projected)).to_sat();

    let mut builder = TemplateBuilder::new(546, 1_000, fee_rate);
    builder.push_output(pay_script, 10_000);

    // one candidate worth exactly payment + fee
    let candidates = vec![BtcUtxo {
        outpoint: outpoint(9),
        value_sats: 10_000 + fee_sats,
        script_pubkey: change_script.clone(),
    }];
    let leg = builder.cover_btc_and_fee(
        InputOwner::User,
        10_000,
        &candidates,
        builder_key(),
        &change_script,
    )?;

    assert_eq!(leg.fee_sats, fee_sats);
    assert_eq!(leg.selected_sats, 10_000 + fee_sats);
    assert_eq!(leg.required_sats, leg.selected_sats);
    assert_eq!(leg.change_sats, 0);

    let template = builder.finish();
    assert_eq!(template.outputs.len(), 2);
    let change = &template.outputs[leg.change_vout as usize];
    assert_eq!(change.value, bitcoin::Amount::ZERO);
    assert_eq!(change.script_pubkey, change_script);
    Ok(())
}
