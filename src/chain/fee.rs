use std::str::FromStr;

use anyhow::{Result, bail};
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use super::SCHNORR_SIGNATURE_SIZE;

/// Network fee rate in sats per virtual byte.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FeeRate(f64);

impl FromStr for FeeRate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(f64::from_str(s)?)
    }
}

impl TryFrom<f64> for FeeRate {
    type Error = anyhow::Error;

    fn try_from(rate: f64) -> Result<Self> {
        if rate.is_sign_negative() | rate.is_nan() | rate.is_infinite() {
            bail!("invalid fee rate: {rate}")
        }
        Ok(Self(rate))
    }
}

impl FeeRate {
    pub fn fee(&self, vsize: usize) -> Amount {
        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        Amount::from_sat((self.0 * vsize as f64).round() as u64)
    }

    pub fn sat_per_vb(&self) -> f64 {
        self.0
    }
}

/// Projected virtual size of the transaction under construction. All inputs
/// are taproot key path spends, so every witness is a single Schnorr
/// signature; a placeholder witness of that size makes the estimate exact.
pub fn estimate_vsize(inputs: usize, outputs: &[TxOut]) -> usize {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: (0..inputs)
            .map(|_| TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::from_slice(&[&[0; SCHNORR_SIGNATURE_SIZE]]),
            })
            .collect(),
        output: outputs.to_vec(),
    }
    .vsize()
}
