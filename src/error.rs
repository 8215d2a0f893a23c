use serde::Serialize;

/// Domain failures of the swap engine. Everything that is not a variant here
/// is an external/transient failure and travels as `External`, so callers can
/// retry those without retrying validation failures.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("no pool found at address {0}")]
    PoolNotFound(String),

    #[error("pool {pool} is locked by {holder}")]
    PoolLocked { pool: String, holder: String },

    #[error("insufficient {asset} balance: have {available}, need {required}")]
    InsufficientAssetBalance {
        asset: String,
        available: u128,
        required: u128,
    },

    #[error("insufficient BTC balance: have {available} sats, need {required} sats")]
    InsufficientBtcBalance { available: u64, required: u64 },

    #[error("no transferable inscription of {ticker} {amount} for {address}")]
    InscriptionMissing {
        address: String,
        ticker: String,
        amount: u128,
    },

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("signed template does not match the generated template: {0}")]
    TemplateMismatch(String),

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl SwapError {
    /// True for failures of external collaborators that the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SwapError::External(_) | SwapError::BroadcastFailed(_))
    }
}

/// Uniform response envelope of every public engine operation.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    pub payload: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(message: impl Into<String>, payload: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: Some(payload),
        }
    }

    pub fn fail(err: &SwapError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            payload: None,
        }
    }

    pub fn from_result(message: impl Into<String>, result: Result<T, SwapError>) -> Self {
        match result {
            Ok(payload) => Self::ok(message, payload),
            Err(err) => Self::fail(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_external_failures_are_transient() {
        assert!(SwapError::BroadcastFailed("mempool full".into()).is_transient());
        assert!(SwapError::External(anyhow::anyhow!("rpc timeout")).is_transient());
        assert!(!SwapError::PoolNotFound("bc1p...".into()).is_transient());
        assert!(
            !SwapError::InsufficientBtcBalance {
                available: 100,
                required: 200,
            }
            .is_transient()
        );
    }

    #[test]
    fn envelope_carries_the_error_message() {
        let env: Envelope<u32> =
            Envelope::from_result("swap built", Err(SwapError::PoolNotFound("addr".into())));
        assert!(!env.success);
        assert!(env.payload.is_none());
        assert_eq!(env.message, "no pool found at address addr");

        let env = Envelope::from_result("swap built", Ok(7u32));
        assert!(env.success);
        assert_eq!(env.payload, Some(7));
    }
}
