pub mod build;
pub mod engine;
pub mod finalize;
pub mod lock;
pub mod select;
pub mod store;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    /// User pays BTC and receives the pool's asset.
    BuyAsset,
    /// User sends the asset and receives the pool's BTC.
    SellAsset,
}

/// Direction crossed with asset class; every combination is its own
/// pipeline rather than a numeric code interpreted ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    BuyRune,
    SellRune,
    BuyBrc20,
    SellBrc20,
}

impl SwapKind {
    pub fn direction(self) -> SwapDirection {
        match self {
            SwapKind::BuyRune | SwapKind::BuyBrc20 => SwapDirection::BuyAsset,
            SwapKind::SellRune | SwapKind::SellBrc20 => SwapDirection::SellAsset,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapKind::BuyRune => "buy_rune",
            SwapKind::SellRune => "sell_rune",
            SwapKind::BuyBrc20 => "buy_brc20",
            SwapKind::SellBrc20 => "sell_brc20",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy_rune" => Some(SwapKind::BuyRune),
            "sell_rune" => Some(SwapKind::SellRune),
            "buy_brc20" => Some(SwapKind::BuyBrc20),
            "sell_brc20" => Some(SwapKind::SellBrc20),
            _ => None,
        }
    }
}

/// One rune swap request; lives only for the duration of the call.
#[derive(Debug, Clone, Deserialize)]
pub struct RuneSwapRequest {
    pub pool_address: String,
    pub user_address: String,
    /// X-only public key of the user's taproot wallet, hex.
    pub user_pubkey: String,
    pub direction: SwapDirection,
    /// Human-facing rune amount; scaled by the pool's divisibility.
    pub asset_amount: u64,
    /// BTC side of the trade: payment for `BuyAsset`, payout for `SellAsset`.
    pub btc_sats: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Brc20SwapRequest {
    pub pool_address: String,
    pub user_address: String,
    pub user_pubkey: String,
    pub direction: SwapDirection,
    /// Exact transfer denomination in ticker base units.
    pub amount: u128,
    pub btc_sats: u64,
}

/// Unsigned template plus the ownership map the client needs to sign its
/// own positions, returned by every successful template-generation call.
#[derive(Debug, Clone, Serialize)]
pub struct TemplatePayload {
    pub psbt_hex: String,
    /// Txid of the unsigned template; both signed copies must resolve to it.
    pub fingerprint: String,
    pub user_inputs: Vec<usize>,
    pub pool_inputs: Vec<usize>,
    /// Audit-ledger txids consumed by the recovery pass.
    pub used_txids: Vec<String>,
    /// Asset amount landing on the user output.
    pub user_asset_amount: u128,
    /// Asset amount landing on the pool output.
    pub pool_asset_amount: u128,
    pub btc_sats: u64,
    pub fee_sats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Brc20Status {
    Inscribe,
    Transfer,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload {
    pub order_id: String,
    pub pay_address: String,
    pub amount_sats: u64,
}

/// BRC20 calls carry an explicit status tag: `INSCRIBE` when a transfer
/// inscription must be created first, `TRANSFER` once the swap template
/// itself could be built.
#[derive(Debug, Clone, Serialize)]
pub struct Brc20TemplatePayload {
    pub status: Brc20Status,
    pub order: Option<OrderPayload>,
    pub template: Option<TemplatePayload>,
}

/// Carries only the signed copies and their ownership map. Everything the
/// commit writes to the ledger comes from the `PendingSwap` persisted at
/// generation time, so a client cannot assert amounts.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    pub pool_address: String,
    pub user_address: String,
    /// The exact unsigned template returned at generation time.
    pub template_psbt_hex: String,
    /// The client's copy with its owned positions signed.
    pub user_signed_psbt_hex: String,
    pub user_inputs: Vec<usize>,
    pub pool_inputs: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizePayload {
    pub txid: String,
}
