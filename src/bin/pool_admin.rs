use std::path::PathBuf;
use std::str::FromStr as _;

use anyhow::{Context as _, Result, bail};
use btc_pool_swap::pool::{PoolAsset, PoolRecord};
use btc_pool_swap::swap::store::SqliteStore;
use clap::{Parser as _, Subcommand};
use ordinals::RuneId;
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "pools.sqlite")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a rune liquidity pool.
    AddRunePool {
        #[arg(long)]
        address: String,

        /// Rune id as "block:tx".
        #[arg(long)]
        rune_id: String,

        #[arg(long, default_value_t = 0)]
        divisibility: u8,

        /// X-only pubkey of the custodial taproot wallet, hex.
        #[arg(long)]
        pubkey: String,

        /// Custodial key in WIF.
        #[arg(long)]
        private_key: String,

        #[arg(long, default_value_t = 0)]
        asset_amount: u128,

        #[arg(long, default_value_t = 0)]
        btc_sats: u64,
    },
    /// Register a BRC20 liquidity pool.
    AddBrc20Pool {
        #[arg(long)]
        address: String,

        #[arg(long)]
        ticker: String,

        #[arg(long)]
        pubkey: String,

        #[arg(long)]
        private_key: String,

        #[arg(long, default_value_t = 0)]
        asset_amount: u128,

        #[arg(long, default_value_t = 0)]
        btc_sats: u64,
    },
    ListPools,
    Show {
        #[arg(long)]
        address: String,
    },
    /// Force-release a wedged pool lease.
    Unlock {
        #[arg(long)]
        address: String,
    },
}

fn pool_json(pool: &PoolRecord) -> serde_json::Value {
    json!({
        "address": pool.address,
        "asset": pool.asset.label(),
        "asset_amount": pool.asset_amount.to_string(),
        "btc_sats": pool.btc_sats,
        "volume_sats": pool.volume_sats,
        "locked_by": pool.lock.as_ref().map(|l| l.owner.clone()),
        "pending_fingerprint": pool.pending.as_ref().map(|p| p.fingerprint.clone()),
    })
}

fn main() -> Result<()> {
    btc_pool_swap::logging::init().ok();
    let args = Args::parse();

    let mut store = SqliteStore::open(args.db_path).context("open pool database")?;

    let out = match args.command {
        Command::AddRunePool {
            address,
            rune_id,
            divisibility,
            pubkey,
            private_key,
            asset_amount,
            btc_sats,
        } => {
            let id = RuneId::from_str(&rune_id).context("parse rune id")?;
            let pool = PoolRecord {
                address,
                asset: PoolAsset::Rune { id, divisibility },
                pubkey,
                private_key,
                asset_amount,
                btc_sats,
                volume_sats: 0,
                lock: None,
                pending: None,
            };
            store.insert_pool(&pool).context("insert pool")?;
            pool_json(&pool)
        }
        Command::AddBrc20Pool {
            address,
            ticker,
            pubkey,
            private_key,
            asset_amount,
            btc_sats,
        } => {
            let pool = PoolRecord {
                address,
                asset: PoolAsset::Brc20 { ticker },
                pubkey,
                private_key,
                asset_amount,
                btc_sats,
                volume_sats: 0,
                lock: None,
                pending: None,
            };
            store.insert_pool(&pool).context("insert pool")?;
            pool_json(&pool)
        }
        Command::ListPools => {
            let pools = store.list_pools().context("list pools")?;
            json!(pools.iter().map(pool_json).collect::<Vec<_>>())
        }
        Command::Show { address } => {
            let Some(pool) = store.get_pool(&address).context("load pool")? else {
                bail!("no pool found at address {address}");
            };
            pool_json(&pool)
        }
        Command::Unlock { address } => {
            if store.get_pool(&address).context("load pool")?.is_none() {
                bail!("no pool found at address {address}");
            }
            store.unlock(&address).context("unlock pool")?;
            json!({ "address": address, "unlocked": true })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
