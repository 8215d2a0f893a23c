use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Safe to call more than once;
/// later calls return an error that callers may ignore with `.ok()`.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("init tracing subscriber: {e}"))
}
