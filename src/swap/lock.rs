use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;

use crate::chain::unix_millis;
use crate::error::SwapError;
use crate::pool::PoolRecord;
use crate::swap::store::SqliteStore;

/// Lease-based per-pool mutual exclusion. The lease spans the whole
/// multi-call workflow (template generation through broadcast); an expired
/// lease counts as free, so an abandoned workflow cannot wedge a pool. A
/// second concurrent attempt by another holder fails immediately, it is
/// never queued.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<Mutex<SqliteStore>>,
    lease: Duration,
}

impl LockManager {
    pub fn new(store: Arc<Mutex<SqliteStore>>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease.as_millis() as u64
    }

    /// Current live holder of the pool lease, if any.
    pub fn holder(&self, pool: &PoolRecord) -> Option<String> {
        pool.lock_holder(unix_millis(), self.lease_ms())
            .map(str::to_string)
    }

    pub fn acquire(&self, pool: &PoolRecord, owner: &str) -> Result<(), SwapError> {
        let now_ms = unix_millis();

        let acquired = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .try_lock(&pool.address, owner, now_ms, self.lease_ms())
            .context("compare-and-set pool lock")?;

        if !acquired {
            let holder = pool
                .lock_holder(now_ms, self.lease_ms())
                .unwrap_or("another swap")
                .to_string();
            return Err(SwapError::PoolLocked {
                pool: pool.address.clone(),
                holder,
            });
        }

        tracing::debug!(pool = %pool.address, owner = %owner, "pool lease acquired");
        Ok(())
    }

    pub fn release(&self, address: &str) -> Result<(), SwapError> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .unlock(address)
            .context("release pool lock")?;
        tracing::debug!(pool = %address, "pool lease released");
        Ok(())
    }
}
