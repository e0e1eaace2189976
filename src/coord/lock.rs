// src/coord/lock.rs

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::CoordinationStore;
use crate::errors::Result;

/// A short-lived cross-instance lock held through a leased key.
///
/// If the holder dies the lease expires and the lock frees itself.
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this holder still owns it.
    pub async fn unlock(self) -> Result<()> {
        if self.store.delete_if_eq(&self.key, &self.token).await? {
            debug!(key = %self.key, "lock released");
        } else {
            warn!(key = %self.key, "lock already expired or taken over");
        }
        Ok(())
    }
}

/// Try once to take `key` for `ttl`. `Ok(None)` means someone else holds it.
pub async fn try_lock(
    store: &Arc<dyn CoordinationStore>,
    key: &str,
    ttl: Duration,
) -> Result<Option<DistributedLock>> {
    let lease = store.grant_lease(ttl).await?;
    let token = format!("{:016x}", rand::thread_rng().r#gen::<u64>());

    if !store.put_if_absent(key, token.clone(), Some(lease)).await? {
        debug!(key, "lock busy");
        return Ok(None);
    }

    debug!(key, ttl_secs = ttl.as_secs(), "lock acquired");
    Ok(Some(DistributedLock {
        store: Arc::clone(store),
        key: key.to_string(),
        token,
    }))
}
