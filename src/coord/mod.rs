// src/coord/mod.rs

//! Coordination store: lease-backed TTL keys, prefix watches and
//! compare-and-swap locks shared by every engine instance.
//!
//! Only GC and compensation use it. Lease-expiry notifications are lossy;
//! callers must tolerate missing `Delete` events.

pub mod lock;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::Result;

pub use lock::{DistributedLock, try_lock};
pub use memory::{ExpiryMode, MemoryCoordinator};

pub type LeaseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchKind,
    /// Value after a put, value before a delete when known.
    pub value: Option<String>,
}

/// Receiver half of a prefix watch.
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next event under the watched prefix; `None` once the store is gone.
    ///
    /// Lagging drops events, the same way a lost lease notification would.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.key.starts_with(&self.prefix) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, dropped = n, "watch lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease; every key attached to it is deleted when it expires.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Put a key, attaching it to `lease` (or detaching it when `None`).
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<()>;

    /// Put only when the key does not exist yet. Returns whether it was written.
    async fn put_if_absent(&self, key: &str, value: String, lease: Option<LeaseId>)
    -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete only when the key currently holds `expected`, as one atomic
    /// step. Returns whether it was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Returns the number of deleted keys.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Key/value pairs under a prefix, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn watch(&self, prefix: &str) -> Watcher;
}
