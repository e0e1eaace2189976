// src/coord/memory.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::{CoordinationStore, LeaseId, WatchEvent, WatchKind, Watcher};
use crate::errors::Result;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Inner {
    keys: Mutex<BTreeMap<String, Entry>>,
    next_lease: AtomicI64,
    events: broadcast::Sender<WatchEvent>,
    expiry: AtomicU8,
}

/// How lease expiry behaves; the non-normal modes reproduce the failures
/// the GC sweeps exist for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExpiryMode {
    /// Keys are deleted and a `Delete` event is emitted.
    Normal = 0,
    /// Keys are deleted but nobody is told.
    Silent = 1,
    /// Leases never fire; keys linger past their TTL.
    Suspended = 2,
}

impl ExpiryMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ExpiryMode::Silent,
            2 => ExpiryMode::Suspended,
            _ => ExpiryMode::Normal,
        }
    }
}

/// In-memory [`CoordinationStore`] with real lease expiry on tokio timers.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                keys: Mutex::new(BTreeMap::new()),
                next_lease: AtomicI64::new(1),
                events,
                expiry: AtomicU8::new(ExpiryMode::Normal as u8),
            }),
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_expiry_mode(&self, mode: ExpiryMode) {
        self.inner.expiry.store(mode as u8, Ordering::SeqCst);
    }

    fn emit(&self, key: &str, kind: WatchKind, value: Option<String>) {
        // No receivers is fine.
        let _ = self.inner.events.send(WatchEvent {
            key: key.to_string(),
            kind,
            value,
        });
    }

    async fn expire(inner: Arc<Inner>, lease: LeaseId) {
        let mode = ExpiryMode::from_u8(inner.expiry.load(Ordering::SeqCst));
        if mode == ExpiryMode::Suspended {
            debug!(lease, "lease expiry suspended");
            return;
        }
        let removed: Vec<(String, Entry)> = {
            let mut keys = inner.keys.lock().await;
            let expired: Vec<String> = keys
                .iter()
                .filter(|(_, e)| e.lease == Some(lease))
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| keys.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let silent = mode == ExpiryMode::Silent;
        for (key, entry) in removed {
            debug!(%key, lease, silent, "lease expired; key deleted");
            if !silent {
                let _ = inner.events.send(WatchEvent {
                    key,
                    kind: WatchKind::Delete,
                    value: Some(entry.value),
                });
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let lease = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            MemoryCoordinator::expire(inner, lease).await;
        });
        Ok(lease)
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<()> {
        self.inner.keys.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        self.emit(key, WatchKind::Put, Some(value));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        {
            let mut keys = self.inner.keys.lock().await;
            if keys.contains_key(key) {
                return Ok(false);
            }
            keys.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease,
                },
            );
        }
        self.emit(key, WatchKind::Put, Some(value));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .keys
            .lock()
            .await
            .get(key)
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.keys.lock().await.remove(key);
        match removed {
            Some(entry) => {
                self.emit(key, WatchKind::Delete, Some(entry.value));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let removed = {
            let mut keys = self.inner.keys.lock().await;
            match keys.get(key) {
                Some(entry) if entry.value == expected => keys.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                self.emit(key, WatchKind::Delete, Some(entry.value));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let removed: Vec<(String, Entry)> = {
            let mut keys = self.inner.keys.lock().await;
            let matched: Vec<String> = keys
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            matched
                .into_iter()
                .filter_map(|k| keys.remove(&k).map(|e| (k, e)))
                .collect()
        };
        let count = removed.len();
        for (key, entry) in removed {
            self.emit(&key, WatchKind::Delete, Some(entry.value));
        }
        Ok(count)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .keys
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher::new(prefix, self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_only_removes_keys_still_on_the_lease() {
        let coord = MemoryCoordinator::new();
        let short = coord.grant_lease(Duration::from_secs(5)).await.unwrap();
        let long = coord.grant_lease(Duration::from_secs(50)).await.unwrap();

        coord.put("/a", "1".into(), Some(short)).await.unwrap();
        coord.put("/b", "1".into(), Some(short)).await.unwrap();
        // Re-put detaches /b from the short lease.
        coord.put("/b", "2".into(), Some(long)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(coord.get("/a").await.unwrap(), None);
        assert_eq!(coord.get("/b").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn put_if_absent_is_exclusive() {
        let coord = MemoryCoordinator::new();
        assert!(coord.put_if_absent("/lock", "x".into(), None).await.unwrap());
        assert!(!coord.put_if_absent("/lock", "y".into(), None).await.unwrap());
        assert_eq!(coord.get("/lock").await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test]
    async fn delete_if_eq_compares_before_deleting() {
        let coord = MemoryCoordinator::new();
        coord.put("/lock", "x".into(), None).await.unwrap();
        assert!(!coord.delete_if_eq("/lock", "y").await.unwrap());
        assert_eq!(coord.get("/lock").await.unwrap(), Some("x".to_string()));
        assert!(coord.delete_if_eq("/lock", "x").await.unwrap());
        assert!(!coord.delete_if_eq("/lock", "x").await.unwrap());
    }
}
