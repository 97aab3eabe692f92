//! In-memory coordination driver.
//!
//! Mirrors the Redis driver's semantics on a single node: TTL expiry is
//! evaluated lazily on access, compare-and-delete is atomic under the map
//! lock, pub/sub fans out through tokio broadcast channels. Used by tests
//! and single-node development.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hive_types::HiveResult;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::CoordStore;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Single-process [`CoordStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryCoord {
    keys: RwLock<HashMap<String, Entry>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryCoord {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a key to expire immediately. Test support for TTL races.
    pub async fn force_expire(&self, key: &str) {
        let mut keys = self.keys.write().await;
        if let Some(entry) = keys.get_mut(key) {
            entry.expires_at = Some(Instant::now());
        }
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordStore for MemoryCoord {
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> HiveResult<bool> {
        let mut keys = self.keys.write().await;
        match keys.get(key) {
            Some(entry) if !entry.is_expired() => Ok(false),
            _ => {
                keys.insert(
                    key.to_string(),
                    Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
                );
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> HiveResult<Option<String>> {
        let keys = self.keys.read().await;
        Ok(keys.get(key).filter(|e| !e.is_expired()).map(|e| e.value.clone()))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> HiveResult<bool> {
        let mut keys = self.keys.write().await;
        match keys.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> HiveResult<bool> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> HiveResult<()> {
        self.keys.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> HiveResult<Vec<String>> {
        let keys = self.keys.read().await;
        Ok(keys
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put_blob(&self, key: &str, value: &[u8]) -> HiveResult<()> {
        self.blobs.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> HiveResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn publish(&self, channel: &str, payload: &str) -> HiveResult<()> {
        // No subscribers is fine; fan-out is best-effort.
        let _ = self.sender(channel).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> HiveResult<broadcast::Receiver<String>> {
        Ok(self.sender(channel).await.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        let coord = MemoryCoord::new();
        assert!(coord.set_nx_ttl("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!coord.set_nx_ttl("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().as_deref(), Some("a"));

        coord.force_expire("k").await;
        assert!(coord.set_nx_ttl("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn del_if_eq_ignores_other_holders() {
        let coord = MemoryCoord::new();
        coord.set_nx_ttl("k", "mine", Duration::from_secs(60)).await.unwrap();
        assert!(!coord.del_if_eq("k", "theirs").await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().as_deref(), Some("mine"));
        assert!(coord.del_if_eq("k", "mine").await.unwrap());
        assert_eq!(coord.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_if_eq_renews_only_for_holder() {
        let coord = MemoryCoord::new();
        coord.set_nx_ttl("k", "mine", Duration::from_secs(60)).await.unwrap();
        assert!(coord.expire_if_eq("k", "mine", Duration::from_secs(120)).await.unwrap());
        assert!(!coord.expire_if_eq("k", "theirs", Duration::from_secs(120)).await.unwrap());
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired() {
        let coord = MemoryCoord::new();
        coord.set_nx_ttl("queue:a", "1", Duration::from_secs(60)).await.unwrap();
        coord.set_nx_ttl("queue:b", "2", Duration::from_secs(60)).await.unwrap();
        coord.set_nx_ttl("lock:c", "3", Duration::from_secs(60)).await.unwrap();
        coord.force_expire("queue:b").await;

        let mut keys = coord.scan_prefix("queue:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["queue:a".to_string()]);
    }

    #[tokio::test]
    async fn pubsub_fans_out_to_all_subscribers() {
        let coord = MemoryCoord::new();
        let mut rx1 = coord.subscribe("events").await.unwrap();
        let mut rx2 = coord.subscribe("events").await.unwrap();

        coord.publish("events", "hello").await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }
}
