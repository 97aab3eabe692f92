//! Redis coordination driver.
//!
//! Compare-and-delete and compare-and-expire run as server-side Lua scripts
//! so the holder check and the mutation are one atomic step. Key iteration
//! uses SCAN cursors. Subscriptions run on a dedicated pub/sub connection
//! per channel, forwarded into a process-local broadcast channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hive_types::{HiveError, HiveResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::CoordStore;

const CHANNEL_CAPACITY: usize = 256;
const SCAN_BATCH: usize = 100;

const DEL_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const EXPIRE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed [`CoordStore`].
pub struct RedisCoord {
    client: redis::Client,
    manager: ConnectionManager,
    del_if_eq: redis::Script,
    expire_if_eq: redis::Script,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RedisCoord {
    /// Connect to the engine at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> HiveResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| HiveError::DependencyUnavailable(format!("redis: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| HiveError::DependencyUnavailable(format!("redis: {e}")))?;
        Ok(Self {
            client,
            manager,
            del_if_eq: redis::Script::new(DEL_IF_EQ),
            expire_if_eq: redis::Script::new(EXPIRE_IF_EQ),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn map_err(err: redis::RedisError) -> HiveError {
        HiveError::DependencyUnavailable(format!("redis: {err}"))
    }

    /// Start the forwarding task for `channel` if it is not running yet and
    /// return the process-local sender.
    async fn channel_sender(&self, channel: &str) -> HiveResult<broadcast::Sender<String>> {
        let mut channels = self.channels.lock().await;
        if let Some(tx) = channels.get(channel) {
            return Ok(tx.clone());
        }

        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(Self::map_err)?;
        pubsub.subscribe(channel).await.map_err(Self::map_err)?;

        let forward_tx = tx.clone();
        let name = channel.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        // No subscribers is fine; fan-out is best-effort.
                        let _ = forward_tx.send(payload);
                    }
                    Err(e) => warn!(channel = %name, "dropping non-utf8 pubsub payload: {e}"),
                }
            }
            debug!(channel = %name, "pubsub forwarder stopped");
        });

        channels.insert(channel.to_string(), tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl CoordStore for RedisCoord {
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> HiveResult<bool> {
        let mut conn = self.manager.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(outcome.is_some())
    }

    async fn get(&self, key: &str) -> HiveResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> HiveResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(deleted == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> HiveResult<bool> {
        let mut conn = self.manager.clone();
        let renewed: i64 = self
            .expire_if_eq
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(renewed == 1)
    }

    async fn del(&self, key: &str) -> HiveResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> HiveResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn put_blob(&self, key: &str, value: &[u8]) -> HiveResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> HiveResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> HiveResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.publish(channel, payload).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> HiveResult<broadcast::Receiver<String>> {
        Ok(self.channel_sender(channel).await?.subscribe())
    }
}
