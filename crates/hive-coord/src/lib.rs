#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-coord** – Coordination-store abstraction for the hive control plane.
//!
//! This crate defines the [`CoordStore`] trait – the small set of atomic
//! primitives the orchestration core needs from its in-memory key/value
//! engine – together with two drivers: [`RedisCoord`] for production and
//! [`MemoryCoord`] for tests and single-node development.
//!
//! The contract is deliberately narrow:
//!
//! - atomic *set-if-absent with TTL* (queue admission, scheduler locks);
//! - atomic *compare-and-delete* and *compare-and-expire*, executed
//!   server-side, so a release after slot takeover is a no-op;
//! - cursor-based key iteration, never a blocking full-keyspace scan;
//! - publish/subscribe channels for cross-replica activity fan-out;
//! - opaque credential blobs.

use std::time::Duration;

use async_trait::async_trait;
use hive_types::HiveResult;
use tokio::sync::broadcast;

mod memory;
mod redis_driver;

pub use memory::MemoryCoord;
pub use redis_driver::RedisCoord;

/// Pub/sub channel carrying activity events to all API replicas.
pub const EVENTS_CHANNEL: &str = "events";

/// Queue-slot key for an agent.
pub fn queue_key(agent: &str) -> String {
    format!("queue:{agent}")
}

/// Distributed-lock key for a schedule.
pub fn scheduler_lock_key(schedule_id: i64) -> String {
    format!("scheduler:lock:schedule:{schedule_id}")
}

/// Credential-blob key for an agent.
pub fn creds_key(agent: &str) -> String {
    format!("creds:{agent}")
}

/// Atomic primitives required from the coordination store.
///
/// All operations are point ops against a shared engine; implementations
/// must be safe to call concurrently from many tasks and many replicas.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if the key is absent.
    /// Returns `true` when the value was set.
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> HiveResult<bool>;

    /// Current value of `key`, if present and unexpired.
    async fn get(&self, key: &str) -> HiveResult<Option<String>>;

    /// Delete `key` iff its current value equals `expected`.
    /// Returns `true` when the key was deleted. Executed server-side.
    async fn del_if_eq(&self, key: &str, expected: &str) -> HiveResult<bool>;

    /// Reset the TTL of `key` iff its current value equals `expected`.
    /// Returns `true` when the TTL was renewed. Executed server-side.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> HiveResult<bool>;

    /// Unconditionally delete `key`.
    async fn del(&self, key: &str) -> HiveResult<()>;

    /// All keys matching `prefix*`, gathered through cursor iteration.
    async fn scan_prefix(&self, prefix: &str) -> HiveResult<Vec<String>>;

    /// Store an opaque blob (credentials, short-lived state).
    async fn put_blob(&self, key: &str, value: &[u8]) -> HiveResult<()>;

    /// Fetch an opaque blob.
    async fn get_blob(&self, key: &str) -> HiveResult<Option<Vec<u8>>>;

    /// Publish `payload` on `channel`, fanning out to every subscriber on
    /// every replica.
    async fn publish(&self, channel: &str, payload: &str) -> HiveResult<()>;

    /// Subscribe to `channel`. Subscribers that fall behind may miss
    /// messages; the channel is best-effort fan-out, not a durable queue.
    async fn subscribe(&self, channel: &str) -> HiveResult<broadcast::Receiver<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(queue_key("alpha"), "queue:alpha");
        assert_eq!(scheduler_lock_key(7), "scheduler:lock:schedule:7");
        assert_eq!(creds_key("alpha"), "creds:alpha");
    }
}
