#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-auth** – API-key issuance and caller resolution for the hive
//! control plane.
//!
//! Keys are opaque bearer secrets of the form `hive-{id}-{secret}`. At rest
//! the store holds only a salted SHA-256 digest; the clear value exists
//! exactly once, at issuance. Resolution turns a presented key into a
//! [`CallerIdentity`] – the tagged sum every permission check in the
//! workspace dispatches on.

use async_trait::async_trait;
use hive_store::StateStore;
use hive_types::{AgentName, CallerIdentity, HiveError, HiveResult};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

/// Length of the random secret, bytes.
const SECRET_LEN: usize = 24;
/// Length of the per-key salt, bytes.
const SALT_LEN: usize = 16;

/// Scope tag stored with user keys.
pub const SCOPE_USER: &str = "user";
/// Scope tag stored with agent keys.
pub const SCOPE_AGENT: &str = "agent";
/// Scope tag stored with the system agent's key.
pub const SCOPE_SYSTEM: &str = "system";

//─────────────────────────────
//  Trait definitions
//─────────────────────────────

/// Resolves a presented bearer key into a caller identity.
///
/// The seam lets the API and gateway be tested with a table-backed fake
/// while production resolves against the state store.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Verify authenticity and return the caller identity, or
    /// `permission_denied` for unknown and mismatched keys.
    async fn resolve(&self, raw: &str) -> HiveResult<CallerIdentity>;
}

//─────────────────────────────
//  Issuance
//─────────────────────────────

/// A freshly issued key. `clear` is the only copy of the secret.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    /// Key row id.
    pub id: i64,
    /// The full bearer string handed to the caller.
    pub clear: String,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn digest_of(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex(&hasher.finalize())
}

/// Issue a key with the given scope binding and persist its digest.
async fn issue(
    store: &StateStore,
    scope: &str,
    user_id: Option<Uuid>,
    agent: Option<&AgentName>,
) -> HiveResult<IssuedKey> {
    let mut secret_bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    let secret = hex(&secret_bytes);

    let mut salt_bytes = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = hex(&salt_bytes);

    let digest = digest_of(&salt, &secret);
    let id = store.insert_api_key(&digest, &salt, scope, user_id, agent).await?;
    Ok(IssuedKey { id, clear: format!("hive-{id}-{secret}") })
}

/// Issue a user-scoped key.
pub async fn issue_user_key(store: &StateStore, user_id: Uuid) -> HiveResult<IssuedKey> {
    issue(store, SCOPE_USER, Some(user_id), None).await
}

/// Issue an agent-scoped key, bound to the agent's name.
pub async fn issue_agent_key(store: &StateStore, agent: &AgentName) -> HiveResult<IssuedKey> {
    issue(store, SCOPE_AGENT, None, Some(agent)).await
}

/// Issue the system agent's key. Exactly one designated agent holds this.
pub async fn issue_system_key(store: &StateStore, agent: &AgentName) -> HiveResult<IssuedKey> {
    issue(store, SCOPE_SYSTEM, None, Some(agent)).await
}

//─────────────────────────────
//  Store-backed resolver
//─────────────────────────────

/// [`KeyResolver`] backed by the relational store.
#[derive(Debug, Clone)]
pub struct StoreKeyResolver {
    store: StateStore,
}

impl StoreKeyResolver {
    /// Wrap a store handle.
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

fn denied() -> HiveError {
    HiveError::PermissionDenied { caller: "anonymous".to_string(), target: "api".to_string() }
}

/// Split `hive-{id}-{secret}` into its parts.
fn split_key(raw: &str) -> Option<(i64, &str)> {
    let rest = raw.strip_prefix("hive-")?;
    let (id, secret) = rest.split_once('-')?;
    let id = id.parse().ok()?;
    if secret.is_empty() {
        return None;
    }
    Some((id, secret))
}

#[async_trait]
impl KeyResolver for StoreKeyResolver {
    async fn resolve(&self, raw: &str) -> HiveResult<CallerIdentity> {
        let (id, secret) = split_key(raw).ok_or_else(denied)?;
        let record = self.store.api_key_by_id(id).await?.ok_or_else(denied)?;
        if digest_of(&record.salt, secret) != record.digest {
            warn!(key_id = id, "api key digest mismatch");
            return Err(denied());
        }
        match record.scope.as_str() {
            SCOPE_SYSTEM => Ok(CallerIdentity::System),
            SCOPE_AGENT => {
                let name = record.agent.ok_or_else(|| {
                    HiveError::Internal(format!("agent key {id} has no agent binding"))
                })?;
                Ok(CallerIdentity::Agent { name })
            }
            SCOPE_USER => {
                let user_id = record.user_id.ok_or_else(|| {
                    HiveError::Internal(format!("user key {id} has no user binding"))
                })?;
                let user = self
                    .store
                    .user_by_id(user_id)
                    .await?
                    .ok_or_else(denied)?;
                Ok(CallerIdentity::User { id: user.id, admin: user.is_admin })
            }
            other => Err(HiveError::Internal(format!("unknown key scope {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_user_key_resolves_with_admin_flag() {
        let store = StateStore::in_memory().await.unwrap();
        let user = store.create_user("admin@example.com", true).await.unwrap();
        let key = issue_user_key(&store, user.id).await.unwrap();

        let resolver = StoreKeyResolver::new(store);
        let identity = resolver.resolve(&key.clear).await.unwrap();
        assert_eq!(identity, CallerIdentity::User { id: user.id, admin: true });
    }

    #[tokio::test]
    async fn agent_key_binds_to_name() {
        let store = StateStore::in_memory().await.unwrap();
        let name = AgentName::sanitize("worker").unwrap();
        let key = issue_agent_key(&store, &name).await.unwrap();

        let resolver = StoreKeyResolver::new(store);
        let identity = resolver.resolve(&key.clear).await.unwrap();
        assert_eq!(identity, CallerIdentity::Agent { name });
    }

    #[tokio::test]
    async fn system_key_bypasses_scoping() {
        let store = StateStore::in_memory().await.unwrap();
        let name = AgentName::sanitize("system").unwrap();
        let key = issue_system_key(&store, &name).await.unwrap();

        let resolver = StoreKeyResolver::new(store);
        assert_eq!(resolver.resolve(&key.clear).await.unwrap(), CallerIdentity::System);
    }

    #[tokio::test]
    async fn tampered_and_malformed_keys_are_denied() {
        let store = StateStore::in_memory().await.unwrap();
        let user = store.create_user("u@example.com", false).await.unwrap();
        let key = issue_user_key(&store, user.id).await.unwrap();

        let resolver = StoreKeyResolver::new(store);
        let tampered = format!("{}x", key.clear);
        assert_eq!(resolver.resolve(&tampered).await.unwrap_err().kind(), "permission_denied");
        assert_eq!(resolver.resolve("not-a-key").await.unwrap_err().kind(), "permission_denied");
        assert_eq!(resolver.resolve("hive-999-deadbeef").await.unwrap_err().kind(),
            "permission_denied");
    }
}
