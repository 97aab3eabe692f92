//! Users and API keys.

use chrono::Utc;
use hive_types::{AgentName, HiveError, HiveResult};
use uuid::Uuid;

use crate::rows::{ApiKeyRecord, UserRecord};
use crate::{db_err, ts, StateStore};

impl StateStore {
    /// Insert a user.
    pub async fn create_user(&self, email: &str, is_admin: bool) -> HiveResult<UserRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query("INSERT INTO users (id, email, is_admin, created_at) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(email)
            .bind(is_admin as i64)
            .bind(ts(now))
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(UserRecord { id, email: email.to_string(), is_admin, created_at: now })
    }

    /// Fetch a user by id.
    pub async fn user_by_id(&self, id: Uuid) -> HiveResult<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| UserRecord::from_row(&r)).transpose()
    }

    /// Fetch a user by email.
    pub async fn user_by_email(&self, email: &str) -> HiveResult<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| UserRecord::from_row(&r)).transpose()
    }

    /// Insert an API-key digest row and return its id.
    ///
    /// The clear key never reaches this crate; callers store only the salted
    /// digest produced at issuance.
    pub async fn insert_api_key(
        &self,
        digest: &str,
        salt: &str,
        scope: &str,
        user_id: Option<Uuid>,
        agent: Option<&AgentName>,
    ) -> HiveResult<i64> {
        let outcome = sqlx::query(
            "INSERT INTO api_keys (digest, salt, scope, user_id, agent, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(digest)
        .bind(salt)
        .bind(scope)
        .bind(user_id.map(|u| u.to_string()))
        .bind(agent.map(|a| a.as_str().to_string()))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(outcome.last_insert_rowid())
    }

    /// Fetch an API key row by id.
    pub async fn api_key_by_id(&self, id: i64) -> HiveResult<Option<ApiKeyRecord>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| ApiKeyRecord::from_row(&r)).transpose()
    }

    /// Delete every key bound to an agent. Part of the delete cascade.
    pub async fn delete_api_keys_for_agent(&self, agent: &AgentName) -> HiveResult<()> {
        sqlx::query("DELETE FROM api_keys WHERE agent = ?")
            .bind(agent.as_str())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a single API key.
    pub async fn delete_api_key(&self, id: i64) -> HiveResult<()> {
        let outcome = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("api key {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_round_trip() {
        let store = StateStore::in_memory().await.unwrap();
        let user = store.create_user("a@example.com", false).await.unwrap();
        let fetched = store.user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(fetched, user);
        assert!(store.user_by_email("missing@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = StateStore::in_memory().await.unwrap();
        store.create_user("a@example.com", false).await.unwrap();
        let err = store.create_user("a@example.com", true).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn api_keys_cascade_per_agent() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("worker").unwrap();
        let id = store
            .insert_api_key("digest", "salt", "agent", None, Some(&agent))
            .await
            .unwrap();
        assert!(store.api_key_by_id(id).await.unwrap().is_some());
        store.delete_api_keys_for_agent(&agent).await.unwrap();
        assert!(store.api_key_by_id(id).await.unwrap().is_none());
    }
}
