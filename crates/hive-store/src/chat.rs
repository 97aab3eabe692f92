//! Chat sessions and messages.
//!
//! A session exists per (agent, user) pair from first interaction and
//! survives container recreation; messages append in causal order.

use chrono::Utc;
use hive_types::{AgentName, HiveError, HiveResult};
use uuid::Uuid;

use crate::rows::{ChatMessageRecord, ChatSessionRecord};
use crate::{db_err, ts, StateStore};

impl StateStore {
    /// Fetch or create the session for `(agent, user)`.
    pub async fn ensure_session(
        &self,
        agent: &AgentName,
        user_id: Uuid,
    ) -> HiveResult<ChatSessionRecord> {
        sqlx::query(
            "INSERT OR IGNORE INTO chat_sessions (agent, user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(agent.as_str())
        .bind(user_id.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM chat_sessions WHERE agent = ? AND user_id = ?")
            .bind(agent.as_str())
            .bind(user_id.to_string())
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        ChatSessionRecord::from_row(&row)
    }

    /// Append a message to a session.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
        cost_usd: Option<f64>,
        context_tokens: Option<i64>,
        tool_summary: Option<&str>,
        execution_ms: Option<i64>,
    ) -> HiveResult<ChatMessageRecord> {
        let now = Utc::now();
        let outcome = sqlx::query(
            "INSERT INTO chat_messages
                 (session_id, role, content, cost_usd, context_tokens, tool_summary,
                  execution_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(cost_usd)
        .bind(context_tokens)
        .bind(tool_summary)
        .bind(execution_ms)
        .bind(ts(now))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(ChatMessageRecord {
            id: outcome.last_insert_rowid(),
            session_id,
            role: role.to_string(),
            content: content.to_string(),
            cost_usd,
            context_tokens,
            tool_summary: tool_summary.map(str::to_string),
            execution_ms,
            created_at: now,
        })
    }

    /// Messages of a session in causal (insertion) order.
    pub async fn messages_for_session(
        &self,
        session_id: i64,
        limit: i64,
    ) -> HiveResult<Vec<ChatMessageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ? ORDER BY id LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(ChatMessageRecord::from_row).collect()
    }

    /// Look up an existing session without creating one.
    pub async fn session_for(
        &self,
        agent: &AgentName,
        user_id: Uuid,
    ) -> HiveResult<ChatSessionRecord> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE agent = ? AND user_id = ?")
            .bind(agent.as_str())
            .bind(user_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| ChatSessionRecord::from_row(&r))
            .transpose()?
            .ok_or_else(|| HiveError::NotFound(format!("chat session for {agent}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_is_stable_per_pair() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let user = Uuid::new_v4();

        let first = store.ensure_session(&agent, user).await.unwrap();
        let second = store.ensure_session(&agent, user).await.unwrap();
        assert_eq!(first.id, second.id);

        let other = store.ensure_session(&agent, Uuid::new_v4()).await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn messages_keep_causal_order() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let session = store.ensure_session(&agent, Uuid::new_v4()).await.unwrap();

        store
            .append_message(session.id, "user", "hi", None, None, None, None)
            .await
            .unwrap();
        store
            .append_message(session.id, "assistant", "hello", Some(0.01), Some(1200),
                Some("bash x1"), Some(900))
            .await
            .unwrap();

        let messages = store.messages_for_session(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].cost_usd, Some(0.01));
    }
}
