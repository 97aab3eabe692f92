//! Agents, ownership, sharing, and the permission graph.

use chrono::Utc;
use hive_types::{AgentConfig, AgentName, AgentStatus, HiveError, HiveResult, RuntimeKind};
use sqlx::Row;
use uuid::Uuid;

use crate::rows::AgentRecord;
use crate::{db_err, ts, StateStore};

impl StateStore {
    /// Insert an agent together with its initial permission edges in one
    /// transaction. The default edge set is restrictive; the self-edge is
    /// implicit and never stored.
    pub async fn create_agent(
        &self,
        name: &AgentName,
        owner_id: Uuid,
        template: &str,
        kind: RuntimeKind,
        is_system: bool,
        config: &AgentConfig,
        edges: &[AgentName],
    ) -> HiveResult<AgentRecord> {
        let now = Utc::now();
        let config_blob = serde_json::to_string(config)?;
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO agents
                 (name, owner_id, template, kind, status, is_system, orphaned, config, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(name.as_str())
        .bind(owner_id.to_string())
        .bind(template)
        .bind(kind.as_str())
        .bind(AgentStatus::Created.as_str())
        .bind(is_system as i64)
        .bind(&config_blob)
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for target in edges {
            sqlx::query("INSERT OR IGNORE INTO permission_edges (source, target) VALUES (?, ?)")
                .bind(name.as_str())
                .bind(target.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(AgentRecord {
            name: name.clone(),
            owner_id,
            template: template.to_string(),
            kind,
            status: AgentStatus::Created,
            is_system,
            orphaned: false,
            config: config.clone(),
            created_at: now,
        })
    }

    /// Insert a row for a container discovered without one. Orphans are
    /// visible only to admins until claimed or deleted.
    pub async fn insert_orphan(
        &self,
        name: &AgentName,
        owner_id: Uuid,
        kind: RuntimeKind,
    ) -> HiveResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO agents
                 (name, owner_id, template, kind, status, is_system, orphaned, config, created_at)
             VALUES (?, ?, '', ?, ?, 0, 1, ?, ?)",
        )
        .bind(name.as_str())
        .bind(owner_id.to_string())
        .bind(kind.as_str())
        .bind(AgentStatus::Stopped.as_str())
        .bind(serde_json::to_string(&AgentConfig::default())?)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Fetch an agent by name.
    pub async fn agent_by_name(&self, name: &AgentName) -> HiveResult<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| AgentRecord::from_row(&r)).transpose()
    }

    /// Fetch an agent or fail with `not_found`.
    pub async fn agent_required(&self, name: &AgentName) -> HiveResult<AgentRecord> {
        self.agent_by_name(name)
            .await?
            .ok_or_else(|| HiveError::NotFound(format!("agent {name}")))
    }

    /// The designated system agent, if configured.
    pub async fn system_agent(&self) -> HiveResult<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE is_system = 1 LIMIT 1")
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| AgentRecord::from_row(&r)).transpose()
    }

    /// Every agent with its full metadata, one query. Keeps `list` latency
    /// flat at fleet sizes of low hundreds.
    pub async fn list_agents(&self, include_orphans: bool) -> HiveResult<Vec<AgentRecord>> {
        let sql = if include_orphans {
            "SELECT * FROM agents ORDER BY name"
        } else {
            "SELECT * FROM agents WHERE orphaned = 0 ORDER BY name"
        };
        let rows = sqlx::query(sql).fetch_all(self.pool()).await.map_err(db_err)?;
        rows.iter().map(AgentRecord::from_row).collect()
    }

    /// Agents a user can see: owned ∪ shared, in one join. Admins see all
    /// non-orphaned agents.
    pub async fn accessible_agents(
        &self,
        user_id: Uuid,
        is_admin: bool,
    ) -> HiveResult<Vec<AgentRecord>> {
        if is_admin {
            return self.list_agents(false).await;
        }
        let rows = sqlx::query(
            "SELECT DISTINCT a.* FROM agents a
             LEFT JOIN agent_shares s ON s.agent = a.name
             WHERE a.orphaned = 0 AND (a.owner_id = ? OR s.user_id = ?)
             ORDER BY a.name",
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(AgentRecord::from_row).collect()
    }

    /// Whether a user may act on an agent: owner, share grantee, or admin.
    pub async fn user_can_access(
        &self,
        user_id: Uuid,
        is_admin: bool,
        agent: &AgentName,
    ) -> HiveResult<bool> {
        if is_admin {
            return Ok(self.agent_by_name(agent).await?.is_some());
        }
        let row = sqlx::query(
            "SELECT 1 FROM agents a
             LEFT JOIN agent_shares s ON s.agent = a.name AND s.user_id = ?
             WHERE a.name = ? AND (a.owner_id = ? OR s.user_id IS NOT NULL)",
        )
        .bind(user_id.to_string())
        .bind(agent.as_str())
        .bind(user_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Transition the stored lifecycle status.
    pub async fn set_agent_status(&self, name: &AgentName, status: AgentStatus) -> HiveResult<()> {
        let outcome = sqlx::query("UPDATE agents SET status = ? WHERE name = ?")
            .bind(status.as_str())
            .bind(name.as_str())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("agent {name}")));
        }
        Ok(())
    }

    /// Replace the declared configuration.
    pub async fn update_agent_config(
        &self,
        name: &AgentName,
        config: &AgentConfig,
    ) -> HiveResult<()> {
        let outcome = sqlx::query("UPDATE agents SET config = ? WHERE name = ?")
            .bind(serde_json::to_string(config)?)
            .bind(name.as_str())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("agent {name}")));
        }
        Ok(())
    }

    /// Delete an agent and cascade its relational state in one transaction:
    /// schedules, permission edges in both directions, sharing rows, API
    /// keys, and (unless `retain_history`) activities and executions.
    pub async fn delete_agent(&self, name: &AgentName, retain_history: bool) -> HiveResult<()> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM schedules WHERE agent = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM permission_edges WHERE source = ? OR target = ?")
            .bind(name.as_str())
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM agent_shares WHERE agent = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM api_keys WHERE agent = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if !retain_history {
            sqlx::query("DELETE FROM activities WHERE agent = ?")
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM executions WHERE agent = ?")
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        let outcome = sqlx::query("DELETE FROM agents WHERE name = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("agent {name}")));
        }
        tx.commit().await.map_err(db_err)
    }

    /// Grant a user shared access.
    pub async fn add_share(&self, agent: &AgentName, user_id: Uuid) -> HiveResult<()> {
        sqlx::query("INSERT OR IGNORE INTO agent_shares (agent, user_id) VALUES (?, ?)")
            .bind(agent.as_str())
            .bind(user_id.to_string())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Revoke a user's shared access.
    pub async fn remove_share(&self, agent: &AgentName, user_id: Uuid) -> HiveResult<()> {
        sqlx::query("DELETE FROM agent_shares WHERE agent = ? AND user_id = ?")
            .bind(agent.as_str())
            .bind(user_id.to_string())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    //─────────────────────────────
    //  Permission graph
    //─────────────────────────────

    /// Replace the outgoing edge set of `source` in one transaction.
    pub async fn set_edges(&self, source: &AgentName, targets: &[AgentName]) -> HiveResult<()> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM permission_edges WHERE source = ?")
            .bind(source.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for target in targets {
            if target == source {
                continue; // self-edge is implicit
            }
            sqlx::query("INSERT OR IGNORE INTO permission_edges (source, target) VALUES (?, ?)")
                .bind(source.as_str())
                .bind(target.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    /// Neighbors of `source` in the edge set: the agents it may call and see.
    pub async fn permitted_targets(&self, source: &AgentName) -> HiveResult<Vec<AgentName>> {
        let rows = sqlx::query(
            "SELECT target FROM permission_edges WHERE source = ? ORDER BY target",
        )
        .bind(source.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| AgentName::parse(&r.get::<String, _>("target")))
            .collect()
    }

    /// Whether the directed edge `source → target` exists. The self-edge is
    /// implicit and always present.
    pub async fn has_edge(&self, source: &AgentName, target: &AgentName) -> HiveResult<bool> {
        if source == target {
            return Ok(true);
        }
        let row = sqlx::query(
            "SELECT 1 FROM permission_edges WHERE source = ? AND target = ?",
        )
        .bind(source.as_str())
        .bind(target.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (StateStore, Uuid, AgentName, AgentName) {
        let store = StateStore::in_memory().await.unwrap();
        let owner = store.create_user("owner@example.com", false).await.unwrap();
        let alpha = AgentName::sanitize("alpha").unwrap();
        let beta = AgentName::sanitize("beta").unwrap();
        store
            .create_agent(&alpha, owner.id, "default", RuntimeKind::SandboxedLlm, false,
                &AgentConfig::default(), &[])
            .await
            .unwrap();
        store
            .create_agent(&beta, owner.id, "default", RuntimeKind::SandboxedLlm, false,
                &AgentConfig::default(), &[])
            .await
            .unwrap();
        (store, owner.id, alpha, beta)
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let (store, owner, alpha, _) = seeded().await;
        let err = store
            .create_agent(&alpha, owner, "default", RuntimeKind::SandboxedLlm, false,
                &AgentConfig::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn accessible_is_owned_union_shared() {
        let (store, _, alpha, _) = seeded().await;
        let other = store.create_user("other@example.com", false).await.unwrap();

        assert!(store.accessible_agents(other.id, false).await.unwrap().is_empty());
        assert!(!store.user_can_access(other.id, false, &alpha).await.unwrap());

        store.add_share(&alpha, other.id).await.unwrap();
        let visible = store.accessible_agents(other.id, false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, alpha);
        assert!(store.user_can_access(other.id, false, &alpha).await.unwrap());

        // Admins see everything without shares.
        let admin = store.create_user("admin@example.com", true).await.unwrap();
        assert_eq!(store.accessible_agents(admin.id, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn edge_set_round_trips() {
        let (store, _, alpha, beta) = seeded().await;
        store.set_edges(&alpha, &[beta.clone()]).await.unwrap();
        assert_eq!(store.permitted_targets(&alpha).await.unwrap(), vec![beta.clone()]);
        assert!(store.has_edge(&alpha, &beta).await.unwrap());
        assert!(!store.has_edge(&beta, &alpha).await.unwrap());
        // Self-edge implicit.
        assert!(store.has_edge(&alpha, &alpha).await.unwrap());

        // Replacing with the empty set clears it.
        store.set_edges(&alpha, &[]).await.unwrap();
        assert!(store.permitted_targets(&alpha).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_edges_and_shares() {
        let (store, owner, alpha, beta) = seeded().await;
        store.set_edges(&alpha, &[beta.clone()]).await.unwrap();
        store.set_edges(&beta, &[alpha.clone()]).await.unwrap();
        store.add_share(&alpha, owner).await.unwrap();

        store.delete_agent(&alpha, false).await.unwrap();
        assert!(store.agent_by_name(&alpha).await.unwrap().is_none());
        // Both directions of the edge set are gone.
        assert!(store.permitted_targets(&beta).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphans_hidden_from_normal_listing() {
        let (store, owner, _, _) = seeded().await;
        let ghost = AgentName::sanitize("ghost").unwrap();
        store.insert_orphan(&ghost, owner, RuntimeKind::SandboxedLlm).await.unwrap();

        assert_eq!(store.list_agents(false).await.unwrap().len(), 2);
        assert_eq!(store.list_agents(true).await.unwrap().len(), 3);
    }
}
