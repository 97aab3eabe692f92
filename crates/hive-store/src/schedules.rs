//! Schedules and the scheduler's due-set query.

use chrono::{DateTime, Utc};
use hive_types::{AgentName, HiveError, HiveResult};

use crate::rows::ScheduleRecord;
use crate::{db_err, ts, StateStore};

impl StateStore {
    /// Insert a schedule.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        agent: &AgentName,
        cron: &str,
        timezone: &str,
        message: &str,
        enabled: bool,
        parallel: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> HiveResult<ScheduleRecord> {
        let now = Utc::now();
        let outcome = sqlx::query(
            "INSERT INTO schedules
                 (agent, cron, timezone, message, enabled, parallel, next_run_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.as_str())
        .bind(cron)
        .bind(timezone)
        .bind(message)
        .bind(enabled as i64)
        .bind(parallel as i64)
        .bind(next_run_at.map(ts))
        .bind(ts(now))
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(ScheduleRecord {
            id: outcome.last_insert_rowid(),
            agent: agent.clone(),
            cron: cron.to_string(),
            timezone: timezone.to_string(),
            message: message.to_string(),
            enabled,
            parallel,
            last_run_at: None,
            next_run_at,
            created_at: now,
        })
    }

    /// Fetch a schedule by id.
    pub async fn schedule_by_id(&self, id: i64) -> HiveResult<Option<ScheduleRecord>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| ScheduleRecord::from_row(&r)).transpose()
    }

    /// All schedules of an agent.
    pub async fn schedules_for_agent(&self, agent: &AgentName) -> HiveResult<Vec<ScheduleRecord>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE agent = ? ORDER BY id")
            .bind(agent.as_str())
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(ScheduleRecord::from_row).collect()
    }

    /// Enabled schedules due at `now` whose owning agent has autonomy on.
    /// This is the scheduler's candidate query, hitting the
    /// `(enabled, next_run_at)` index.
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> HiveResult<Vec<ScheduleRecord>> {
        let rows = sqlx::query(
            "SELECT s.* FROM schedules s
             JOIN agents a ON a.name = s.agent
             WHERE s.enabled = 1
               AND s.next_run_at IS NOT NULL
               AND s.next_run_at <= ?
               AND json_extract(a.config, '$.autonomy_enabled') = 1
             ORDER BY s.next_run_at",
        )
        .bind(ts(now))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(ScheduleRecord::from_row).collect()
    }

    /// All enabled schedules, for the scheduler's periodic cron-cache sync.
    pub async fn enabled_schedules(&self) -> HiveResult<Vec<ScheduleRecord>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE enabled = 1 ORDER BY id")
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(ScheduleRecord::from_row).collect()
    }

    /// Advance the fire cursor: set `last_run_at` and the strictly later
    /// `next_run_at`. Written before dispatch so a crash in between skips
    /// the fire rather than duplicating it.
    pub async fn advance_schedule(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> HiveResult<()> {
        let outcome = sqlx::query(
            "UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?",
        )
        .bind(ts(last_run_at))
        .bind(ts(next_run_at))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Set `next_run_at` without touching `last_run_at`. Used by the
    /// scheduler's resync to backfill schedules created behind its back.
    pub async fn set_schedule_next_run(
        &self,
        id: i64,
        next_run_at: DateTime<Utc>,
    ) -> HiveResult<()> {
        let outcome = sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
            .bind(ts(next_run_at))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Update a schedule's definition.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_schedule(
        &self,
        id: i64,
        cron: &str,
        timezone: &str,
        message: &str,
        parallel: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> HiveResult<()> {
        let outcome = sqlx::query(
            "UPDATE schedules
             SET cron = ?, timezone = ?, message = ?, parallel = ?, next_run_at = ?
             WHERE id = ?",
        )
        .bind(cron)
        .bind(timezone)
        .bind(message)
        .bind(parallel as i64)
        .bind(next_run_at.map(ts))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Flip the enabled flag.
    pub async fn set_schedule_enabled(&self, id: i64, enabled: bool) -> HiveResult<()> {
        let outcome = sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Delete a schedule.
    pub async fn delete_schedule(&self, id: i64) -> HiveResult<()> {
        let outcome = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hive_types::{AgentConfig, RuntimeKind};
    use uuid::Uuid;

    async fn agent_with_autonomy(store: &StateStore, name: &str, autonomy: bool) -> AgentName {
        let agent = AgentName::sanitize(name).unwrap();
        let config = AgentConfig { autonomy_enabled: autonomy, ..AgentConfig::default() };
        store
            .create_agent(&agent, Uuid::new_v4(), "default", RuntimeKind::SandboxedLlm, false,
                &config, &[])
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn due_respects_enabled_and_autonomy() {
        let store = StateStore::in_memory().await.unwrap();
        let on = agent_with_autonomy(&store, "auto-on", true).await;
        let off = agent_with_autonomy(&store, "auto-off", false).await;
        let now = Utc::now();
        let past = now - Duration::minutes(1);
        let future = now + Duration::minutes(5);

        store
            .create_schedule(&on, "* * * * *", "UTC", "go", true, false, Some(past))
            .await
            .unwrap();
        store
            .create_schedule(&on, "* * * * *", "UTC", "later", true, false, Some(future))
            .await
            .unwrap();
        store
            .create_schedule(&on, "* * * * *", "UTC", "disabled", false, false, Some(past))
            .await
            .unwrap();
        store
            .create_schedule(&off, "* * * * *", "UTC", "paused", true, false, Some(past))
            .await
            .unwrap();

        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message, "go");
    }

    #[tokio::test]
    async fn advance_moves_cursor_forward() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = agent_with_autonomy(&store, "writer", true).await;
        let now = Utc::now();
        let schedule = store
            .create_schedule(&agent, "* * * * *", "UTC", "m", true, false, Some(now))
            .await
            .unwrap();

        let next = now + Duration::minutes(1);
        store.advance_schedule(schedule.id, now, next).await.unwrap();
        let reread = store.schedule_by_id(schedule.id).await.unwrap().unwrap();
        assert!(reread.next_run_at.unwrap() > reread.last_run_at.unwrap());
        // Advanced out of the due window.
        assert!(store.due_schedules(now).await.unwrap().is_empty());
    }
}
