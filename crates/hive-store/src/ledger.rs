//! Executions and activities.
//!
//! Append-mostly: execution rows mutate only to transition status and seal
//! timestamps; activity rows mutate only to close their state. The
//! execution-before-activity ordering is enforced here by doing both inserts
//! in one transaction, execution first.

use chrono::{DateTime, Utc};
use hive_types::{
    ActivityState, AgentName, ExecutionStatus, HiveError, HiveResult, TranscriptEntry,
};
use uuid::Uuid;

use crate::rows::{ActivityRecord, ExecutionRecord, NewActivity, NewExecution};
use crate::{db_err, ts, StateStore};

impl StateStore {
    /// Insert an execution row and return its durable id.
    pub async fn insert_execution(&self, new: &NewExecution) -> HiveResult<i64> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let id = insert_execution_tx(&mut tx, new).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    /// Insert an execution row and its triggering activity in one
    /// transaction, execution FIRST, with the activity's link pointing at
    /// the fresh row. Returns `(execution_id, activity_id)`.
    pub async fn insert_execution_with_activity(
        &self,
        new_execution: &NewExecution,
        new_activity: &NewActivity,
    ) -> HiveResult<(i64, i64)> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let execution_id = insert_execution_tx(&mut tx, new_execution).await?;
        let mut activity = new_activity.clone();
        activity.related_execution_id = Some(execution_id);
        let activity_id = insert_activity_tx(&mut tx, &activity).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((execution_id, activity_id))
    }

    /// Insert a standalone activity row.
    pub async fn insert_activity(&self, new: &NewActivity) -> HiveResult<i64> {
        if let Some(execution_id) = new.related_execution_id {
            // The referenced execution must already exist; a dangling link is
            // an invariant violation, not a foreign-key accident.
            if self.execution_by_id(execution_id).await?.is_none() {
                return Err(HiveError::Internal(format!(
                    "activity references missing execution {execution_id}"
                )));
            }
        }
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let id = insert_activity_tx(&mut tx, new).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    /// Fetch an activity by id.
    pub async fn activity_by_id(&self, id: i64) -> HiveResult<Option<ActivityRecord>> {
        let row = sqlx::query("SELECT * FROM activities WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| ActivityRecord::from_row(&r)).transpose()
    }

    /// Close an activity that is still `started`.
    pub async fn complete_activity(
        &self,
        id: i64,
        state: ActivityState,
        completed_at: DateTime<Utc>,
    ) -> HiveResult<()> {
        let outcome = sqlx::query(
            "UPDATE activities
             SET state = ?, completed_at = ?,
                 duration_ms = CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER)
             WHERE id = ? AND state = 'started'",
        )
        .bind(state.as_str())
        .bind(ts(completed_at))
        .bind(ts(completed_at))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::Conflict(format!("activity {id} is not open")));
        }
        Ok(())
    }

    /// Recent activities over the caller's visible agent set, newest first,
    /// ordered by `(created_at, id)` so readers reconstruct timelines without
    /// trusting the server clock alone.
    pub async fn recent_activities(
        &self,
        visible: &[AgentName],
        since: DateTime<Utc>,
        limit: i64,
    ) -> HiveResult<Vec<ActivityRecord>> {
        if visible.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; visible.len()].join(", ");
        let sql = format!(
            "SELECT * FROM activities
             WHERE agent IN ({placeholders}) AND created_at >= ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        for agent in visible {
            query = query.bind(agent.as_str());
        }
        let rows = query
            .bind(ts(since))
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(ActivityRecord::from_row).collect()
    }

    /// Activities linked to an execution, in insertion order.
    pub async fn activities_for_execution(
        &self,
        execution_id: i64,
    ) -> HiveResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM activities WHERE related_execution_id = ?
             ORDER BY created_at, id",
        )
        .bind(execution_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(ActivityRecord::from_row).collect()
    }

    //─────────────────────────────
    //  Execution transitions
    //─────────────────────────────

    /// Fetch an execution by durable id.
    pub async fn execution_by_id(&self, id: i64) -> HiveResult<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| ExecutionRecord::from_row(&r)).transpose()
    }

    /// Recent executions of an agent, newest first.
    pub async fn executions_for_agent(
        &self,
        agent: &AgentName,
        limit: i64,
    ) -> HiveResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE agent = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(agent.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(ExecutionRecord::from_row).collect()
    }

    /// Executions produced by a schedule, newest first.
    pub async fn executions_for_schedule(
        &self,
        schedule_id: i64,
        limit: i64,
    ) -> HiveResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE schedule_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(schedule_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(ExecutionRecord::from_row).collect()
    }

    /// Record the volatile queue id once the sequential path admits the work.
    pub async fn set_execution_queue_id(&self, id: i64, queue_id: Uuid) -> HiveResult<()> {
        let outcome = sqlx::query("UPDATE executions SET queue_id = ? WHERE id = ?")
            .bind(queue_id.to_string())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::NotFound(format!("execution {id}")));
        }
        Ok(())
    }

    /// Transition `queued → running`, stamping the start time.
    pub async fn mark_execution_running(
        &self,
        id: i64,
        started_at: DateTime<Utc>,
    ) -> HiveResult<()> {
        let outcome = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(ts(started_at))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(HiveError::Conflict(format!("execution {id} is not queued")));
        }
        Ok(())
    }

    /// Seal an execution with a terminal status. Idempotent against already
    /// sealed rows: sealing a terminal row returns `Ok(false)` and changes
    /// nothing, so a late completion after a cancel cannot overwrite it.
    #[allow(clippy::too_many_arguments)]
    pub async fn seal_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        transcript: Option<&[TranscriptEntry]>,
        cost_usd: Option<f64>,
        tokens: Option<i64>,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> HiveResult<bool> {
        if !status.is_terminal() {
            return Err(HiveError::Internal(format!(
                "seal with non-terminal status {}",
                status.as_str()
            )));
        }
        let transcript_blob = transcript.map(serde_json::to_string).transpose()?;
        let outcome = sqlx::query(
            "UPDATE executions
             SET status = ?, transcript = ?, cost_usd = ?, tokens = ?, error = ?,
                 completed_at = ?,
                 duration_ms = CAST(
                     (julianday(?) - julianday(COALESCE(started_at, created_at)))
                     * 86400000 AS INTEGER)
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.as_str())
        .bind(transcript_blob)
        .bind(cost_usd)
        .bind(tokens)
        .bind(error)
        .bind(ts(completed_at))
        .bind(ts(completed_at))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(outcome.rows_affected() > 0)
    }
}

async fn insert_execution_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewExecution,
) -> HiveResult<i64> {
    let outcome = sqlx::query(
        "INSERT INTO executions
             (agent, schedule_id, queue_id, input, triggered_by, source_agent, status,
              started_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.agent.as_str())
    .bind(new.schedule_id)
    .bind(new.queue_id.map(|q| q.to_string()))
    .bind(&new.input)
    .bind(new.triggered_by.as_str())
    .bind(new.source_agent.as_ref().map(|a| a.as_str().to_string()))
    .bind(new.status.as_str())
    .bind(matches!(new.status, ExecutionStatus::Running).then(|| ts(Utc::now())))
    .bind(ts(Utc::now()))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(outcome.last_insert_rowid())
}

async fn insert_activity_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewActivity,
) -> HiveResult<i64> {
    let now = ts(Utc::now());
    let outcome = sqlx::query(
        "INSERT INTO activities
             (agent, activity_type, state, started_at, parent_activity_id,
              related_execution_id, related_message_id, triggered_by, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.agent.as_str())
    .bind(new.activity_type.as_str())
    .bind(new.state.as_str())
    .bind(&now)
    .bind(new.parent_activity_id)
    .bind(new.related_execution_id)
    .bind(new.related_message_id)
    .bind(new.triggered_by.as_str())
    .bind(serde_json::to_string(&new.details)?)
    .bind(&now)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(outcome.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_types::{ActivityDetails, ActivityType, TriggerKind};

    fn new_execution(agent: &AgentName) -> NewExecution {
        NewExecution {
            agent: agent.clone(),
            schedule_id: None,
            queue_id: None,
            input: "do things".to_string(),
            triggered_by: TriggerKind::User,
            source_agent: None,
            status: ExecutionStatus::Queued,
        }
    }

    fn chat_start(agent: &AgentName) -> NewActivity {
        NewActivity {
            agent: agent.clone(),
            activity_type: ActivityType::ChatStart,
            state: ActivityState::Started,
            parent_activity_id: None,
            related_execution_id: None,
            related_message_id: None,
            triggered_by: TriggerKind::User,
            details: ActivityDetails::ChatStart { message_preview: "do things".to_string() },
        }
    }

    #[tokio::test]
    async fn execution_row_precedes_activity_row() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let (execution_id, activity_id) = store
            .insert_execution_with_activity(&new_execution(&agent), &chat_start(&agent))
            .await
            .unwrap();

        let activity = store.activity_by_id(activity_id).await.unwrap().unwrap();
        assert_eq!(activity.related_execution_id, Some(execution_id));

        let execution = store.execution_by_id(execution_id).await.unwrap().unwrap();
        // Lower id and no-later creation time than the activity referencing it.
        assert!(execution.created_at <= activity.created_at);
    }

    #[tokio::test]
    async fn dangling_activity_link_is_internal_error() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let mut activity = chat_start(&agent);
        activity.related_execution_id = Some(999);
        let err = store.insert_activity(&activity).await.unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn status_seals_once() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let id = store.insert_execution(&new_execution(&agent)).await.unwrap();

        store.mark_execution_running(id, Utc::now()).await.unwrap();
        let sealed = store
            .seal_execution(id, ExecutionStatus::Cancelled, None, None, None, None, Utc::now())
            .await
            .unwrap();
        assert!(sealed);

        // A late success cannot overwrite the cancel.
        let resealed = store
            .seal_execution(id, ExecutionStatus::Succeeded, None, Some(0.1), None, None, Utc::now())
            .await
            .unwrap();
        assert!(!resealed);
        let row = store.execution_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn transcript_seal_round_trips() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let id = store.insert_execution(&new_execution(&agent)).await.unwrap();
        let transcript = vec![
            TranscriptEntry::Init { model: "m".to_string(), tools: vec!["bash".to_string()] },
            TranscriptEntry::Result {
                outcome: "done".to_string(),
                cost_usd: 0.25,
                duration_ms: 1200,
                tokens: 900,
            },
        ];
        store
            .seal_execution(
                id,
                ExecutionStatus::Succeeded,
                Some(&transcript),
                Some(0.25),
                Some(900),
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        let row = store.execution_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.transcript.unwrap(), transcript);
        assert_eq!(row.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn recent_activities_filters_by_visible_set() {
        let store = StateStore::in_memory().await.unwrap();
        let alpha = AgentName::sanitize("alpha").unwrap();
        let beta = AgentName::sanitize("beta").unwrap();
        store.insert_activity(&chat_start(&alpha)).await.unwrap();
        store.insert_activity(&chat_start(&beta)).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(5);
        let visible = store.recent_activities(&[alpha.clone()], since, 50).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].agent, alpha);

        assert!(store.recent_activities(&[], since, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activity_closes_exactly_once() {
        let store = StateStore::in_memory().await.unwrap();
        let agent = AgentName::sanitize("alpha").unwrap();
        let id = store.insert_activity(&chat_start(&agent)).await.unwrap();

        store.complete_activity(id, ActivityState::Completed, Utc::now()).await.unwrap();
        let err = store
            .complete_activity(id, ActivityState::Failed, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }
}
