#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-ledger** – Activity and execution ledger for the hive control
//! plane.
//!
//! Single writer of execution/activity ordering: other components call into
//! this crate rather than writing those tables directly. The load-bearing
//! rule lives here: for scheduled and agent-originated work the execution
//! row is inserted FIRST and the triggering activity second, with its link
//! pointing at the fresh row, in one transaction. Dashboards can then render
//! an execution bar and attach arrows without follow-up lookups.
//!
//! Every activity write is published on the coordination store's `events`
//! channel so all API replicas re-broadcast the same stream, and mirrored on
//! a process-local broadcast channel for in-process subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hive_coord::{CoordStore, EVENTS_CHANNEL};
use hive_store::{NewActivity, NewExecution, StateStore};
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentName, ExecutionStatus, HiveResult,
    TranscriptEntry, TriggerKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

const LOCAL_CHANNEL_CAPACITY: usize = 1024;

/// Delta published for every activity write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Activity row id.
    pub activity_id: i64,
    /// Agent the event belongs to.
    pub agent: AgentName,
    /// Activity kind.
    pub activity_type: ActivityType,
    /// Lifecycle state carried by this delta.
    pub state: ActivityState,
    /// Identity kind that triggered the activity.
    pub triggered_by: TriggerKind,
    /// Typed details blob.
    pub details: ActivityDetails,
    /// Linked execution row, if any.
    pub related_execution_id: Option<i64>,
    /// Parent activity, if structured.
    pub parent_activity_id: Option<i64>,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// Ledger facade over the state store and the event fan-out.
#[derive(Clone)]
pub struct ActivityLedger {
    store: StateStore,
    coord: Arc<dyn CoordStore>,
    local: broadcast::Sender<ActivityEvent>,
}

impl ActivityLedger {
    /// Create a ledger over `store` and `coord`.
    pub fn new(store: StateStore, coord: Arc<dyn CoordStore>) -> Self {
        let (local, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self { store, coord, local }
    }

    /// The underlying state store, for read paths.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Subscribe to this process's copy of the activity stream.
    pub fn subscribe_local(&self) -> broadcast::Receiver<ActivityEvent> {
        self.local.subscribe()
    }

    /// Insert an execution row and its triggering activity, execution first,
    /// then publish the activity delta. Returns `(execution_id, activity_id)`.
    pub async fn record_execution_start(
        &self,
        new_execution: &NewExecution,
        new_activity: &NewActivity,
    ) -> HiveResult<(i64, i64)> {
        let (execution_id, activity_id) = self
            .store
            .insert_execution_with_activity(new_execution, new_activity)
            .await?;
        self.publish(ActivityEvent {
            activity_id,
            agent: new_activity.agent.clone(),
            activity_type: new_activity.activity_type,
            state: new_activity.state,
            triggered_by: new_activity.triggered_by,
            details: new_activity.details.clone(),
            related_execution_id: Some(execution_id),
            parent_activity_id: new_activity.parent_activity_id,
            at: Utc::now(),
        })
        .await;
        Ok((execution_id, activity_id))
    }

    /// Insert a standalone activity and publish its delta.
    pub async fn record_activity(&self, new: &NewActivity) -> HiveResult<i64> {
        let activity_id = self.store.insert_activity(new).await?;
        self.publish(ActivityEvent {
            activity_id,
            agent: new.agent.clone(),
            activity_type: new.activity_type,
            state: new.state,
            triggered_by: new.triggered_by,
            details: new.details.clone(),
            related_execution_id: new.related_execution_id,
            parent_activity_id: new.parent_activity_id,
            at: Utc::now(),
        })
        .await;
        Ok(activity_id)
    }

    /// Close an open activity and publish the closing delta.
    pub async fn close_activity(&self, activity_id: i64, state: ActivityState) -> HiveResult<()> {
        let now = Utc::now();
        self.store.complete_activity(activity_id, state, now).await?;
        match self.store.activity_by_id(activity_id).await? {
            Some(row) => {
                self.publish(ActivityEvent {
                    activity_id,
                    agent: row.agent,
                    activity_type: row.activity_type,
                    state,
                    triggered_by: row.triggered_by,
                    details: row.details,
                    related_execution_id: row.related_execution_id,
                    parent_activity_id: row.parent_activity_id,
                    at: now,
                })
                .await;
            }
            None => {
                // complete_activity succeeded, so the row vanishing here is
                // an ordering bug, not a race to shrug off.
                error!(activity_id, "closed activity row missing");
            }
        }
        Ok(())
    }

    /// Seal an execution row with a terminal status. Returns `false` when
    /// the row was already terminal (e.g. cancelled before this completion
    /// arrived); the earlier seal wins.
    #[allow(clippy::too_many_arguments)]
    pub async fn seal_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        transcript: Option<&[TranscriptEntry]>,
        cost_usd: Option<f64>,
        tokens: Option<i64>,
        error: Option<&str>,
    ) -> HiveResult<bool> {
        self.store
            .seal_execution(execution_id, status, transcript, cost_usd, tokens, error, Utc::now())
            .await
    }

    async fn publish(&self, event: ActivityEvent) {
        // Local mirror first; a lagging in-process subscriber is fine.
        let _ = self.local.send(event.clone());
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.coord.publish(EVENTS_CHANNEL, &payload).await {
                    warn!(activity_id = event.activity_id, "activity fan-out failed: {e}");
                }
            }
            Err(e) => error!("activity event serialization failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_coord::MemoryCoord;

    fn agent(name: &str) -> AgentName {
        AgentName::sanitize(name).unwrap()
    }

    async fn ledger() -> (ActivityLedger, Arc<MemoryCoord>) {
        let store = StateStore::in_memory().await.unwrap();
        let coord = Arc::new(MemoryCoord::new());
        (ActivityLedger::new(store, coord.clone() as Arc<dyn CoordStore>), coord)
    }

    fn schedule_start(name: &AgentName) -> NewActivity {
        NewActivity {
            agent: name.clone(),
            activity_type: ActivityType::ScheduleStart,
            state: ActivityState::Started,
            parent_activity_id: None,
            related_execution_id: None,
            related_message_id: None,
            triggered_by: TriggerKind::Schedule,
            details: ActivityDetails::ScheduleStart { schedule_id: 1, cron: "* * * * *".into() },
        }
    }

    #[tokio::test]
    async fn execution_start_links_and_broadcasts() {
        let (ledger, coord) = ledger().await;
        let writer = agent("writer");
        let mut local = ledger.subscribe_local();
        let mut remote = coord.subscribe(EVENTS_CHANNEL).await.unwrap();

        let new_execution = NewExecution {
            agent: writer.clone(),
            schedule_id: Some(1),
            queue_id: None,
            input: "daily digest".into(),
            triggered_by: TriggerKind::Schedule,
            source_agent: None,
            status: ExecutionStatus::Queued,
        };
        let (execution_id, activity_id) = ledger
            .record_execution_start(&new_execution, &schedule_start(&writer))
            .await
            .unwrap();

        let event = local.recv().await.unwrap();
        assert_eq!(event.activity_id, activity_id);
        assert_eq!(event.related_execution_id, Some(execution_id));
        assert_eq!(event.state, ActivityState::Started);

        // Remote replicas see the same delta through the events channel.
        let payload = remote.recv().await.unwrap();
        let remote_event: ActivityEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(remote_event, event);
    }

    #[tokio::test]
    async fn close_publishes_terminal_state() {
        let (ledger, _) = ledger().await;
        let writer = agent("writer");
        let mut local = ledger.subscribe_local();

        let activity_id = ledger.record_activity(&schedule_start(&writer)).await.unwrap();
        ledger.close_activity(activity_id, ActivityState::Failed).await.unwrap();

        assert_eq!(local.recv().await.unwrap().state, ActivityState::Started);
        let closing = local.recv().await.unwrap();
        assert_eq!(closing.state, ActivityState::Failed);
        assert_eq!(closing.activity_id, activity_id);
    }

    #[tokio::test]
    async fn earlier_seal_wins() {
        let (ledger, _) = ledger().await;
        let writer = agent("writer");
        let new_execution = NewExecution {
            agent: writer.clone(),
            schedule_id: None,
            queue_id: None,
            input: "task".into(),
            triggered_by: TriggerKind::User,
            source_agent: None,
            status: ExecutionStatus::Running,
        };
        let (execution_id, _) = ledger
            .record_execution_start(&new_execution, &schedule_start(&writer))
            .await
            .unwrap();

        assert!(ledger
            .seal_execution(execution_id, ExecutionStatus::Cancelled, None, None, None, None)
            .await
            .unwrap());
        assert!(!ledger
            .seal_execution(execution_id, ExecutionStatus::Succeeded, None, None, None, None)
            .await
            .unwrap());
    }
}
