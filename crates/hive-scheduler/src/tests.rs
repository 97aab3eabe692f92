use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hive_coord::{CoordStore, MemoryCoord};
use hive_gateway::{AgentClient, FakeAgentClient};
use hive_ledger::ActivityLedger;
use hive_queue::ExecutionQueue;
use hive_store::StateStore;
use hive_types::{
    ActivityState, ActivityType, AgentConfig, AgentName, CallerIdentity, ExecutionStatus,
    RuntimeKind, TriggerKind,
};
use uuid::Uuid;

use crate::{Scheduler, SchedulerConfig};

struct Harness {
    scheduler: Scheduler,
    store: StateStore,
    coord: Arc<MemoryCoord>,
    client: Arc<FakeAgentClient>,
    queue: ExecutionQueue,
}

async fn harness() -> Harness {
    let store = StateStore::in_memory().await.unwrap();
    let coord = Arc::new(MemoryCoord::new());
    let queue = ExecutionQueue::new(coord.clone() as Arc<dyn CoordStore>);
    let ledger = ActivityLedger::new(store.clone(), coord.clone() as Arc<dyn CoordStore>);
    let client = Arc::new(FakeAgentClient::new());
    let scheduler = Scheduler::new(
        store.clone(),
        coord.clone() as Arc<dyn CoordStore>,
        queue.clone(),
        ledger,
        client.clone() as Arc<dyn AgentClient>,
        SchedulerConfig::default(),
    );
    Harness { scheduler, store, coord, client, queue }
}

async fn seeded_schedule(store: &StateStore, name: &str) -> (AgentName, i64) {
    let agent = AgentName::sanitize(name).unwrap();
    store
        .create_agent(&agent, Uuid::new_v4(), "default", RuntimeKind::SandboxedLlm, false,
            &AgentConfig::default(), &[])
        .await
        .unwrap();
    let due = Utc::now() - chrono::Duration::seconds(5);
    let schedule = store
        .create_schedule(&agent, "* * * * *", "UTC", "daily digest", true, false, Some(due))
        .await
        .unwrap();
    (agent, schedule.id)
}

#[tokio::test]
async fn due_fire_produces_one_sealed_execution() {
    let h = harness().await;
    let (agent, schedule_id) = seeded_schedule(&h.store, "writer").await;

    h.scheduler.tick_at(Utc::now()).await.unwrap();

    let executions = h.store.executions_for_schedule(schedule_id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.triggered_by, TriggerKind::Schedule);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution.transcript.is_some());

    // schedule_start closed, schedule_end recorded and parented to it.
    let activities = h.store.activities_for_execution(execution.id).await.unwrap();
    let start = activities
        .iter()
        .find(|a| a.activity_type == ActivityType::ScheduleStart)
        .unwrap();
    assert_eq!(start.state, ActivityState::Completed);
    let end = activities
        .iter()
        .find(|a| a.activity_type == ActivityType::ScheduleEnd)
        .unwrap();
    assert_eq!(end.parent_activity_id, Some(start.id));

    // next_run_at advanced strictly past the fire instant.
    let schedule = h.store.schedule_by_id(schedule_id).await.unwrap().unwrap();
    assert!(schedule.next_run_at.unwrap() > schedule.last_run_at.unwrap());

    // Slot and lock are both free again.
    assert!(h.queue.holder(&agent).await.unwrap().is_none());
    assert!(h
        .coord
        .get(&hive_coord::scheduler_lock_key(schedule_id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn busy_agent_fails_the_fire_without_retry() {
    let h = harness().await;
    let (agent, schedule_id) = seeded_schedule(&h.store, "writer").await;

    // A human holds the queue slot.
    let human = CallerIdentity::User { id: Uuid::new_v4(), admin: false };
    h.queue.submit(&agent, &human, None).await.unwrap();

    let now = Utc::now();
    h.scheduler.tick_at(now).await.unwrap();

    let executions = h.store.executions_for_schedule(schedule_id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(executions[0].error.as_deref(), Some("queue_busy"));

    // The sandbox never saw a dispatch.
    assert!(h.client.calls.lock().unwrap().is_empty());

    // No same-tick retry, and the cursor advanced to the next minute.
    let schedule = h.store.schedule_by_id(schedule_id).await.unwrap().unwrap();
    assert!(schedule.next_run_at.unwrap() > now);
    h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(h.store.executions_for_schedule(schedule_id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn two_instances_fire_at_most_once() {
    let h = harness().await;
    let (_, schedule_id) = seeded_schedule(&h.store, "writer").await;

    // A second scheduler instance sharing the same stores - the deployment
    // mistake the per-schedule lock defends against.
    let second = Scheduler::new(
        h.store.clone(),
        h.coord.clone() as Arc<dyn CoordStore>,
        h.queue.clone(),
        ActivityLedger::new(h.store.clone(), h.coord.clone() as Arc<dyn CoordStore>),
        h.client.clone() as Arc<dyn AgentClient>,
        SchedulerConfig::default(),
    );

    let now = Utc::now();
    let (a, b) = tokio::join!(h.scheduler.tick_at(now), second.tick_at(now));
    a.unwrap();
    b.unwrap();

    let executions = h.store.executions_for_schedule(schedule_id, 10).await.unwrap();
    assert_eq!(executions.len(), 1, "lock must prevent the duplicate fire");
}

#[tokio::test]
async fn dispatch_failure_is_recorded_not_propagated() {
    let h = harness().await;
    let (_, schedule_id) = seeded_schedule(&h.store, "writer").await;
    h.client.set_failing(true);

    h.scheduler.tick_at(Utc::now()).await.unwrap();

    let executions = h.store.executions_for_schedule(schedule_id, 10).await.unwrap();
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].error.as_deref().unwrap().contains("unreachable"));
}

#[tokio::test]
async fn manual_trigger_skips_the_cron_advance() {
    let h = harness().await;
    let (_, schedule_id) = seeded_schedule(&h.store, "writer").await;
    let before = h.store.schedule_by_id(schedule_id).await.unwrap().unwrap();

    let caller = CallerIdentity::User { id: Uuid::new_v4(), admin: true };
    let execution_id = h.scheduler.trigger_now(schedule_id, &caller).await.unwrap();

    let execution = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.triggered_by, TriggerKind::User);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    // No cron advance happened.
    let after = h.store.schedule_by_id(schedule_id).await.unwrap().unwrap();
    assert_eq!(after.next_run_at, before.next_run_at);
    assert_eq!(after.last_run_at, before.last_run_at);
}

#[tokio::test]
async fn resync_backfills_missing_next_fire() {
    let h = harness().await;
    let agent = AgentName::sanitize("writer").unwrap();
    h.store
        .create_agent(&agent, Uuid::new_v4(), "default", RuntimeKind::SandboxedLlm, false,
            &AgentConfig::default(), &[])
        .await
        .unwrap();
    let schedule = h
        .store
        .create_schedule(&agent, "* * * * *", "UTC", "m", true, false, None)
        .await
        .unwrap();

    h.scheduler.resync().await.unwrap();
    let after = h.store.schedule_by_id(schedule.id).await.unwrap().unwrap();
    assert!(after.next_run_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));
}
