use std::sync::Arc;

use chrono::Utc;
use hive_auth::StoreKeyResolver;
use hive_container::{ContainerDriver, FakeDriver};
use hive_coord::{CoordStore, MemoryCoord};
use hive_gateway::{AgentClient, FakeAgentClient, RpcGateway};
use hive_ledger::{ActivityEvent, ActivityLedger};
use hive_lifecycle::{LifecycleConfig, LifecycleManager};
use hive_queue::ExecutionQueue;
use hive_scheduler::{Scheduler, SchedulerConfig};
use hive_store::StateStore;
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentConfig, AgentName, CallerIdentity,
    RuntimeKind, TriggerKind,
};
use uuid::Uuid;

use crate::handlers::events::allowed;
use crate::{require_manage, require_owner, visible_agents, AppState};

async fn state() -> AppState {
    let store = StateStore::in_memory().await.unwrap();
    let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoord::new());
    let client: Arc<dyn AgentClient> = Arc::new(FakeAgentClient::new());
    let queue = ExecutionQueue::new(coord.clone());
    let ledger = ActivityLedger::new(store.clone(), coord.clone());
    let lifecycle = LifecycleManager::new(
        Arc::new(FakeDriver::new()) as Arc<dyn ContainerDriver>,
        store.clone(),
        coord.clone(),
        client.clone(),
        LifecycleConfig::default(),
    );
    let gateway = RpcGateway::new(store.clone(), queue.clone(), ledger.clone(), client.clone());
    let scheduler = Scheduler::new(
        store.clone(),
        coord.clone(),
        queue.clone(),
        ledger.clone(),
        client,
        SchedulerConfig::default(),
    );
    AppState {
        resolver: Arc::new(StoreKeyResolver::new(store.clone())),
        store,
        coord,
        queue,
        ledger,
        lifecycle,
        gateway,
        scheduler,
    }
}

fn agent(name: &str) -> AgentName {
    AgentName::sanitize(name).unwrap()
}

async fn seed_agent(state: &AppState, name: &str, owner: Uuid) {
    state
        .store
        .create_agent(&agent(name), owner, "default", RuntimeKind::SandboxedLlm, false,
            &AgentConfig::default(), &[])
        .await
        .unwrap();
}

fn event_for(name: &str) -> ActivityEvent {
    ActivityEvent {
        activity_id: 1,
        agent: agent(name),
        activity_type: ActivityType::ChatStart,
        state: ActivityState::Started,
        triggered_by: TriggerKind::User,
        details: ActivityDetails::ChatStart { message_preview: "hi".into() },
        related_execution_id: None,
        parent_activity_id: None,
        at: Utc::now(),
    }
}

#[tokio::test]
async fn visible_set_follows_ownership_shares_and_edges() {
    let state = state().await;
    let owner = state.store.create_user("owner@example.com", false).await.unwrap();
    let other = state.store.create_user("other@example.com", false).await.unwrap();
    seed_agent(&state, "alpha", owner.id).await;
    seed_agent(&state, "beta", owner.id).await;
    seed_agent(&state, "gamma", other.id).await;

    // Owner sees owned agents only.
    let caller = CallerIdentity::User { id: owner.id, admin: false };
    assert_eq!(visible_agents(&state, &caller).await.unwrap(),
        vec![agent("alpha"), agent("beta")]);

    // A share widens the other user's set.
    state.store.add_share(&agent("alpha"), other.id).await.unwrap();
    let caller = CallerIdentity::User { id: other.id, admin: false };
    assert_eq!(visible_agents(&state, &caller).await.unwrap(),
        vec![agent("alpha"), agent("gamma")]);

    // Agent callers see their permitted targets plus themselves.
    state.store.set_edges(&agent("alpha"), &[agent("beta")]).await.unwrap();
    let caller = CallerIdentity::Agent { name: agent("alpha") };
    assert_eq!(visible_agents(&state, &caller).await.unwrap(),
        vec![agent("alpha"), agent("beta")]);

    // System sees the whole fleet.
    assert_eq!(visible_agents(&state, &CallerIdentity::System).await.unwrap().len(), 3);
}

#[tokio::test]
async fn websocket_filter_blocks_foreign_agents() {
    let state = state().await;
    let owner = state.store.create_user("owner@example.com", false).await.unwrap();
    let stranger = state.store.create_user("stranger@example.com", false).await.unwrap();
    seed_agent(&state, "alpha", owner.id).await;
    seed_agent(&state, "hidden", stranger.id).await;

    let caller = CallerIdentity::User { id: owner.id, admin: false };
    let allowlist = visible_agents(&state, &caller).await.unwrap();

    assert!(allowed(&event_for("alpha"), &allowlist));
    assert!(!allowed(&event_for("hidden"), &allowlist));
}

#[tokio::test]
async fn manage_and_owner_checks_dispatch_on_identity() {
    let state = state().await;
    let owner = state.store.create_user("owner@example.com", false).await.unwrap();
    let stranger = state.store.create_user("stranger@example.com", false).await.unwrap();
    seed_agent(&state, "alpha", owner.id).await;
    seed_agent(&state, "beta", owner.id).await;

    let owner_caller = CallerIdentity::User { id: owner.id, admin: false };
    let stranger_caller = CallerIdentity::User { id: stranger.id, admin: false };
    let self_caller = CallerIdentity::Agent { name: agent("alpha") };

    assert!(require_manage(&state, &owner_caller, &agent("alpha")).await.is_ok());
    assert!(require_manage(&state, &stranger_caller, &agent("alpha")).await.is_err());
    assert!(require_manage(&state, &self_caller, &agent("alpha")).await.is_ok());
    // An agent may not manage a different agent, even a permitted target.
    assert!(require_manage(&state, &self_caller, &agent("beta")).await.is_err());

    // Shares grant management but not ownership.
    state.store.add_share(&agent("alpha"), stranger.id).await.unwrap();
    assert!(require_manage(&state, &stranger_caller, &agent("alpha")).await.is_ok());
    assert!(require_owner(&state, &stranger_caller, &agent("alpha")).await.is_err());
    assert!(require_owner(&state, &owner_caller, &agent("alpha")).await.is_ok());

    // Admins pass the owner check everywhere.
    let admin = state.store.create_user("admin@example.com", true).await.unwrap();
    let admin_caller = CallerIdentity::User { id: admin.id, admin: true };
    assert!(require_owner(&state, &admin_caller, &agent("alpha")).await.is_ok());
}
