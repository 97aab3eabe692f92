use std::sync::Arc;
use std::time::Duration;

use hive_coord::{CoordStore, MemoryCoord};
use hive_ledger::ActivityLedger;
use hive_queue::ExecutionQueue;
use hive_store::StateStore;
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentConfig, AgentName, CallOverrides,
    CallerIdentity, ExecutionMode, ExecutionStatus, RuntimeKind,
};
use uuid::Uuid;

use crate::{CallOutcome, CallRequest, FakeAgentClient, RpcGateway};

struct Harness {
    gateway: RpcGateway,
    store: StateStore,
    client: Arc<FakeAgentClient>,
    owner: Uuid,
}

async fn harness() -> Harness {
    let store = StateStore::in_memory().await.unwrap();
    let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoord::new());
    let queue = ExecutionQueue::new(coord.clone());
    let ledger = ActivityLedger::new(store.clone(), coord);
    let client = Arc::new(FakeAgentClient::new());
    let owner = store.create_user("owner@example.com", false).await.unwrap().id;
    for name in ["orch", "worker"] {
        store
            .create_agent(
                &AgentName::sanitize(name).unwrap(),
                owner,
                "default",
                RuntimeKind::SandboxedLlm,
                false,
                &AgentConfig::default(),
                &[],
            )
            .await
            .unwrap();
    }
    let gateway =
        RpcGateway::new(store.clone(), queue, ledger, client.clone() as Arc<dyn crate::AgentClient>);
    Harness { gateway, store, client, owner }
}

fn agent(name: &str) -> AgentName {
    AgentName::sanitize(name).unwrap()
}

fn request(caller: CallerIdentity, target: &str, mode: ExecutionMode) -> CallRequest {
    CallRequest {
        caller,
        target: agent(target),
        message: "summarize the logs".into(),
        mode,
        overrides: CallOverrides::default(),
    }
}

#[tokio::test]
async fn agent_without_edge_is_denied_and_audited() {
    let h = harness().await;
    let caller = CallerIdentity::Agent { name: agent("orch") };

    let err = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permission_denied");

    // No chat_start on the target.
    let since = chrono::Utc::now() - chrono::Duration::minutes(1);
    let on_worker = h.store.recent_activities(&[agent("worker")], since, 10).await.unwrap();
    assert!(on_worker.is_empty());

    // A failed-collaboration audit entry on the source.
    let on_orch = h.store.recent_activities(&[agent("orch")], since, 10).await.unwrap();
    assert_eq!(on_orch.len(), 1);
    assert_eq!(on_orch[0].activity_type, ActivityType::AgentCollaboration);
    assert_eq!(on_orch[0].state, ActivityState::Failed);
    assert!(matches!(
        &on_orch[0].details,
        ActivityDetails::PermissionDenied { source, target }
            if source == &agent("orch") && target == &agent("worker")
    ));

    // The sandbox never saw the call.
    assert!(h.client.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn edge_grants_the_call_and_brackets_collaboration() {
    let h = harness().await;
    h.store.set_edges(&agent("orch"), &[agent("worker")]).await.unwrap();
    let caller = CallerIdentity::Agent { name: agent("orch") };

    let outcome = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap();
    let CallOutcome::Completed { execution_id, response } = outcome else {
        panic!("expected completion");
    };
    assert!(response.result.contains("summarize"));

    // Execution stamped with the calling agent.
    let row = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
    assert_eq!(row.source_agent, Some(agent("orch")));
    assert_eq!(row.status, ExecutionStatus::Succeeded);
    assert!(row.transcript.is_some());

    // Collaboration opened and closed.
    let since = chrono::Utc::now() - chrono::Duration::minutes(1);
    let on_orch = h.store.recent_activities(&[agent("orch")], since, 10).await.unwrap();
    let collaboration = on_orch
        .iter()
        .find(|a| a.activity_type == ActivityType::AgentCollaboration)
        .unwrap();
    assert_eq!(collaboration.state, ActivityState::Completed);

    // Identity propagated to the sandbox.
    let calls = h.client.calls.lock().unwrap();
    assert_eq!(calls[0].2.as_deref(), Some("orch"));
}

#[tokio::test]
async fn system_bypasses_the_edge_set() {
    let h = harness().await;
    let outcome = h
        .gateway
        .call(request(CallerIdentity::System, "worker", ExecutionMode::Parallel))
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Completed { .. }));
}

#[tokio::test]
async fn foreign_user_is_denied() {
    let h = harness().await;
    let stranger = h.store.create_user("stranger@example.com", false).await.unwrap();
    let caller = CallerIdentity::User { id: stranger.id, admin: false };
    let err = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permission_denied");
}

#[tokio::test]
async fn second_sequential_caller_gets_busy() {
    let h = harness().await;
    h.client.set_latency(Duration::from_millis(200));
    let caller = CallerIdentity::User { id: h.owner, admin: false };

    let first = {
        let gateway = h.gateway.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            gateway.call(request(caller, "worker", ExecutionMode::Sequential)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h
        .gateway
        .call(request(caller.clone(), "worker", ExecutionMode::Sequential))
        .await
        .unwrap();
    match second {
        CallOutcome::Busy { holder, retry_after_secs } => {
            assert_eq!(holder, caller.holder_label());
            assert!(retry_after_secs >= 1);
        }
        other => panic!("expected busy, got {other:?}"),
    }

    assert!(matches!(
        first.await.unwrap().unwrap(),
        CallOutcome::Completed { .. }
    ));

    // Slot released; the next submit succeeds immediately.
    let third = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap();
    assert!(matches!(third, CallOutcome::Completed { .. }));
}

#[tokio::test]
async fn parallel_tasks_do_not_contend_with_chat() {
    let h = harness().await;
    h.client.set_latency(Duration::from_millis(150));
    let caller = CallerIdentity::User { id: h.owner, admin: false };

    let chat = {
        let gateway = h.gateway.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            gateway.call(request(caller, "worker", ExecutionMode::Sequential)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The parallel task completes even while the chat slot is held.
    let outcome = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Parallel))
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Completed { .. }));
    chat.await.unwrap().unwrap();
}

#[tokio::test]
async fn async_task_returns_receipt_then_seals() {
    let h = harness().await;
    h.client.set_latency(Duration::from_millis(100));
    let caller = CallerIdentity::User { id: h.owner, admin: false };

    let outcome = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::ParallelAsync))
        .await
        .unwrap();
    let CallOutcome::Accepted { execution_id } = outcome else {
        panic!("expected accepted receipt");
    };

    // Not yet terminal at accept time.
    let row = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
    assert!(!row.status.is_terminal());

    // Polling reaches the sealed row.
    for _ in 0..50 {
        let row = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
        if row.status.is_terminal() {
            assert_eq!(row.status, ExecutionStatus::Succeeded);
            assert!(row.transcript.is_some());
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("async execution never sealed");
}

#[tokio::test]
async fn io_failure_releases_slot_and_seals_failed() {
    let h = harness().await;
    h.client.set_failing(true);
    let caller = CallerIdentity::User { id: h.owner, admin: false };

    let err = h
        .gateway
        .call(request(caller.clone(), "worker", ExecutionMode::Sequential))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "dependency_unavailable");

    let rows = h.store.executions_for_agent(&agent("worker"), 5).await.unwrap();
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
    assert!(rows[0].error.as_deref().unwrap().contains("unreachable"));

    // Slot is free again.
    h.client.set_failing(false);
    let outcome = h
        .gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Completed { .. }));
}

#[tokio::test]
async fn terminate_seals_cancelled_and_frees_the_slot() {
    let h = harness().await;
    h.client.set_latency(Duration::from_secs(5));
    let caller = CallerIdentity::User { id: h.owner, admin: false };

    let long_running = {
        let gateway = h.gateway.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            gateway.call(request(caller, "worker", ExecutionMode::Sequential)).await
        })
    };

    // Wait for the execution row to appear.
    let execution_id = loop {
        let rows = h.store.executions_for_agent(&agent("worker"), 1).await.unwrap();
        if let Some(row) = rows.first() {
            break row.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    h.gateway
        .terminate(&agent("worker"), execution_id, &caller, Some("runaway".into()))
        .await
        .unwrap();

    // Sandbox terminate invoked, row sealed cancelled, activity linked.
    assert_eq!(h.client.terminated.lock().unwrap()[0], ("worker".to_string(), execution_id));
    let row = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);
    let linked = h.store.activities_for_execution(execution_id).await.unwrap();
    assert!(linked
        .iter()
        .any(|a| a.activity_type == ActivityType::ExecutionCancelled));

    // Next sequential submit succeeds immediately: the slot was released.
    h.client.set_latency(Duration::ZERO);
    let outcome = h
        .gateway
        .call(request(caller.clone(), "worker", ExecutionMode::Sequential))
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Completed { .. }));

    // Terminate is idempotent.
    h.gateway
        .terminate(&agent("worker"), execution_id, &caller, None)
        .await
        .unwrap();

    // The late completion from the killed dispatch cannot overwrite the
    // cancelled seal.
    let _ = long_running.await.unwrap();
    let row = h.store.execution_by_id(execution_id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn chat_appends_session_history_for_users() {
    let h = harness().await;
    let caller = CallerIdentity::User { id: h.owner, admin: false };
    h.gateway
        .call(request(caller, "worker", ExecutionMode::Sequential))
        .await
        .unwrap();

    let session = h.store.session_for(&agent("worker"), h.owner).await.unwrap();
    let messages = h.store.messages_for_session(session.id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert!(messages[1].cost_usd.unwrap() > 0.0);
}
