use std::sync::Arc;

use hive_container::{ContainerDriver, ContainerSpec, ContainerStatus, FakeDriver};
use hive_coord::{creds_key, CoordStore, MemoryCoord};
use hive_gateway::{AgentClient, FakeAgentClient};
use hive_store::StateStore;
use hive_types::{labels, AgentConfig, AgentName, AgentStatus, CapabilityProfile, ResourceSpec,
    RuntimeKind};
use uuid::Uuid;

use crate::{CreateAgent, LifecycleConfig, LifecycleManager};

struct Harness {
    manager: LifecycleManager,
    driver: Arc<FakeDriver>,
    store: StateStore,
    coord: Arc<MemoryCoord>,
    owner: Uuid,
}

async fn harness() -> Harness {
    let store = StateStore::in_memory().await.unwrap();
    let driver = Arc::new(FakeDriver::new());
    let coord = Arc::new(MemoryCoord::new());
    let client = Arc::new(FakeAgentClient::new());
    let owner = store.create_user("owner@example.com", false).await.unwrap().id;
    let manager = LifecycleManager::new(
        driver.clone() as Arc<dyn ContainerDriver>,
        store.clone(),
        coord.clone() as Arc<dyn CoordStore>,
        client as Arc<dyn AgentClient>,
        LifecycleConfig::default(),
    );
    Harness { manager, driver, store, coord, owner }
}

fn create_request(owner: Uuid, name: &str) -> CreateAgent {
    CreateAgent {
        name: name.to_string(),
        owner_id: owner,
        template: "default".to_string(),
        config: AgentConfig::default(),
        edges: vec![],
        auto_start: false,
    }
}

fn agent(name: &str) -> AgentName {
    AgentName::sanitize(name).unwrap()
}

#[tokio::test]
async fn create_sanitizes_and_provisions_key_blob() {
    let h = harness().await;
    let record = h
        .manager
        .create(create_request(h.owner, "My Agent!"))
        .await
        .unwrap();
    assert_eq!(record.name.as_str(), "my-agent");
    assert_eq!(record.status, AgentStatus::Created);

    // Agent key rides in the credential blob.
    let blob = h.coord.get_blob(&creds_key("my-agent")).await.unwrap().unwrap();
    let creds: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert!(creds["agent_api_key"].as_str().unwrap().starts_with("hive-"));

    // No container until start.
    assert!(!h.driver.exists("my-agent"));
}

#[tokio::test]
async fn unknown_template_is_validation() {
    let h = harness().await;
    let mut request = create_request(h.owner, "a");
    request.template = "nope".to_string();
    assert_eq!(h.manager.create(request).await.unwrap_err().kind(), "validation");
}

#[tokio::test]
async fn start_creates_labelled_container_and_is_idempotent() {
    let h = harness().await;
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();

    let inspect = h.driver.inspect("alpha").await.unwrap();
    assert_eq!(inspect.status, ContainerStatus::Running);
    assert_eq!(inspect.labels[labels::NAME], "alpha");
    assert_eq!(inspect.labels[labels::OWNER], h.owner.to_string());
    assert_eq!(inspect.labels[labels::CAPABILITY_PROFILE], "restricted");
    assert!(inspect.mounts.iter().any(|m| m.target == "/workspace"));
    assert_eq!(h.driver.create_count(), 1);

    // Start on a running, in-sync agent is a no-op: no recreate.
    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 1);
    let record = h.store.agent_required(&agent("alpha")).await.unwrap();
    assert_eq!(record.status, AgentStatus::Running);
}

#[tokio::test]
async fn changed_config_recreates_exactly_once() {
    let h = harness().await;
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 1);

    // Double the memory limit in declared config.
    let mut record = h.store.agent_required(&agent("alpha")).await.unwrap();
    record.config.resources = ResourceSpec { cpus: 1.0, memory_mb: 4096 };
    h.store.update_agent_config(&agent("alpha"), &record.config).await.unwrap();

    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 2);
    let inspect = h.driver.inspect("alpha").await.unwrap();
    assert_eq!(inspect.resources.memory_mb, 4096);
    assert_eq!(inspect.labels[labels::MEMORY], "4096");

    // And only once: a further start with no change is a no-op.
    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 2);
}

#[tokio::test]
async fn capability_profile_change_recreates() {
    let h = harness().await;
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();

    let mut record = h.store.agent_required(&agent("alpha")).await.unwrap();
    record.config.capability_profile = CapabilityProfile::Full;
    h.store.update_agent_config(&agent("alpha"), &record.config).await.unwrap();

    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 2);
    let inspect = h.driver.inspect("alpha").await.unwrap();
    assert_eq!(inspect.labels[labels::CAPABILITY_PROFILE], "full");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness().await;
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();

    h.manager.stop(&agent("alpha")).await.unwrap();
    h.manager.stop(&agent("alpha")).await.unwrap();
    let record = h.store.agent_required(&agent("alpha")).await.unwrap();
    assert_eq!(record.status, AgentStatus::Stopped);

    // Stopped agents restart without a recreate when nothing changed.
    h.manager.start(&agent("alpha")).await.unwrap();
    assert_eq!(h.driver.create_count(), 1);
}

#[tokio::test]
async fn delete_cascades_and_protects_system_agent() {
    let h = harness().await;
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();

    h.manager.delete(&agent("alpha")).await.unwrap();
    assert!(!h.driver.exists("alpha"));
    assert!(h.store.agent_by_name(&agent("alpha")).await.unwrap().is_none());
    assert!(h.coord.get_blob(&creds_key("alpha")).await.unwrap().is_none());

    // The designated system agent refuses deletion.
    let system = agent("steward");
    h.store
        .create_agent(&system, h.owner, "default", RuntimeKind::SandboxedLlm, true,
            &AgentConfig::default(), &[])
        .await
        .unwrap();
    assert_eq!(
        h.manager.delete(&system).await.unwrap_err().kind(),
        "permission_denied"
    );
}

#[tokio::test]
async fn reconcile_marks_orphans_and_stopped() {
    let h = harness().await;

    // A managed agent whose container disappears.
    h.manager.create(create_request(h.owner, "alpha")).await.unwrap();
    h.manager.start(&agent("alpha")).await.unwrap();
    h.driver.remove("alpha").await.unwrap();

    // A container nobody has a row for.
    let ghost_spec = ContainerSpec {
        name: "ghost".to_string(),
        image: "hive-agent:latest".to_string(),
        env: vec![],
        mounts: vec![],
        labels: std::collections::HashMap::from([
            (labels::NAME.to_string(), "ghost".to_string()),
            (labels::OWNER.to_string(), h.owner.to_string()),
            (labels::KIND.to_string(), "sandboxed-llm".to_string()),
        ]),
        capability_profile: CapabilityProfile::Restricted,
        resources: ResourceSpec::default(),
    };
    h.driver.create(&ghost_spec).await.unwrap();

    let report = h.manager.reconcile().await.unwrap();
    assert_eq!(report.orphans, vec![agent("ghost")]);
    assert_eq!(report.stopped, vec![agent("alpha")]);

    // Orphans are admin-only: hidden from the normal listing.
    assert!(h
        .store
        .list_agents(false)
        .await
        .unwrap()
        .iter()
        .all(|a| a.name != agent("ghost")));
    let with_orphans = h.store.list_agents(true).await.unwrap();
    assert!(with_orphans.iter().any(|a| a.name == agent("ghost") && a.orphaned));
}
