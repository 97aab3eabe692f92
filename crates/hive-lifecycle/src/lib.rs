#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-lifecycle** – Agent lifecycle management for the hive control
//! plane.
//!
//! Reconciles declared agent configuration (resources, mounts, env, API-key
//! mode, capability preset) with running container state. `start` is the
//! reconciliation seam: when any tracked field diverges between the state
//! store and the container engine, the container is recreated with the
//! declared configuration, preserving the agent's workspace volume and its
//! authoritative label identity.
//!
//! The container engine is mutated only here; every other component treats
//! it as read-only.

use std::collections::HashMap;
use std::sync::Arc;

use hive_container::{
    ContainerDriver, ContainerError, ContainerInspect, ContainerSpec, ContainerStats,
    ContainerStatus, MountSpec,
};
use hive_coord::{creds_key, CoordStore};
use hive_gateway::AgentClient;
use hive_store::{AgentRecord, StateStore};
use hive_types::{
    labels, AgentConfig, AgentName, AgentStatus, ApiKeyMode, HiveError, HiveResult, RuntimeKind,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

mod template;

pub use template::TemplateSpec;

/// Static service configuration for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Template catalog; `create` rejects names outside it.
    pub templates: HashMap<String, TemplateSpec>,
    /// Platform LLM API key injected into platform-mode sandboxes.
    pub platform_api_key: Option<String>,
    /// System-wide prompt pushed into each sandbox after start.
    pub system_prompt: String,
    /// Keep activity/execution history on delete.
    pub compliance_retention: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            templates: TemplateSpec::builtin_catalog(),
            platform_api_key: None,
            system_prompt: String::new(),
            compliance_retention: false,
        }
    }
}

/// Request shape for `create`.
#[derive(Debug, Clone)]
pub struct CreateAgent {
    /// Raw, unsanitized name.
    pub name: String,
    /// Owning user.
    pub owner_id: Uuid,
    /// Template to create from.
    pub template: String,
    /// Declared configuration; template shared-folder intent is merged in.
    pub config: AgentConfig,
    /// Initial outgoing permission edges. Restrictive by default: empty.
    pub edges: Vec<AgentName>,
    /// Start the container immediately after creation.
    pub auto_start: bool,
}

/// Outcome of startup reconciliation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Containers discovered without a state-store row, now admin-visible.
    pub orphans: Vec<AgentName>,
    /// Rows whose container is gone, now marked stopped.
    pub stopped: Vec<AgentName>,
}

/// The lifecycle manager.
#[derive(Clone)]
pub struct LifecycleManager {
    driver: Arc<dyn ContainerDriver>,
    store: StateStore,
    coord: Arc<dyn CoordStore>,
    client: Arc<dyn AgentClient>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    /// Assemble the manager from its collaborators.
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        store: StateStore,
        coord: Arc<dyn CoordStore>,
        client: Arc<dyn AgentClient>,
        config: LifecycleConfig,
    ) -> Self {
        Self { driver, store, coord, client, config }
    }

    /// Create an agent: state-store row, restrictive permission edges,
    /// agent-scoped API key, credential blob, and optionally a running
    /// container.
    #[instrument(skip(self, request), fields(agent = %request.name))]
    pub async fn create(&self, request: CreateAgent) -> HiveResult<AgentRecord> {
        let name = AgentName::sanitize(&request.name)?;
        let template = self
            .config
            .templates
            .get(&request.template)
            .ok_or_else(|| {
                HiveError::Validation(format!("unknown template {:?}", request.template))
            })?
            .clone();

        // Shared-folder intent comes from the template BEFORE any container
        // exists, so first-start volume mounts reflect it.
        let mut config = request.config.clone();
        config.share_expose |= template.share_expose;
        config.share_consume |= template.share_consume;

        let record = self
            .store
            .create_agent(
                &name,
                request.owner_id,
                &request.template,
                template.runtime,
                false,
                &config,
                &request.edges,
            )
            .await?;

        // The agent-scoped key exists in clear exactly once; it rides into
        // the sandbox environment through the credential blob.
        let key = hive_auth::issue_agent_key(&self.store, &name).await?;
        let blob = serde_json::to_vec(&serde_json::json!({ "agent_api_key": key.clear }))?;
        self.coord.put_blob(&creds_key(name.as_str()), &blob).await?;

        info!(agent = %name, template = %request.template, "agent created");
        if request.auto_start {
            self.start(&name).await?;
            return self.store.agent_required(&name).await;
        }
        Ok(record)
    }

    /// Start an agent, reconciling its container against declared
    /// configuration first. Starting an already-running, in-sync agent is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &AgentName) -> HiveResult<()> {
        let record = self.store.agent_required(name).await?;
        let desired = self.desired_spec(&record).await?;

        match self.driver.inspect(name.as_str()).await {
            Ok(actual) => {
                if needs_recreate(&desired, &actual) {
                    info!(agent = %name, "declared config diverged; recreating container");
                    self.recreate_container(name, &desired).await?;
                } else if actual.status == ContainerStatus::Running {
                    // In sync and already up.
                    self.store.set_agent_status(name, AgentStatus::Running).await?;
                    return Ok(());
                }
            }
            Err(ContainerError::NotFound(_)) => {
                self.driver.create(&desired).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.driver.start(name.as_str()).await?;
        self.store.set_agent_status(name, AgentStatus::Running).await?;
        self.inject_context(name).await;
        info!(agent = %name, "agent started");
        Ok(())
    }

    /// Stop an agent. Idempotent, including when the container is gone.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &AgentName) -> HiveResult<()> {
        self.store.agent_required(name).await?;
        match self.driver.stop(name.as_str()).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.set_agent_status(name, AgentStatus::Stopped).await?;
        Ok(())
    }

    /// Delete an agent: container, schedules, edges, ownership, sharing,
    /// history (unless compliance retention), and credential blobs. The
    /// designated system agent cannot be deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &AgentName) -> HiveResult<()> {
        let record = self.store.agent_required(name).await?;
        if record.is_system {
            return Err(HiveError::PermissionDenied {
                caller: "api".to_string(),
                target: format!("system agent {name}"),
            });
        }

        match self.driver.stop(name.as_str()).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.driver.remove(name.as_str()).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.store.delete_agent(name, self.config.compliance_retention).await?;
        self.coord.del(&creds_key(name.as_str())).await?;
        info!(agent = %name, "agent deleted");
        Ok(())
    }

    /// Force a container rebuild from declared configuration.
    #[instrument(skip(self))]
    pub async fn recreate(&self, name: &AgentName) -> HiveResult<()> {
        let record = self.store.agent_required(name).await?;
        let desired = self.desired_spec(&record).await?;
        self.recreate_container(name, &desired).await?;
        self.driver.start(name.as_str()).await?;
        self.store.set_agent_status(name, AgentStatus::Running).await?;
        self.inject_context(name).await;
        Ok(())
    }

    /// Startup reconciliation: discover containers by label, mark rows
    /// without containers stopped and containers without rows as orphans.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> HiveResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let containers = self.driver.list_by_label(labels::NAME).await?;
        let mut seen = Vec::new();
        for container in &containers {
            let Some(label_name) = container.labels.get(labels::NAME) else { continue };
            let name = AgentName::parse(label_name)?;
            seen.push(name.clone());
            if self.store.agent_by_name(&name).await?.is_none() {
                let owner = container
                    .labels
                    .get(labels::OWNER)
                    .and_then(|o| Uuid::parse_str(o).ok())
                    .unwrap_or(Uuid::nil());
                let kind = container
                    .labels
                    .get(labels::KIND)
                    .and_then(|k| RuntimeKind::parse(k).ok())
                    .unwrap_or_default();
                warn!(agent = %name, "container without state row; marking orphan");
                self.store.insert_orphan(&name, owner, kind).await?;
                report.orphans.push(name);
            }
        }

        for record in self.store.list_agents(false).await? {
            if !seen.contains(&record.name) && record.status == AgentStatus::Running {
                warn!(agent = %record.name, "state row without container; marking stopped");
                self.store.set_agent_status(&record.name, AgentStatus::Stopped).await?;
                report.stopped.push(record.name);
            }
        }
        Ok(report)
    }

    /// Container logs passthrough.
    pub async fn logs(&self, name: &AgentName, tail: usize) -> HiveResult<Vec<String>> {
        self.store.agent_required(name).await?;
        Ok(self.driver.logs(name.as_str(), tail).await?)
    }

    /// Container stats passthrough.
    pub async fn stats(&self, name: &AgentName) -> HiveResult<ContainerStats> {
        self.store.agent_required(name).await?;
        Ok(self.driver.stats(name.as_str()).await?)
    }

    //─────────────────────────────
    //  Internals
    //─────────────────────────────

    async fn recreate_container(&self, name: &AgentName, desired: &ContainerSpec) -> HiveResult<()> {
        match self.driver.stop(name.as_str()).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.driver.remove(name.as_str()).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.driver.create(desired).await?;
        Ok(())
    }

    /// The container spec implied by the declared configuration. Labels are
    /// the authoritative identity and carry every reconciled field.
    async fn desired_spec(&self, record: &AgentRecord) -> HiveResult<ContainerSpec> {
        let template = self
            .config
            .templates
            .get(&record.template)
            .cloned()
            .unwrap_or_default();

        let mut container_labels = HashMap::from([
            (labels::NAME.to_string(), record.name.to_string()),
            (labels::OWNER.to_string(), record.owner_id.to_string()),
            (labels::KIND.to_string(), record.kind.as_str().to_string()),
            (labels::CPU.to_string(), format_cpus(record.config.resources.cpus)),
            (labels::MEMORY.to_string(), record.config.resources.memory_mb.to_string()),
            (
                labels::API_KEY_MODE.to_string(),
                record.config.api_key_mode.as_str().to_string(),
            ),
            (
                labels::CAPABILITY_PROFILE.to_string(),
                record.config.capability_profile.as_str().to_string(),
            ),
        ]);
        container_labels.extend(template.extra_labels.clone());

        let mut env = vec![
            format!("HIVE_AGENT_NAME={}", record.name),
            format!("HIVE_API_KEY_MODE={}", record.config.api_key_mode.as_str()),
        ];
        if let Some(model) = &record.config.model {
            env.push(format!("HIVE_MODEL={model}"));
        }
        if record.config.read_only {
            env.push("HIVE_READ_ONLY=1".to_string());
        }
        if record.config.api_key_mode == ApiKeyMode::Platform {
            if let Some(key) = &self.config.platform_api_key {
                env.push(format!("HIVE_LLM_API_KEY={key}"));
            }
        }
        if let Some(blob) = self.coord.get_blob(&creds_key(record.name.as_str())).await? {
            if let Ok(creds) = serde_json::from_slice::<serde_json::Value>(&blob) {
                if let Some(key) = creds.get("agent_api_key").and_then(|k| k.as_str()) {
                    env.push(format!("HIVE_AGENT_KEY={key}"));
                }
            }
        }

        // The workspace volume survives every recreate.
        let mut mounts = vec![MountSpec {
            source: format!("hive-ws-{}", record.name),
            target: "/workspace".to_string(),
            read_only: false,
        }];
        if record.config.share_expose {
            mounts.push(MountSpec {
                source: format!("hive-share-{}", record.name),
                target: "/share".to_string(),
                read_only: false,
            });
        }
        if record.config.share_consume {
            mounts.push(MountSpec {
                source: "hive-share".to_string(),
                target: "/shared".to_string(),
                read_only: true,
            });
        }

        Ok(ContainerSpec {
            name: record.name.to_string(),
            image: template.image,
            env,
            mounts,
            labels: container_labels,
            capability_profile: record.config.capability_profile,
            resources: record.config.resources,
        })
    }

    /// Push control-plane context into the sandbox. Each injection is a
    /// discrete call; failures are logged and do not roll back the start.
    async fn inject_context(&self, name: &AgentName) {
        if let Ok(Some(blob)) = self.coord.get_blob(&creds_key(name.as_str())).await {
            if let Err(e) = self.client.inject_credentials(name, &blob).await {
                warn!(agent = %name, "credential injection failed: {e}");
            }
        }
        if let Err(e) = self.client.inject_skills(name, &serde_json::json!([])).await {
            warn!(agent = %name, "skill injection failed: {e}");
        }
        if !self.config.system_prompt.is_empty() {
            if let Err(e) = self.client.inject_system_prompt(name, &self.config.system_prompt).await
            {
                warn!(agent = %name, "system prompt injection failed: {e}");
            }
        }
    }
}

fn format_cpus(cpus: f64) -> String {
    format!("{cpus:.2}")
}

/// Whether the running container diverges from the declared spec on any
/// tracked field: labels (owner/kind identity, cpu, memory, api-key mode,
/// capability preset), the api-key-relevant env subset, or the mount set.
fn needs_recreate(desired: &ContainerSpec, actual: &ContainerInspect) -> bool {
    for key in [
        labels::OWNER,
        labels::KIND,
        labels::CPU,
        labels::MEMORY,
        labels::API_KEY_MODE,
        labels::CAPABILITY_PROFILE,
    ] {
        if desired.labels.get(key) != actual.labels.get(key) {
            return true;
        }
    }

    let env_subset = |env: &[String]| {
        let mut subset: Vec<&String> = env
            .iter()
            .filter(|e| {
                e.starts_with("HIVE_API_KEY_MODE=")
                    || e.starts_with("HIVE_LLM_API_KEY=")
                    || e.starts_with("HIVE_MODEL=")
                    || e.starts_with("HIVE_READ_ONLY=")
            })
            .collect();
        subset.sort();
        subset.into_iter().cloned().collect::<Vec<_>>()
    };
    if env_subset(&desired.env) != env_subset(&actual.env) {
        return true;
    }

    let mount_set = |mounts: &[MountSpec]| {
        let mut set = mounts.to_vec();
        set.sort();
        set
    };
    mount_set(&desired.mounts) != mount_set(&actual.mounts)
}

#[cfg(test)]
mod tests;
