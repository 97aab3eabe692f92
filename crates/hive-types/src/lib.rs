#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-types** – Shared primitive data structures for the hive control plane.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines caller identity, the execution/activity vocabulary, container
//! label constants, and the workspace error taxonomy. It makes no assumptions
//! about I/O, storage engines, or HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod labels;

pub use error::{HiveError, HiveResult};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum length of an agent name after sanitization.
pub const MAX_AGENT_NAME_LEN: usize = 63;

/// Maximum allowed size for a task or chat message dispatched to an agent.
pub const MAX_MESSAGE_LEN: usize = 65_536;

/// Default upper bound on a single sequential execution (queue slot TTL).
pub const DEFAULT_QUEUE_TTL_SECS: u64 = 15 * 60;

//─────────────────────────────
//  Agent naming
//─────────────────────────────

/// Sanitized, globally unique agent name.
///
/// Names are externally supplied and sanitized on construction: lowercased,
/// non `[a-z0-9-]` characters mapped to `-`, runs of `-` collapsed, leading
/// and trailing `-` stripped. Global uniqueness is enforced by the state
/// store; this type only guarantees a well-formed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    /// Sanitize an externally supplied name.
    pub fn sanitize(raw: &str) -> HiveResult<Self> {
        let mut out = String::with_capacity(raw.len());
        let mut prev_dash = true; // strips leading dashes
        for ch in raw.trim().chars() {
            let mapped = match ch.to_ascii_lowercase() {
                c @ ('a'..='z' | '0'..='9') => c,
                _ => '-',
            };
            if mapped == '-' {
                if prev_dash {
                    continue;
                }
                prev_dash = true;
            } else {
                prev_dash = false;
            }
            out.push(mapped);
        }
        while out.ends_with('-') {
            out.pop();
        }
        if out.is_empty() {
            return Err(HiveError::Validation(format!(
                "agent name {raw:?} is empty after sanitization"
            )));
        }
        if out.len() > MAX_AGENT_NAME_LEN {
            return Err(HiveError::Validation(format!(
                "agent name too long: {} > {}",
                out.len(),
                MAX_AGENT_NAME_LEN
            )));
        }
        Ok(Self(out))
    }

    /// Accept a value that is already in sanitized form.
    ///
    /// Used when reading names back from the state store or from container
    /// labels, where the sanitized invariant already holds.
    pub fn parse(value: &str) -> HiveResult<Self> {
        let sanitized = Self::sanitize(value)?;
        if sanitized.0 != value {
            return Err(HiveError::Validation(format!(
                "agent name {value:?} is not in sanitized form"
            )));
        }
        Ok(sanitized)
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

//─────────────────────────────
//  Caller identity
//─────────────────────────────

/// Identity of a caller, resolved by authentication before any core
/// component sees the request.
///
/// Permission checks dispatch on this sum exhaustively; there is no
/// stringly-typed scope anywhere in the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CallerIdentity {
    /// A human caller holding a user-scoped API key or session.
    User {
        /// User identifier.
        id: Uuid,
        /// Whether the user holds the admin flag.
        admin: bool,
    },
    /// Another agent, calling through the inter-agent gateway.
    Agent {
        /// The calling agent's name.
        name: AgentName,
    },
    /// The designated system agent. Permission checks are bypassed.
    System,
}

impl CallerIdentity {
    /// The trigger kind an execution initiated by this caller is stamped with.
    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            CallerIdentity::User { .. } => TriggerKind::User,
            CallerIdentity::Agent { .. } => TriggerKind::Agent,
            CallerIdentity::System => TriggerKind::System,
        }
    }

    /// The source agent to stamp on an execution row, if any.
    pub fn source_agent(&self) -> Option<&AgentName> {
        match self {
            CallerIdentity::Agent { name } => Some(name),
            _ => None,
        }
    }

    /// Short human-readable holder label used in busy envelopes and logs.
    pub fn holder_label(&self) -> String {
        match self {
            CallerIdentity::User { id, .. } => format!("user:{id}"),
            CallerIdentity::Agent { name } => format!("agent:{name}"),
            CallerIdentity::System => "system".to_string(),
        }
    }
}

/// The identity kind that initiated an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A human user.
    User,
    /// The scheduler firing a cron schedule.
    Schedule,
    /// Another agent through the gateway.
    Agent,
    /// The designated system agent.
    System,
}

impl TriggerKind {
    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::User => "user",
            TriggerKind::Schedule => "schedule",
            TriggerKind::Agent => "agent",
            TriggerKind::System => "system",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "user" => Ok(TriggerKind::User),
            "schedule" => Ok(TriggerKind::Schedule),
            "agent" => Ok(TriggerKind::Agent),
            "system" => Ok(TriggerKind::System),
            other => Err(HiveError::Internal(format!("unknown trigger kind {other:?}"))),
        }
    }
}

//─────────────────────────────
//  Agent configuration
//─────────────────────────────

/// Container capability preset.
///
/// Every container creation path routes through one of these two presets;
/// ad-hoc capability lists are forbidden by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityProfile {
    /// Drop-all plus `NET_BIND_SERVICE`; default AppArmor; noexec/nosuid tmpfs.
    #[default]
    Restricted,
    /// Restricted plus the capabilities apt-like workflows and interactive
    /// SSH need: SETGID, SETUID, CHOWN, SYS_CHROOT, AUDIT_WRITE.
    Full,
}

impl CapabilityProfile {
    /// Stable string form used in labels and the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityProfile::Restricted => "restricted",
            CapabilityProfile::Full => "full",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "restricted" => Ok(CapabilityProfile::Restricted),
            "full" => Ok(CapabilityProfile::Full),
            other => Err(HiveError::Validation(format!(
                "unknown capability profile {other:?}"
            ))),
        }
    }
}

/// Where the agent's LLM API key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyMode {
    /// The platform injects its own key into the sandbox.
    #[default]
    Platform,
    /// The caller supplies a key per request.
    Caller,
}

impl ApiKeyMode {
    /// Stable string form used in labels and the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyMode::Platform => "platform",
            ApiKeyMode::Caller => "caller",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "platform" => Ok(ApiKeyMode::Platform),
            "caller" => Ok(ApiKeyMode::Caller),
            other => Err(HiveError::Validation(format!("unknown api key mode {other:?}"))),
        }
    }
}

/// The runtime the container hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Sandboxed LLM runtime exposing `/task` and `/chat`.
    #[default]
    SandboxedLlm,
    /// Plain shell runtime.
    Shell,
}

impl RuntimeKind {
    /// Stable string form used in labels and the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::SandboxedLlm => "sandboxed-llm",
            RuntimeKind::Shell => "shell",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "sandboxed-llm" => Ok(RuntimeKind::SandboxedLlm),
            "shell" => Ok(RuntimeKind::Shell),
            other => Err(HiveError::Validation(format!("unknown runtime kind {other:?}"))),
        }
    }
}

/// Declared container resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU quota in whole or fractional cores.
    pub cpus: f64,
    /// Memory limit in mebibytes.
    pub memory_mb: u64,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self { cpus: 1.0, memory_mb: 2048 }
    }
}

/// The declared configuration of an agent, reconciled against the running
/// container on every start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Resource limits.
    pub resources: ResourceSpec,
    /// Capability preset for the container.
    pub capability_profile: CapabilityProfile,
    /// API-key mode.
    pub api_key_mode: ApiKeyMode,
    /// Runtime kind.
    pub runtime: RuntimeKind,
    /// Model override passed to the sandbox, if any.
    pub model: Option<String>,
    /// Whether the agent's tooling is restricted to read-only operations.
    pub read_only: bool,
    /// Aggregate gate for the agent's schedules.
    pub autonomy_enabled: bool,
    /// Whether the agent exposes its shared folder to others.
    pub share_expose: bool,
    /// Whether the agent mounts shared folders exposed by others.
    pub share_consume: bool,
    /// Free-form tags.
    pub tags: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resources: ResourceSpec::default(),
            capability_profile: CapabilityProfile::Restricted,
            api_key_mode: ApiKeyMode::Platform,
            runtime: RuntimeKind::SandboxedLlm,
            model: None,
            read_only: false,
            autonomy_enabled: true,
            share_expose: false,
            share_consume: false,
            tags: Vec::new(),
        }
    }
}

/// Steady lifecycle states of an agent, as recorded in the state store.
///
/// `recreating` is internal to start and never observable as a steady state;
/// `absent` and `gone` are the lack of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Row exists, container created but never started (or stopped before
    /// first start).
    Created,
    /// Container running.
    Running,
    /// Container stopped.
    Stopped,
}

impl AgentStatus {
    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Created => "created",
            AgentStatus::Running => "running",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "created" => Ok(AgentStatus::Created),
            "running" => Ok(AgentStatus::Running),
            "stopped" => Ok(AgentStatus::Stopped),
            other => Err(HiveError::Internal(format!("unknown agent status {other:?}"))),
        }
    }
}

//─────────────────────────────
//  Execution vocabulary
//─────────────────────────────

/// Durable execution status. Progresses monotonically
/// queued → running → one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Row created, work not yet dispatched.
    Queued,
    /// Dispatched to the sandbox.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Terminated by operator request.
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the transition `self → next` respects the monotonic order.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Queued, ExecutionStatus::Running) => true,
            (ExecutionStatus::Queued, s) | (ExecutionStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }

    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(HiveError::Internal(format!("unknown execution status {other:?}"))),
        }
    }
}

/// How a call enters an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Conversation-carrying chat; serialized through the queue slot.
    Sequential,
    /// Stateless task; bypasses the slot, caller waits for the result.
    Parallel,
    /// Stateless task; fire-and-forget, caller polls the execution row.
    ParallelAsync,
}

/// Per-call overrides accepted by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOverrides {
    /// Model override for this call only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Restrict the sandbox to this tool allowlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_allowlist: Option<Vec<String>>,
    /// Text appended to the sandbox system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    /// Operation timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// One entry of an execution transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// Sandbox session initialization.
    Init {
        /// Model the sandbox selected.
        model: String,
        /// Tools available to the session.
        tools: Vec<String>,
    },
    /// Assistant-produced text.
    AssistantText {
        /// The text content.
        text: String,
    },
    /// A tool invocation.
    ToolCall {
        /// Tool name.
        tool: String,
        /// Serialized tool input.
        input: serde_json::Value,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Serialized tool output.
        output: serde_json::Value,
        /// Whether the tool reported an error.
        is_error: bool,
    },
    /// Final result entry sealing the transcript.
    Result {
        /// Final text outcome.
        outcome: String,
        /// Cost in USD.
        cost_usd: f64,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Total tokens consumed.
        tokens: u64,
    },
}

//─────────────────────────────
//  Activity vocabulary
//─────────────────────────────

/// Granular activity kinds attached to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// A sequential chat began.
    ChatStart,
    /// A sequential chat ended.
    ChatEnd,
    /// The sandbox invoked a tool.
    ToolCall,
    /// A scheduled fire began.
    ScheduleStart,
    /// A scheduled fire ended.
    ScheduleEnd,
    /// An inter-agent call passed through the gateway.
    AgentCollaboration,
    /// An execution was terminated by operator request.
    ExecutionCancelled,
}

impl ActivityType {
    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ChatStart => "chat_start",
            ActivityType::ChatEnd => "chat_end",
            ActivityType::ToolCall => "tool_call",
            ActivityType::ScheduleStart => "schedule_start",
            ActivityType::ScheduleEnd => "schedule_end",
            ActivityType::AgentCollaboration => "agent_collaboration",
            ActivityType::ExecutionCancelled => "execution_cancelled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "chat_start" => Ok(ActivityType::ChatStart),
            "chat_end" => Ok(ActivityType::ChatEnd),
            "tool_call" => Ok(ActivityType::ToolCall),
            "schedule_start" => Ok(ActivityType::ScheduleStart),
            "schedule_end" => Ok(ActivityType::ScheduleEnd),
            "agent_collaboration" => Ok(ActivityType::AgentCollaboration),
            "execution_cancelled" => Ok(ActivityType::ExecutionCancelled),
            other => Err(HiveError::Internal(format!("unknown activity type {other:?}"))),
        }
    }
}

/// Lifecycle state of an activity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// In progress.
    Started,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ActivityState {
    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Started => "started",
            ActivityState::Completed => "completed",
            ActivityState::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> HiveResult<Self> {
        match value {
            "started" => Ok(ActivityState::Started),
            "completed" => Ok(ActivityState::Completed),
            "failed" => Ok(ActivityState::Failed),
            other => Err(HiveError::Internal(format!("unknown activity state {other:?}"))),
        }
    }
}

/// Typed details blob carried by an activity, tagged by kind.
///
/// Persisted as tagged JSON at the storage boundary; the core never handles
/// untyped maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityDetails {
    /// Details for `chat_start`.
    ChatStart {
        /// Truncated preview of the inbound message.
        message_preview: String,
    },
    /// Details for `chat_end`.
    ChatEnd {
        /// Cost in USD.
        cost_usd: f64,
        /// Tokens consumed.
        tokens: u64,
    },
    /// Details for `tool_call`.
    ToolCall {
        /// Tool name.
        tool: String,
        /// Compressed argument summary.
        summary: String,
    },
    /// Details for `schedule_start`.
    ScheduleStart {
        /// Schedule row id.
        schedule_id: i64,
        /// The cron expression that fired.
        cron: String,
    },
    /// Details for `schedule_end`.
    ScheduleEnd {
        /// Schedule row id.
        schedule_id: i64,
        /// Terminal status of the produced execution.
        status: ExecutionStatus,
    },
    /// Details for `agent_collaboration`.
    AgentCollaboration {
        /// Calling agent.
        source: AgentName,
        /// Target agent.
        target: AgentName,
        /// Dispatch mode.
        mode: ExecutionMode,
    },
    /// Details for `execution_cancelled`.
    ExecutionCancelled {
        /// Operator-supplied reason, if any.
        reason: Option<String>,
    },
    /// Audit entry for a denied inter-agent call.
    PermissionDenied {
        /// Calling agent.
        source: AgentName,
        /// Target agent the edge was missing for.
        target: AgentName,
    },
}

//─────────────────────────────
//  Queue slot
//─────────────────────────────

/// Value stored in the per-agent queue cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSlot {
    /// Volatile execution id, distinct from the durable row id.
    pub volatile_id: Uuid,
    /// Holder identity.
    pub holder: CallerIdentity,
    /// Acquisition timestamp.
    pub acquired_at: DateTime<Utc>,
    /// Expected upper bound on the execution, seconds.
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_maps_to_lowercase_hyphenated() {
        let name = AgentName::sanitize("  My Fancy_Agent!! ").unwrap();
        assert_eq!(name.as_str(), "my-fancy-agent");
    }

    #[test]
    fn sanitize_collapses_and_trims_dashes() {
        let name = AgentName::sanitize("--a---b--").unwrap();
        assert_eq!(name.as_str(), "a-b");
    }

    #[test]
    fn sanitize_rejects_empty() {
        assert!(AgentName::sanitize("!!!").is_err());
        assert!(AgentName::sanitize("").is_err());
    }

    #[test]
    fn parse_rejects_unsanitized() {
        assert!(AgentName::parse("Upper").is_err());
        assert!(AgentName::parse("ok-name").is_ok());
    }

    #[test]
    fn status_progression_is_monotonic() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn caller_identity_stamps_trigger() {
        let agent = CallerIdentity::Agent { name: AgentName::sanitize("worker").unwrap() };
        assert_eq!(agent.trigger_kind(), TriggerKind::Agent);
        assert_eq!(agent.source_agent().unwrap().as_str(), "worker");
        assert_eq!(CallerIdentity::System.trigger_kind(), TriggerKind::System);
        assert!(CallerIdentity::System.source_agent().is_none());
    }

    #[test]
    fn activity_details_tagged_by_kind() {
        let details = ActivityDetails::ToolCall {
            tool: "bash".to_string(),
            summary: "ls /".to_string(),
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "tool_call");
        assert_eq!(json["tool"], "bash");
    }
}
