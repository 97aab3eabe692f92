//! HTTP client for the agent sandbox surface.
//!
//! The control plane speaks to each sandbox over plain HTTP: `/chat` for
//! conversation-carrying work, `/task` for stateless work, and the process
//! registry's terminate/running endpoints. Caller identity travels in the
//! `X-Source-Agent` header; the sandbox uses it to stamp execution rows.

use std::time::Duration;

use async_trait::async_trait;
use hive_types::{
    AgentName, CallOverrides, CallerIdentity, HiveError, HiveResult, TranscriptEntry,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header naming the calling agent on inter-agent dispatches.
pub const SOURCE_AGENT_HEADER: &str = "X-Source-Agent";

/// Default operation timeout for a single sandbox call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Body sent to `/chat` and `/task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCallBody {
    /// Durable execution id, used by the sandbox's process registry.
    pub execution_id: i64,
    /// The message to run.
    pub message: String,
    /// Per-call overrides.
    #[serde(default)]
    pub overrides: CallOverrides,
}

/// Structured response from `/chat` and `/task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Final text outcome.
    pub result: String,
    /// Structured transcript of the run.
    pub transcript: Vec<TranscriptEntry>,
    /// Cost in USD.
    pub cost_usd: f64,
    /// Tokens consumed.
    pub tokens: u64,
}

/// Outcome reported by the sandbox terminate endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateOutcome {
    /// Whether a process was found and signalled.
    pub terminated: bool,
    /// `SIGINT` when the process yielded gracefully, `SIGKILL` otherwise.
    pub signal: String,
}

/// One entry of the sandbox's running-process list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningProcess {
    /// Durable execution id.
    pub execution_id: i64,
    /// Start time, RFC 3339.
    pub started_at: String,
    /// Command line being run.
    pub command: String,
}

/// Client over the sandbox HTTP surface.
///
/// The trait seam lets the gateway, lifecycle manager, and scheduler run
/// against a table-backed fake in tests.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Sequential chat on the agent. Blocks until the sandbox responds.
    async fn chat(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        timeout: Duration,
    ) -> HiveResult<AgentResponse>;

    /// Stateless task on the agent.
    async fn task(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        timeout: Duration,
    ) -> HiveResult<AgentResponse>;

    /// Terminate a running execution inside the sandbox.
    async fn terminate(&self, agent: &AgentName, execution_id: i64)
        -> HiveResult<TerminateOutcome>;

    /// Running executions inside the sandbox.
    async fn running(&self, agent: &AgentName) -> HiveResult<Vec<RunningProcess>>;

    /// Push a credential blob into the sandbox.
    async fn inject_credentials(&self, agent: &AgentName, blob: &[u8]) -> HiveResult<()>;

    /// Push the skill set into the sandbox.
    async fn inject_skills(&self, agent: &AgentName, skills: &serde_json::Value) -> HiveResult<()>;

    /// Push the system-wide prompt into the sandbox.
    async fn inject_system_prompt(&self, agent: &AgentName, prompt: &str) -> HiveResult<()>;
}

/// reqwest-backed [`AgentClient`].
///
/// Sandbox addresses derive from the container name: `{scheme}{agent}{port}`,
/// e.g. `http://writer:8700`.
pub struct HttpAgentClient {
    http: reqwest::Client,
    port: u16,
}

impl HttpAgentClient {
    /// Build a client targeting sandboxes on `port`.
    pub fn new(port: u16) -> HiveResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| HiveError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, port })
    }

    fn base(&self, agent: &AgentName) -> String {
        format!("http://{}:{}", agent, self.port)
    }

    async fn call(
        &self,
        agent: &AgentName,
        path: &str,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        timeout: Duration,
    ) -> HiveResult<AgentResponse> {
        let url = format!("{}{path}", self.base(agent));
        debug!(agent = %agent, %url, execution_id = body.execution_id, "dispatching to sandbox");
        let mut request = self.http.post(&url).timeout(timeout).json(body);
        if let Some(source) = source {
            request = request.header(SOURCE_AGENT_HEADER, source.as_str());
        }
        let response = request.send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(map_reqwest)
    }
}

fn map_reqwest(err: reqwest::Error) -> HiveError {
    if err.is_timeout() {
        HiveError::DependencyUnavailable(format!("sandbox call timed out: {err}"))
    } else {
        HiveError::DependencyUnavailable(format!("sandbox call failed: {err}"))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn chat(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        timeout: Duration,
    ) -> HiveResult<AgentResponse> {
        self.call(agent, "/chat", body, source, timeout).await
    }

    async fn task(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        timeout: Duration,
    ) -> HiveResult<AgentResponse> {
        self.call(agent, "/task", body, source, timeout).await
    }

    async fn terminate(
        &self,
        agent: &AgentName,
        execution_id: i64,
    ) -> HiveResult<TerminateOutcome> {
        let url = format!("{}/executions/{execution_id}/terminate", self.base(agent));
        let response = self.http.post(&url).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} terminate returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(map_reqwest)
    }

    async fn running(&self, agent: &AgentName) -> HiveResult<Vec<RunningProcess>> {
        let url = format!("{}/executions/running", self.base(agent));
        let response = self.http.get(&url).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} running-list returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(map_reqwest)
    }

    async fn inject_credentials(&self, agent: &AgentName, blob: &[u8]) -> HiveResult<()> {
        let url = format!("{}/context/credentials", self.base(agent));
        let response = self
            .http
            .post(&url)
            .body(blob.to_vec())
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} credential injection returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn inject_skills(&self, agent: &AgentName, skills: &serde_json::Value) -> HiveResult<()> {
        let url = format!("{}/context/skills", self.base(agent));
        let response = self.http.post(&url).json(skills).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} skill injection returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn inject_system_prompt(&self, agent: &AgentName, prompt: &str) -> HiveResult<()> {
        let url = format!("{}/context/system-prompt", self.base(agent));
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(HiveError::DependencyUnavailable(format!(
                "sandbox {agent} prompt injection returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Test double
//─────────────────────────────

/// Scripted [`AgentClient`] used across the workspace's tests.
#[derive(Default)]
pub struct FakeAgentClient {
    /// Calls seen so far, as `(agent, path, source)` triples.
    pub calls: std::sync::Mutex<Vec<(String, String, Option<String>)>>,
    /// Terminate requests seen so far.
    pub terminated: std::sync::Mutex<Vec<(String, i64)>>,
    /// When set, chat/task calls fail with `dependency_unavailable`.
    pub fail_calls: std::sync::atomic::AtomicBool,
    /// Artificial latency applied to chat/task calls.
    pub latency: std::sync::Mutex<Duration>,
}

impl FakeAgentClient {
    /// A client that answers instantly and successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent chat/task calls fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_calls.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Delay chat/task responses by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn canned_response(message: &str) -> AgentResponse {
        AgentResponse {
            result: format!("done: {message}"),
            transcript: vec![
                TranscriptEntry::Init { model: "test-model".into(), tools: vec!["bash".into()] },
                TranscriptEntry::AssistantText { text: format!("done: {message}") },
                TranscriptEntry::Result {
                    outcome: format!("done: {message}"),
                    cost_usd: 0.01,
                    duration_ms: 5,
                    tokens: 42,
                },
            ],
            cost_usd: 0.01,
            tokens: 42,
        }
    }

    async fn record_call(
        &self,
        agent: &AgentName,
        path: &str,
        body: &AgentCallBody,
        source: Option<&AgentName>,
    ) -> HiveResult<AgentResponse> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().unwrap().push((
            agent.to_string(),
            path.to_string(),
            source.map(|s| s.to_string()),
        ));
        if self.fail_calls.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(HiveError::DependencyUnavailable("sandbox unreachable".into()));
        }
        Ok(Self::canned_response(&body.message))
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn chat(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        _timeout: Duration,
    ) -> HiveResult<AgentResponse> {
        self.record_call(agent, "/chat", body, source).await
    }

    async fn task(
        &self,
        agent: &AgentName,
        body: &AgentCallBody,
        source: Option<&AgentName>,
        _timeout: Duration,
    ) -> HiveResult<AgentResponse> {
        self.record_call(agent, "/task", body, source).await
    }

    async fn terminate(
        &self,
        agent: &AgentName,
        execution_id: i64,
    ) -> HiveResult<TerminateOutcome> {
        self.terminated.lock().unwrap().push((agent.to_string(), execution_id));
        Ok(TerminateOutcome { terminated: true, signal: "SIGINT".into() })
    }

    async fn running(&self, _agent: &AgentName) -> HiveResult<Vec<RunningProcess>> {
        Ok(Vec::new())
    }

    async fn inject_credentials(&self, _agent: &AgentName, _blob: &[u8]) -> HiveResult<()> {
        Ok(())
    }

    async fn inject_skills(
        &self,
        _agent: &AgentName,
        _skills: &serde_json::Value,
    ) -> HiveResult<()> {
        Ok(())
    }

    async fn inject_system_prompt(&self, _agent: &AgentName, _prompt: &str) -> HiveResult<()> {
        Ok(())
    }
}

/// Identity of the caller as carried on internal dispatches.
pub fn source_of(caller: &CallerIdentity) -> Option<&AgentName> {
    caller.source_agent()
}
