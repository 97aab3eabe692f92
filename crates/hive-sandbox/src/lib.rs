#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-sandbox** – In-sandbox process registry for hive agents.
//!
//! This crate is linked into the agent runtime, not the control plane. It
//! maps durable execution ids to the OS sub-processes running inside the
//! sandbox and exposes the two endpoints the control plane consumes:
//! terminate (SIGINT, then SIGKILL after the grace period) and the
//! running-process list.
//!
//! When an execution is terminated by operator request the registry emits a
//! completion callback to the control plane, so the queue slot is released
//! and the execution row sealed even if the control-plane-side handler died
//! mid-flight. Both sides are conditional, so the duplicate is harmless.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long SIGINT gets before SIGKILL follows.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Outcome reported by the terminate endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateOutcome {
    /// Whether a process was found and signalled.
    pub terminated: bool,
    /// `SIGINT` when the process yielded within the grace period,
    /// `SIGKILL` otherwise.
    pub signal: String,
}

/// One entry of the running-process list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningProcess {
    /// Durable execution id.
    pub execution_id: i64,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Command line being run.
    pub command: String,
}

struct ProcessHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
    started_at: DateTime<Utc>,
    command: String,
}

/// Reports terminate-driven completions back to the control plane.
#[derive(Clone)]
pub struct CompletionReporter {
    http: reqwest::Client,
    base_url: String,
    agent_key: String,
}

impl CompletionReporter {
    /// Build a reporter against the control plane at `base_url`,
    /// authenticating with the agent-scoped key.
    pub fn new(base_url: String, agent_key: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, agent_key }
    }

    async fn report_cancelled(&self, execution_id: i64) {
        let url = format!("{}/internal/executions/{execution_id}/complete", self.base_url);
        let body = serde_json::json!({ "status": "cancelled" });
        let sent = self
            .http
            .post(&url)
            .bearer_auth(&self.agent_key)
            .json(&body)
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(execution_id, status = %response.status(), "completion callback rejected")
            }
            Err(e) => warn!(execution_id, "completion callback failed: {e}"),
        }
    }
}

/// Registry of sub-processes keyed by execution id. Not durable across
/// sandbox restarts.
pub struct ProcessRegistry {
    processes: DashMap<i64, Arc<ProcessHandle>>,
    grace: Duration,
    reporter: Option<CompletionReporter>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    /// Create a registry with the default 5 s grace period.
    pub fn new() -> Self {
        Self { processes: DashMap::new(), grace: DEFAULT_GRACE, reporter: None }
    }

    /// Override the SIGINT grace period. Used by tests.
    pub fn with_grace(grace: Duration) -> Self {
        Self { processes: DashMap::new(), grace, reporter: None }
    }

    /// Attach a completion reporter.
    pub fn with_reporter(mut self, reporter: CompletionReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Register a spawned child under `execution_id`.
    ///
    /// Fails when the child has no pid (already reaped at spawn).
    pub fn register(&self, execution_id: i64, child: Child, command: &str) -> bool {
        let Some(pid) = child.id() else {
            warn!(execution_id, "refusing to register reaped child");
            return false;
        };
        self.processes.insert(
            execution_id,
            Arc::new(ProcessHandle {
                pid,
                child: Arc::new(Mutex::new(child)),
                started_at: Utc::now(),
                command: command.to_string(),
            }),
        );
        true
    }

    /// Drop the mapping once an execution finishes on its own.
    pub fn deregister(&self, execution_id: i64) {
        self.processes.remove(&execution_id);
    }

    /// Running executions, oldest first.
    pub fn running(&self) -> Vec<RunningProcess> {
        let mut list: Vec<RunningProcess> = self
            .processes
            .iter()
            .map(|entry| RunningProcess {
                execution_id: *entry.key(),
                started_at: entry.started_at,
                command: entry.command.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.started_at);
        list
    }

    /// Terminate the process mapped to `execution_id`: SIGINT, and SIGKILL
    /// if it is still alive after the grace period. Returns `None` when no
    /// process is mapped.
    pub async fn terminate(&self, execution_id: i64) -> Option<TerminateOutcome> {
        let handle = self.processes.get(&execution_id)?.clone();
        info!(execution_id, pid = handle.pid, "terminating execution");

        if let Err(e) = kill(Pid::from_raw(handle.pid as i32), Signal::SIGINT) {
            warn!(execution_id, "SIGINT delivery failed: {e}");
        }

        let yielded = tokio::time::timeout(self.grace, async {
            let mut child = handle.child.lock().await;
            let _ = child.wait().await;
        })
        .await
        .is_ok();

        let signal = if yielded {
            "SIGINT"
        } else {
            let mut child = handle.child.lock().await;
            if let Err(e) = child.start_kill() {
                warn!(execution_id, "SIGKILL delivery failed: {e}");
            }
            let _ = child.wait().await;
            "SIGKILL"
        };

        self.processes.remove(&execution_id);
        if let Some(reporter) = &self.reporter {
            reporter.report_cancelled(execution_id).await;
        }
        Some(TerminateOutcome { terminated: true, signal: signal.to_string() })
    }
}

//─────────────────────────────
//  HTTP surface
//─────────────────────────────

/// Routes the agent runtime mounts into its HTTP server.
pub fn router(registry: Arc<ProcessRegistry>) -> Router {
    Router::new()
        .route("/executions/running", get(list_running))
        .route("/executions/:id/terminate", post(terminate_execution))
        .with_state(registry)
}

async fn list_running(State(registry): State<Arc<ProcessRegistry>>) -> Json<Vec<RunningProcess>> {
    Json(registry.running())
}

async fn terminate_execution(
    State(registry): State<Arc<ProcessRegistry>>,
    Path(execution_id): Path<i64>,
) -> Result<Json<TerminateOutcome>, StatusCode> {
    match registry.terminate(execution_id).await {
        Some(outcome) => Ok(Json(outcome)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn_sleep() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn terminate_delivers_sigint_first() {
        let registry = ProcessRegistry::new();
        let child = spawn_sleep();
        assert!(registry.register(7, child, "sleep 30"));
        assert_eq!(registry.running().len(), 1);

        let outcome = registry.terminate(7).await.unwrap();
        assert!(outcome.terminated);
        assert_eq!(outcome.signal, "SIGINT");
        assert!(registry.running().is_empty());
    }

    #[tokio::test]
    async fn stubborn_process_gets_sigkill() {
        let registry = ProcessRegistry::with_grace(Duration::from_millis(300));
        let child = Command::new("sh")
            .args(["-c", "trap '' INT; sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .expect("spawn trap");
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.register(9, child, "trap sleep"));

        let outcome = registry.terminate(9).await.unwrap();
        assert_eq!(outcome.signal, "SIGKILL");
    }

    #[tokio::test]
    async fn unknown_execution_is_none() {
        let registry = ProcessRegistry::new();
        assert!(registry.terminate(1).await.is_none());
    }

    #[tokio::test]
    async fn running_lists_oldest_first() {
        let registry = ProcessRegistry::new();
        registry.register(1, spawn_sleep(), "sleep 30");
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.register(2, spawn_sleep(), "sleep 30");

        let running = registry.running();
        assert_eq!(running.len(), 2);
        assert_eq!(running[0].execution_id, 1);
        assert_eq!(running[1].execution_id, 2);

        registry.terminate(1).await.unwrap();
        registry.terminate(2).await.unwrap();
    }
}
