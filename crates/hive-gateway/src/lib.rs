#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-gateway** – Inter-agent RPC gateway for the hive control plane.
//!
//! Validates caller scope, enforces the permission graph, selects sequential
//! vs parallel vs fire-and-forget semantics, and propagates caller identity
//! into the sandbox. Permission checks are exhaustive matches on
//! [`CallerIdentity`]:
//!
//! - **system** bypasses the edge set entirely;
//! - **agent** callers may always call themselves, and otherwise need the
//!   directed edge `caller → target`;
//! - **user** callers need ownership, a share grant, or the admin flag.
//!
//! Every inter-agent call is bracketed by an `agent_collaboration` activity:
//! `started` before forwarding, `completed` or `failed` after. Timeouts and
//! non-2xx sandbox responses close the activity; the dashboard never shows
//! perpetually running arrows.

use std::sync::Arc;
use std::time::Duration;

use hive_ledger::ActivityLedger;
use hive_queue::{Admission, ExecutionQueue};
use hive_store::{NewActivity, NewExecution, StateStore};
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, AgentName, CallOverrides, CallerIdentity,
    ExecutionMode, ExecutionStatus, HiveError, HiveResult, MAX_MESSAGE_LEN,
};
use tracing::{info, instrument, warn};

mod client;

pub use client::{
    AgentCallBody, AgentClient, AgentResponse, FakeAgentClient, HttpAgentClient, RunningProcess,
    TerminateOutcome, DEFAULT_CALL_TIMEOUT, SOURCE_AGENT_HEADER,
};

/// Characters of the inbound message kept in activity previews.
const PREVIEW_LEN: usize = 140;

/// A call admitted into the gateway.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Resolved caller identity.
    pub caller: CallerIdentity,
    /// Target agent name.
    pub target: AgentName,
    /// Message to run.
    pub message: String,
    /// Dispatch mode.
    pub mode: ExecutionMode,
    /// Per-call overrides.
    pub overrides: CallOverrides,
}

/// Outcome of a gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The work ran to completion; the response is sealed on the execution.
    Completed {
        /// Durable execution id.
        execution_id: i64,
        /// Structured sandbox response.
        response: AgentResponse,
    },
    /// The agent's queue slot is held. Backpressure is the caller's problem.
    Busy {
        /// Holder label.
        holder: String,
        /// Suggested retry delay, seconds.
        retry_after_secs: u64,
    },
    /// Fire-and-forget accepted; poll the execution row for progress.
    Accepted {
        /// Durable execution id.
        execution_id: i64,
    },
}

/// The gateway.
#[derive(Clone)]
pub struct RpcGateway {
    store: StateStore,
    queue: ExecutionQueue,
    ledger: ActivityLedger,
    client: Arc<dyn AgentClient>,
}

impl RpcGateway {
    /// Assemble the gateway from its collaborators.
    pub fn new(
        store: StateStore,
        queue: ExecutionQueue,
        ledger: ActivityLedger,
        client: Arc<dyn AgentClient>,
    ) -> Self {
        Self { store, queue, ledger, client }
    }

    /// The queue this gateway admits sequential work through.
    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// The ledger this gateway records into.
    pub fn ledger(&self) -> &ActivityLedger {
        &self.ledger
    }

    /// Dispatch a call according to its mode.
    #[instrument(skip(self, request), fields(target = %request.target, mode = ?request.mode))]
    pub async fn call(&self, request: CallRequest) -> HiveResult<CallOutcome> {
        if request.message.trim().is_empty() {
            return Err(HiveError::Validation("message is empty".into()));
        }
        if request.message.len() > MAX_MESSAGE_LEN {
            return Err(HiveError::Validation(format!(
                "message too long: {} > {}",
                request.message.len(),
                MAX_MESSAGE_LEN
            )));
        }
        self.store.agent_required(&request.target).await?;
        self.check_permission(&request.caller, &request.target).await?;

        match request.mode {
            ExecutionMode::Sequential => self.call_sequential(request).await,
            ExecutionMode::Parallel => self.call_parallel(request).await,
            ExecutionMode::ParallelAsync => self.call_parallel_async(request).await,
        }
    }

    /// Terminate an in-flight execution by durable id. Idempotent: a second
    /// terminate of the same execution is a no-op.
    #[instrument(skip(self, caller))]
    pub async fn terminate(
        &self,
        agent: &AgentName,
        execution_id: i64,
        caller: &CallerIdentity,
        reason: Option<String>,
    ) -> HiveResult<()> {
        let record = self
            .store
            .execution_by_id(execution_id)
            .await?
            .filter(|r| r.agent == *agent)
            .ok_or_else(|| HiveError::NotFound(format!("execution {execution_id}")))?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let outcome = self.client.terminate(agent, execution_id).await?;
        info!(agent = %agent, execution_id, signal = %outcome.signal, "execution terminated");

        // Conditional release: if the slot already expired and someone else
        // holds it, this is a no-op. The in-sandbox completion event takes
        // the same path and idempotence holds.
        if let Some(queue_id) = record.queue_id {
            self.queue.complete(agent, queue_id).await?;
        }

        let sealed = self
            .ledger
            .seal_execution(execution_id, ExecutionStatus::Cancelled, None, None, None,
                reason.as_deref())
            .await?;
        if sealed {
            self.ledger
                .record_activity(&NewActivity {
                    agent: agent.clone(),
                    activity_type: ActivityType::ExecutionCancelled,
                    state: ActivityState::Completed,
                    parent_activity_id: None,
                    related_execution_id: Some(execution_id),
                    related_message_id: None,
                    triggered_by: caller.trigger_kind(),
                    details: ActivityDetails::ExecutionCancelled { reason },
                })
                .await?;
        }
        Ok(())
    }

    //─────────────────────────────
    //  Admission
    //─────────────────────────────

    async fn check_permission(
        &self,
        caller: &CallerIdentity,
        target: &AgentName,
    ) -> HiveResult<()> {
        match caller {
            CallerIdentity::System => Ok(()),
            CallerIdentity::Agent { name } => {
                if self.store.has_edge(name, target).await? {
                    return Ok(());
                }
                warn!(source = %name, target = %target, "inter-agent call denied");
                // Audit entry on the *source* agent; the target never sees
                // a row for a call that was not admitted.
                self.ledger
                    .record_activity(&NewActivity {
                        agent: name.clone(),
                        activity_type: ActivityType::AgentCollaboration,
                        state: ActivityState::Failed,
                        parent_activity_id: None,
                        related_execution_id: None,
                        related_message_id: None,
                        triggered_by: caller.trigger_kind(),
                        details: ActivityDetails::PermissionDenied {
                            source: name.clone(),
                            target: target.clone(),
                        },
                    })
                    .await?;
                Err(HiveError::PermissionDenied {
                    caller: caller.holder_label(),
                    target: target.to_string(),
                })
            }
            CallerIdentity::User { id, admin } => {
                if self.store.user_can_access(*id, *admin, target).await? {
                    Ok(())
                } else {
                    Err(HiveError::PermissionDenied {
                        caller: caller.holder_label(),
                        target: target.to_string(),
                    })
                }
            }
        }
    }

    //─────────────────────────────
    //  Sequential path
    //─────────────────────────────

    async fn call_sequential(&self, request: CallRequest) -> HiveResult<CallOutcome> {
        let timeout = call_timeout(&request.overrides);
        let admission = self
            .queue
            .submit(&request.target, &request.caller, Some(timeout))
            .await?;
        let volatile_id = match admission {
            Admission::Busy { holder, retry_after } => {
                return Ok(CallOutcome::Busy {
                    holder: holder.holder_label(),
                    retry_after_secs: retry_after.as_secs(),
                });
            }
            Admission::Admitted { volatile_id } => volatile_id,
        };

        let collaboration_id = self.open_collaboration(&request).await?;

        // Execution row first, chat_start second, one transaction.
        let (execution_id, chat_start_id) = self
            .ledger
            .record_execution_start(
                &NewExecution {
                    agent: request.target.clone(),
                    schedule_id: None,
                    queue_id: Some(volatile_id),
                    input: request.message.clone(),
                    triggered_by: request.caller.trigger_kind(),
                    source_agent: request.caller.source_agent().cloned(),
                    status: ExecutionStatus::Running,
                },
                &NewActivity {
                    agent: request.target.clone(),
                    activity_type: ActivityType::ChatStart,
                    state: ActivityState::Started,
                    parent_activity_id: None,
                    related_execution_id: None,
                    related_message_id: None,
                    triggered_by: request.caller.trigger_kind(),
                    details: ActivityDetails::ChatStart {
                        message_preview: preview(&request.message),
                    },
                },
            )
            .await?;

        // The user side of the chat history is appended before dispatch so
        // the session reflects causal order even if the sandbox dies.
        let session_id = if let CallerIdentity::User { id, .. } = &request.caller {
            let session = self.store.ensure_session(&request.target, *id).await?;
            self.store
                .append_message(session.id, "user", &request.message, None, None, None, None)
                .await?;
            Some(session.id)
        } else {
            None
        };

        let body = AgentCallBody {
            execution_id,
            message: request.message.clone(),
            overrides: request.overrides.clone(),
        };
        let dispatched = tokio::time::timeout(
            timeout,
            self.client.chat(&request.target, &body, request.caller.source_agent(), timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(HiveError::DependencyUnavailable(format!(
                "chat on {} timed out after {}s",
                request.target,
                timeout.as_secs()
            )))
        });

        // Whatever happened, the slot is released before reporting.
        self.queue.complete(&request.target, volatile_id).await?;

        match dispatched {
            Ok(response) => {
                let sealed = self
                    .ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Succeeded,
                        Some(&response.transcript),
                        Some(response.cost_usd),
                        Some(response.tokens as i64),
                        None,
                    )
                    .await?;
                if !sealed {
                    // A terminate sealed the row first; its bookkeeping wins.
                    self.ledger.close_activity(chat_start_id, ActivityState::Failed).await?;
                    self.close_collaboration(collaboration_id, ActivityState::Failed).await?;
                    return Err(HiveError::Cancelled);
                }
                self.ledger.close_activity(chat_start_id, ActivityState::Completed).await?;

                let message_id = if let Some(session_id) = session_id {
                    let message = self
                        .store
                        .append_message(
                            session_id,
                            "assistant",
                            &response.result,
                            Some(response.cost_usd),
                            Some(response.tokens as i64),
                            tool_summary(&response).as_deref(),
                            None,
                        )
                        .await?;
                    Some(message.id)
                } else {
                    None
                };

                self.ledger
                    .record_activity(&NewActivity {
                        agent: request.target.clone(),
                        activity_type: ActivityType::ChatEnd,
                        state: ActivityState::Completed,
                        parent_activity_id: Some(chat_start_id),
                        related_execution_id: Some(execution_id),
                        related_message_id: message_id,
                        triggered_by: request.caller.trigger_kind(),
                        details: ActivityDetails::ChatEnd {
                            cost_usd: response.cost_usd,
                            tokens: response.tokens,
                        },
                    })
                    .await?;
                self.close_collaboration(collaboration_id, ActivityState::Completed).await?;
                Ok(CallOutcome::Completed { execution_id, response })
            }
            Err(err) => {
                self.ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        None,
                        None,
                        Some(&err.to_string()),
                    )
                    .await?;
                self.ledger.close_activity(chat_start_id, ActivityState::Failed).await?;
                self.close_collaboration(collaboration_id, ActivityState::Failed).await?;
                Err(err)
            }
        }
    }

    //─────────────────────────────
    //  Parallel paths
    //─────────────────────────────

    async fn call_parallel(&self, request: CallRequest) -> HiveResult<CallOutcome> {
        let timeout = call_timeout(&request.overrides);
        let collaboration_id = self.open_collaboration(&request).await?;

        let execution_id = self
            .store
            .insert_execution(&NewExecution {
                agent: request.target.clone(),
                schedule_id: None,
                queue_id: None,
                input: request.message.clone(),
                triggered_by: request.caller.trigger_kind(),
                source_agent: request.caller.source_agent().cloned(),
                status: ExecutionStatus::Running,
            })
            .await?;

        let body = AgentCallBody {
            execution_id,
            message: request.message.clone(),
            overrides: request.overrides.clone(),
        };
        let dispatched = tokio::time::timeout(
            timeout,
            self.client.task(&request.target, &body, request.caller.source_agent(), timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(HiveError::DependencyUnavailable(format!(
                "task on {} timed out after {}s",
                request.target,
                timeout.as_secs()
            )))
        });

        match dispatched {
            Ok(response) => {
                self.ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Succeeded,
                        Some(&response.transcript),
                        Some(response.cost_usd),
                        Some(response.tokens as i64),
                        None,
                    )
                    .await?;
                self.close_collaboration(collaboration_id, ActivityState::Completed).await?;
                Ok(CallOutcome::Completed { execution_id, response })
            }
            Err(err) => {
                self.ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        None,
                        None,
                        Some(&err.to_string()),
                    )
                    .await?;
                self.close_collaboration(collaboration_id, ActivityState::Failed).await?;
                Err(err)
            }
        }
    }

    async fn call_parallel_async(&self, request: CallRequest) -> HiveResult<CallOutcome> {
        let timeout = call_timeout(&request.overrides);
        let collaboration_id = self.open_collaboration(&request).await?;

        // Durable row up front; the caller polls it for progress.
        let execution_id = self
            .store
            .insert_execution(&NewExecution {
                agent: request.target.clone(),
                schedule_id: None,
                queue_id: None,
                input: request.message.clone(),
                triggered_by: request.caller.trigger_kind(),
                source_agent: request.caller.source_agent().cloned(),
                status: ExecutionStatus::Queued,
            })
            .await?;

        let gateway = self.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway
                .run_async_task(request, execution_id, collaboration_id, timeout)
                .await
            {
                warn!(execution_id, "async task bookkeeping failed: {e}");
            }
        });

        Ok(CallOutcome::Accepted { execution_id })
    }

    async fn run_async_task(
        &self,
        request: CallRequest,
        execution_id: i64,
        collaboration_id: Option<i64>,
        timeout: Duration,
    ) -> HiveResult<()> {
        self.store.mark_execution_running(execution_id, chrono::Utc::now()).await?;
        let body = AgentCallBody {
            execution_id,
            message: request.message.clone(),
            overrides: request.overrides.clone(),
        };
        let dispatched = tokio::time::timeout(
            timeout,
            self.client.task(&request.target, &body, request.caller.source_agent(), timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(HiveError::DependencyUnavailable(format!(
                "task on {} timed out after {}s",
                request.target,
                timeout.as_secs()
            )))
        });

        match dispatched {
            Ok(response) => {
                let sealed = self
                    .ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Succeeded,
                        Some(&response.transcript),
                        Some(response.cost_usd),
                        Some(response.tokens as i64),
                        None,
                    )
                    .await?;
                let state = if sealed { ActivityState::Completed } else { ActivityState::Failed };
                self.close_collaboration(collaboration_id, state).await?;
            }
            Err(err) => {
                self.ledger
                    .seal_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        None,
                        None,
                        Some(&err.to_string()),
                    )
                    .await?;
                self.close_collaboration(collaboration_id, ActivityState::Failed).await?;
            }
        }
        Ok(())
    }

    //─────────────────────────────
    //  Collaboration bracket
    //─────────────────────────────

    async fn open_collaboration(&self, request: &CallRequest) -> HiveResult<Option<i64>> {
        let CallerIdentity::Agent { name } = &request.caller else {
            return Ok(None);
        };
        if name == &request.target {
            return Ok(None);
        }
        let id = self
            .ledger
            .record_activity(&NewActivity {
                agent: name.clone(),
                activity_type: ActivityType::AgentCollaboration,
                state: ActivityState::Started,
                parent_activity_id: None,
                related_execution_id: None,
                related_message_id: None,
                triggered_by: request.caller.trigger_kind(),
                details: ActivityDetails::AgentCollaboration {
                    source: name.clone(),
                    target: request.target.clone(),
                    mode: request.mode,
                },
            })
            .await?;
        Ok(Some(id))
    }

    async fn close_collaboration(
        &self,
        collaboration_id: Option<i64>,
        state: ActivityState,
    ) -> HiveResult<()> {
        if let Some(id) = collaboration_id {
            self.ledger.close_activity(id, state).await?;
        }
        Ok(())
    }
}

fn call_timeout(overrides: &CallOverrides) -> Duration {
    overrides.timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_CALL_TIMEOUT)
}

fn preview(message: &str) -> String {
    if message.len() <= PREVIEW_LEN {
        message.to_string()
    } else {
        let cut = message
            .char_indices()
            .take_while(|(i, _)| *i < PREVIEW_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &message[..cut])
    }
}

fn tool_summary(response: &AgentResponse) -> Option<String> {
    let count = response
        .transcript
        .iter()
        .filter(|e| matches!(e, hive_types::TranscriptEntry::ToolCall { .. }))
        .count();
    (count > 0).then(|| format!("{count} tool calls"))
}

#[cfg(test)]
mod tests;
