#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-queue** – Per-agent execution queue for the hive control plane.
//!
//! Guarantees at most one stateful, conversation-carrying execution per
//! agent at a time. Admission is a single atomic set-if-absent on
//! `queue:{agent}` – never a read-then-write pair – and release is a
//! server-side compare-and-delete conditioned on the volatile id, so a late
//! release from an expired holder leaves a successor's slot intact.
//!
//! Stateless parallel tasks never touch this queue; they are bounded only by
//! the agent's resource envelope.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hive_coord::{queue_key, CoordStore};
use hive_types::{AgentName, CallerIdentity, HiveError, HiveResult, QueueSlot,
    DEFAULT_QUEUE_TTL_SECS};
use tracing::{debug, warn};
use uuid::Uuid;

/// Ceiling on the retry hint handed back in busy envelopes, seconds.
const MAX_RETRY_HINT_SECS: u64 = 30;

/// Outcome of a sequential-chat admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The slot is ours; `volatile_id` names this tenure.
    Admitted {
        /// Volatile execution id carried by the slot.
        volatile_id: Uuid,
    },
    /// The slot is held. Backpressure is the caller's responsibility; the
    /// queue never buffers requests internally.
    Busy {
        /// Current holder.
        holder: CallerIdentity,
        /// Suggested retry delay.
        retry_after: Duration,
    },
}

/// Per-agent mutual exclusion over the coordination store.
#[derive(Clone)]
pub struct ExecutionQueue {
    coord: Arc<dyn CoordStore>,
    default_ttl: Duration,
}

impl ExecutionQueue {
    /// Create a queue with the default 15-minute slot TTL.
    pub fn new(coord: Arc<dyn CoordStore>) -> Self {
        Self { coord, default_ttl: Duration::from_secs(DEFAULT_QUEUE_TTL_SECS) }
    }

    /// Override the slot TTL. Used by tests and constrained deployments.
    pub fn with_ttl(coord: Arc<dyn CoordStore>, default_ttl: Duration) -> Self {
        Self { coord, default_ttl }
    }

    /// The queue's slot TTL.
    pub fn ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Try to acquire the agent's slot for `caller`.
    ///
    /// `ttl` bounds this single execution; when a holder dies without
    /// releasing, expiry frees the slot for the next submitter.
    pub async fn submit(
        &self,
        agent: &AgentName,
        caller: &CallerIdentity,
        ttl: Option<Duration>,
    ) -> HiveResult<Admission> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let volatile_id = Uuid::new_v4();
        let slot = QueueSlot {
            volatile_id,
            holder: caller.clone(),
            acquired_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        let value = serde_json::to_string(&slot)?;
        let key = queue_key(agent.as_str());

        if self.coord.set_nx_ttl(&key, &value, ttl).await? {
            debug!(agent = %agent, %volatile_id, "queue slot acquired");
            return Ok(Admission::Admitted { volatile_id });
        }

        // Someone else holds it; read the cell for the busy envelope. The
        // slot may expire between the two calls, in which case the caller
        // just retries into an empty cell.
        match self.holder(agent).await? {
            Some(current) => Ok(Admission::Busy {
                retry_after: retry_hint(&current),
                holder: current.holder,
            }),
            None => Ok(Admission::Busy {
                holder: CallerIdentity::System,
                retry_after: Duration::from_secs(1),
            }),
        }
    }

    /// Release the slot iff it still belongs to `volatile_id`.
    ///
    /// Returns `false` when the slot expired and was taken over; the release
    /// is then a no-op by design. Safe to call twice for the same tenure.
    pub async fn complete(&self, agent: &AgentName, volatile_id: Uuid) -> HiveResult<bool> {
        let key = queue_key(agent.as_str());
        let Some(raw) = self.coord.get(&key).await? else {
            return Ok(false);
        };
        let slot: QueueSlot = serde_json::from_str(&raw)
            .map_err(|e| HiveError::Internal(format!("bad queue slot value: {e}")))?;
        if slot.volatile_id != volatile_id {
            warn!(agent = %agent, %volatile_id, "late release ignored; slot was taken over");
            return Ok(false);
        }
        // The holder check above is advisory; the compare-and-delete on the
        // exact cell value is what makes release atomic.
        let released = self.coord.del_if_eq(&key, &raw).await?;
        if released {
            debug!(agent = %agent, %volatile_id, "queue slot released");
        }
        Ok(released)
    }

    /// Current slot holder, if the agent is busy.
    pub async fn holder(&self, agent: &AgentName) -> HiveResult<Option<QueueSlot>> {
        self.read_slot(&queue_key(agent.as_str())).await
    }

    /// Names of all agents whose slot is held, via cursor iteration.
    pub async fn busy_agents(&self) -> HiveResult<Vec<AgentName>> {
        let keys = self.coord.scan_prefix("queue:").await?;
        let mut agents = Vec::with_capacity(keys.len());
        for key in keys {
            let name = key.trim_start_matches("queue:");
            agents.push(AgentName::parse(name)?);
        }
        agents.sort();
        Ok(agents)
    }

    async fn read_slot(&self, key: &str) -> HiveResult<Option<QueueSlot>> {
        let Some(raw) = self.coord.get(key).await? else {
            return Ok(None);
        };
        let slot = serde_json::from_str(&raw)
            .map_err(|e| HiveError::Internal(format!("bad queue slot value: {e}")))?;
        Ok(Some(slot))
    }
}

/// Remaining slot lifetime, clamped into [1, MAX_RETRY_HINT_SECS].
fn retry_hint(slot: &QueueSlot) -> Duration {
    let elapsed = (Utc::now() - slot.acquired_at).num_seconds().max(0) as u64;
    let remaining = slot.ttl_secs.saturating_sub(elapsed);
    Duration::from_secs(remaining.clamp(1, MAX_RETRY_HINT_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_coord::MemoryCoord;

    fn user(n: u128) -> CallerIdentity {
        CallerIdentity::User { id: Uuid::from_u128(n), admin: false }
    }

    fn agent(name: &str) -> AgentName {
        AgentName::sanitize(name).unwrap()
    }

    fn queue(coord: &Arc<MemoryCoord>) -> ExecutionQueue {
        ExecutionQueue::new(coord.clone() as Arc<dyn CoordStore>)
    }

    #[tokio::test]
    async fn one_admission_at_a_time() {
        let coord = Arc::new(MemoryCoord::new());
        let q = queue(&coord);
        let alpha = agent("alpha");

        let first = q.submit(&alpha, &user(1), None).await.unwrap();
        let Admission::Admitted { volatile_id } = first else {
            panic!("first submit must be admitted");
        };

        match q.submit(&alpha, &user(2), None).await.unwrap() {
            Admission::Busy { holder, retry_after } => {
                assert_eq!(holder, user(1));
                assert!(retry_after >= Duration::from_secs(1));
            }
            other => panic!("expected busy, got {other:?}"),
        }

        assert!(q.complete(&alpha, volatile_id).await.unwrap());
        assert!(matches!(
            q.submit(&alpha, &user(2), None).await.unwrap(),
            Admission::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_submitters_get_exactly_one_slot() {
        let coord = Arc::new(MemoryCoord::new());
        let q = queue(&coord);
        let alpha = agent("alpha");

        let submits = (0..16u128).map(|n| {
            let q = q.clone();
            let alpha = alpha.clone();
            tokio::spawn(async move { q.submit(&alpha, &user(n), None).await.unwrap() })
        });
        let outcomes = futures::future::join_all(submits).await;

        let admitted = outcomes
            .iter()
            .filter(|o| matches!(o.as_ref().unwrap(), Admission::Admitted { .. }))
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn late_release_leaves_successor_intact() {
        let coord = Arc::new(MemoryCoord::new());
        let q = queue(&coord);
        let alpha = agent("alpha");

        let Admission::Admitted { volatile_id: x } =
            q.submit(&alpha, &user(1), None).await.unwrap()
        else {
            panic!("x not admitted");
        };

        // X's ttl expires without a release; Y takes the slot over.
        coord.force_expire(&queue_key("alpha")).await;
        let Admission::Admitted { volatile_id: y } =
            q.submit(&alpha, &user(2), None).await.unwrap()
        else {
            panic!("y not admitted");
        };

        // X's late release must be a no-op.
        assert!(!q.complete(&alpha, x).await.unwrap());
        let slot = q.holder(&alpha).await.unwrap().unwrap();
        assert_eq!(slot.volatile_id, y);

        assert!(q.complete(&alpha, y).await.unwrap());
        assert!(q.holder(&alpha).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn double_release_is_idempotent() {
        let coord = Arc::new(MemoryCoord::new());
        let q = queue(&coord);
        let alpha = agent("alpha");

        let Admission::Admitted { volatile_id } = q.submit(&alpha, &user(1), None).await.unwrap()
        else {
            panic!("not admitted");
        };
        assert!(q.complete(&alpha, volatile_id).await.unwrap());
        assert!(!q.complete(&alpha, volatile_id).await.unwrap());
    }

    #[tokio::test]
    async fn busy_agents_lists_held_slots() {
        let coord = Arc::new(MemoryCoord::new());
        let q = queue(&coord);

        q.submit(&agent("alpha"), &user(1), None).await.unwrap();
        q.submit(&agent("beta"), &user(2), None).await.unwrap();

        let busy = q.busy_agents().await.unwrap();
        assert_eq!(busy, vec![agent("alpha"), agent("beta")]);
    }
}
