#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-scheduler** – Single-instance cron scheduler for the hive control
//! plane.
//!
//! The scheduler is the only writer of schedule fire state. Deployment keeps
//! it single-instance; a per-schedule distributed lock defends against the
//! deployment mistake of running two. Fire semantics are at-most-once:
//! `next_run_at` is advanced in the state store *before* dispatch, so a
//! crash between advance and dispatch skips the fire instead of duplicating
//! it.
//!
//! Errors never propagate to a caller (there is none); they are recorded on
//! the execution row and the loop moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_coord::{scheduler_lock_key, CoordStore};
use hive_gateway::{AgentCallBody, AgentClient};
use hive_ledger::ActivityLedger;
use hive_queue::{Admission, ExecutionQueue};
use hive_store::{NewActivity, NewExecution, ScheduleRecord, StateStore};
use hive_types::{
    ActivityDetails, ActivityState, ActivityType, CallOverrides, CallerIdentity, ExecutionStatus,
    HiveResult, TriggerKind,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

mod cron_expr;

pub use cron_expr::{next_fire, parse_cron};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Evaluation cadence.
    pub tick: Duration,
    /// Per-schedule lock TTL. Larger than any expected dispatch; renewed at
    /// half-TTL during long ones.
    pub lock_ttl: Duration,
    /// Cadence of the cron-state resync against the store.
    pub resync: Duration,
    /// Timeout applied to a single dispatch.
    pub dispatch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(600),
            resync: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(540),
        }
    }
}

/// The scheduler service.
#[derive(Clone)]
pub struct Scheduler {
    store: StateStore,
    coord: Arc<dyn CoordStore>,
    queue: ExecutionQueue,
    ledger: ActivityLedger,
    client: Arc<dyn AgentClient>,
    config: SchedulerConfig,
    instance_id: Uuid,
}

impl Scheduler {
    /// Assemble a scheduler from its collaborators.
    pub fn new(
        store: StateStore,
        coord: Arc<dyn CoordStore>,
        queue: ExecutionQueue,
        ledger: ActivityLedger,
        client: Arc<dyn AgentClient>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, coord, queue, ledger, client, config, instance_id: Uuid::new_v4() }
    }

    /// Run the evaluation loop until the task is aborted.
    pub async fn run(&self) {
        info!(instance = %self.instance_id, "scheduler started");
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut resync = tokio::time::interval(self.config.resync);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        warn!("scheduler tick failed: {e}");
                    }
                }
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("scheduler resync failed: {e}");
                    }
                }
            }
        }
    }

    /// One evaluation pass at `now`: fire every due schedule whose lock we
    /// can take. Fires within a tick run concurrently; this method returns
    /// when all of them have settled.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> HiveResult<()> {
        let due = self.store.due_schedules(now).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(candidates = due.len(), "evaluating due schedules");
        let fires = due.into_iter().map(|schedule| {
            let scheduler = self.clone();
            async move { scheduler.fire(schedule, now, true).await }
        });
        futures::future::join_all(fires).await;
        Ok(())
    }

    /// Backfill `next_run_at` for enabled schedules that lack one, so
    /// schedules created or edited behind the scheduler's back start firing
    /// without a restart.
    pub async fn resync(&self) -> HiveResult<()> {
        let now = Utc::now();
        for schedule in self.store.enabled_schedules().await? {
            if schedule.next_run_at.is_some() {
                continue;
            }
            match next_fire(&schedule.cron, &schedule.timezone, now) {
                Ok(next) => {
                    info!(schedule_id = schedule.id, %next, "backfilled next fire");
                    self.store.set_schedule_next_run(schedule.id, next).await?;
                }
                Err(e) => {
                    warn!(schedule_id = schedule.id, "unschedulable expression: {e}")
                }
            }
        }
        Ok(())
    }

    /// Manual trigger: the cron-fire code path minus the cron advance,
    /// stamped with the triggering caller instead of the schedule.
    pub async fn trigger_now(&self, schedule_id: i64, caller: &CallerIdentity) -> HiveResult<i64> {
        let schedule = self
            .store
            .schedule_by_id(schedule_id)
            .await?
            .ok_or_else(|| hive_types::HiveError::NotFound(format!("schedule {schedule_id}")))?;
        self.dispatch(&schedule, caller.trigger_kind()).await
    }

    //─────────────────────────────
    //  Fire path
    //─────────────────────────────

    /// Fire one schedule under its distributed lock.
    #[instrument(skip(self, schedule), fields(schedule_id = schedule.id, agent = %schedule.agent))]
    async fn fire(&self, schedule: ScheduleRecord, now: DateTime<Utc>, advance: bool) {
        let lock_key = scheduler_lock_key(schedule.id);
        let holder = self.instance_id.to_string();
        match self.coord.set_nx_ttl(&lock_key, &holder, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("schedule lock held elsewhere; skipping");
                return;
            }
            Err(e) => {
                warn!("lock acquisition failed, backing off: {e}");
                return;
            }
        }

        // Re-check due-ness under the lock: another instance may have fired
        // and advanced the cursor between our due query and the acquisition.
        if advance {
            let still_due = match self.store.schedule_by_id(schedule.id).await {
                Ok(Some(current)) => current.next_run_at.is_some_and(|next| next <= now),
                Ok(None) => false,
                Err(e) => {
                    warn!("due re-check failed: {e}");
                    false
                }
            };
            if !still_due {
                debug!("schedule no longer due under lock; skipping");
                let _ = self.coord.del_if_eq(&lock_key, &holder).await;
                return;
            }
        }

        // Advance the fire cursor BEFORE dispatch. A crash from here on
        // skips the fire; that is the preferred failure mode.
        if advance {
            let advanced = match next_fire(&schedule.cron, &schedule.timezone, now) {
                Ok(next) => self.store.advance_schedule(schedule.id, now, next).await,
                Err(e) => {
                    error!("cron advance failed: {e}");
                    let _ = self.coord.del_if_eq(&lock_key, &holder).await;
                    return;
                }
            };
            if let Err(e) = advanced {
                error!("cron advance write failed: {e}");
                let _ = self.coord.del_if_eq(&lock_key, &holder).await;
                return;
            }
        }

        // Renew the lock at half-TTL while the dispatch runs.
        let renewer = {
            let coord = self.coord.clone();
            let lock_key = lock_key.clone();
            let holder = holder.clone();
            let ttl = self.config.lock_ttl;
            tokio::spawn(async move {
                let mut renew = tokio::time::interval(ttl / 2);
                renew.tick().await; // first tick is immediate
                loop {
                    renew.tick().await;
                    match coord.expire_if_eq(&lock_key, &holder, ttl).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => warn!("lock renewal failed: {e}"),
                    }
                }
            })
        };

        if let Err(e) = self.dispatch(&schedule, TriggerKind::Schedule).await {
            // Recorded on the execution row already; log and move on.
            warn!("schedule dispatch failed: {e}");
        }

        renewer.abort();
        let _ = self.coord.del_if_eq(&lock_key, &holder).await;
    }

    /// Insert execution + schedule_start (execution first), dispatch, seal.
    /// Returns the durable execution id.
    async fn dispatch(&self, schedule: &ScheduleRecord, trigger: TriggerKind) -> HiveResult<i64> {
        let (execution_id, start_activity_id) = self
            .ledger
            .record_execution_start(
                &NewExecution {
                    agent: schedule.agent.clone(),
                    schedule_id: Some(schedule.id),
                    queue_id: None,
                    input: schedule.message.clone(),
                    triggered_by: trigger,
                    source_agent: None,
                    status: ExecutionStatus::Queued,
                },
                &NewActivity {
                    agent: schedule.agent.clone(),
                    activity_type: ActivityType::ScheduleStart,
                    state: ActivityState::Started,
                    parent_activity_id: None,
                    related_execution_id: None,
                    related_message_id: None,
                    triggered_by: trigger,
                    details: ActivityDetails::ScheduleStart {
                        schedule_id: schedule.id,
                        cron: schedule.cron.clone(),
                    },
                },
            )
            .await?;

        let volatile_id = if schedule.parallel {
            None
        } else {
            match self.queue.submit(&schedule.agent, &CallerIdentity::System, None).await? {
                Admission::Admitted { volatile_id } => {
                    self.store.set_execution_queue_id(execution_id, volatile_id).await?;
                    Some(volatile_id)
                }
                Admission::Busy { holder, .. } => {
                    // No retry inside this tick; the fire is spent.
                    info!(
                        agent = %schedule.agent,
                        holder = %holder.holder_label(),
                        "agent busy; recording failed fire"
                    );
                    self.ledger
                        .seal_execution(
                            execution_id,
                            ExecutionStatus::Failed,
                            None,
                            None,
                            None,
                            Some("queue_busy"),
                        )
                        .await?;
                    self.ledger
                        .close_activity(start_activity_id, ActivityState::Failed)
                        .await?;
                    return Ok(execution_id);
                }
            }
        };

        self.store.mark_execution_running(execution_id, Utc::now()).await?;
        let body = AgentCallBody {
            execution_id,
            message: schedule.message.clone(),
            overrides: CallOverrides::default(),
        };
        let timeout = self.config.dispatch_timeout;
        let dispatched = tokio::time::timeout(timeout, async {
            if schedule.parallel {
                self.client.task(&schedule.agent, &body, None, timeout).await
            } else {
                self.client.chat(&schedule.agent, &body, None, timeout).await
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(hive_types::HiveError::DependencyUnavailable(format!(
                "dispatch to {} timed out after {}s",
                schedule.agent,
                timeout.as_secs()
            )))
        });

        if let Some(volatile_id) = volatile_id {
            self.queue.complete(&schedule.agent, volatile_id).await?;
        }

        let status = match dispatched {
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
                self.ledger
                    .close_activity(start_activity_id, ActivityState::Completed)
                    .await?;
                ExecutionStatus::Succeeded
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
                self.ledger.close_activity(start_activity_id, ActivityState::Failed).await?;
                ExecutionStatus::Failed
            }
        };

        self.ledger
            .record_activity(&NewActivity {
                agent: schedule.agent.clone(),
                activity_type: ActivityType::ScheduleEnd,
                state: if status == ExecutionStatus::Succeeded {
                    ActivityState::Completed
                } else {
                    ActivityState::Failed
                },
                parent_activity_id: Some(start_activity_id),
                related_execution_id: Some(execution_id),
                related_message_id: None,
                triggered_by: trigger,
                details: ActivityDetails::ScheduleEnd { schedule_id: schedule.id, status },
            })
            .await?;
        Ok(execution_id)
    }
}

#[cfg(test)]
mod tests;
