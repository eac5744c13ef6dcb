//! Job registry and dispatch bookkeeping.
//!
//! Every rule has at most one job in flight (queued or running). The slot is
//! taken at enqueue and released only when the job reaches a terminal state,
//! so retries keep it. Jobs whose dependencies are still materializing wait
//! outside the queue until those dependencies commit. Workers never wait on
//! the queue themselves: a released job that does not fit is handed to a
//! background send.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use audience_core::config::{BatchConfig, SchedulerConfig};
use audience_core::{AudienceError, AudienceResult, RuleId, Schedule, TriggerKind};
use audience_materializer::{MaterializationWriter, PublishRequest};
use audience_segmentation::{RuleDefinition, SegmentationEngine};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchEngine, BatchFailure, BatchRequest, TaskStatus};
use crate::job::{JobState, MaterializationJob};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Enqueued { rule_id: RuleId, job_id: Uuid },
    Skipped { rule_id: RuleId, reason: String },
}

#[derive(Debug, Clone, Copy)]
struct ScheduleTimer {
    schedule: Schedule,
    next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct DispatchState {
    in_flight: HashMap<RuleId, Uuid>,
    /// Jobs held back until the listed dependency rules commit.
    gated: HashMap<Uuid, BTreeSet<RuleId>>,
    timers: HashMap<RuleId, ScheduleTimer>,
}

pub struct JobScheduler {
    segmentation: Arc<SegmentationEngine>,
    writer: MaterializationWriter,
    retry: RetryPolicy,
    poll_interval: Duration,
    job_timeout: Duration,
    data_source: String,
    output_dir: String,
    jobs: DashMap<Uuid, MaterializationJob>,
    state: Mutex<DispatchState>,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>>,
    changes: watch::Sender<u64>,
}

impl JobScheduler {
    pub fn new(
        config: &SchedulerConfig,
        batch: &BatchConfig,
        segmentation: Arc<SegmentationEngine>,
        writer: MaterializationWriter,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (changes, _) = watch::channel(0);
        Self {
            segmentation,
            writer,
            retry: RetryPolicy::from_config(config),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            job_timeout: Duration::from_secs(config.job_timeout_secs.max(1)),
            data_source: batch.data_source.clone(),
            output_dir: batch.output_dir.clone(),
            jobs: DashMap::new(),
            state: Mutex::new(DispatchState::default()),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            changes,
        }
    }

    pub fn segmentation(&self) -> &Arc<SegmentationEngine> {
        &self.segmentation
    }

    pub fn writer(&self) -> &MaterializationWriter {
        &self.writer
    }

    pub(crate) fn queue(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>> {
        self.queue_rx.clone()
    }

    // ─── Enqueue ────────────────────────────────────────────────────────

    /// Enqueue a materialization of `rule_id`.
    ///
    /// If the rule already has a job in flight, a manual trigger gets that
    /// job's id back while a scheduled trigger is refused with
    /// `SchedulerBusy`. Dependencies with no segment built from their current
    /// definition, and no job in flight, are enqueued as well, and the job is
    /// held until every in-flight dependency commits.
    pub async fn enqueue(&self, rule_id: RuleId, trigger: TriggerKind) -> AudienceResult<Uuid> {
        let rule = self.segmentation.get_rule(rule_id)?;
        let existing = Self::existing_job(&self.state.lock(), rule_id, trigger);
        if let Some(existing) = existing {
            return existing;
        }

        let missing = self.stale_dependencies(&rule).await?;
        let mut batch: Vec<RuleDefinition> = if missing.is_empty() {
            Vec::new()
        } else {
            self.segmentation
                .materialization_order()?
                .into_iter()
                .filter_map(|id| missing.get(&id).cloned())
                .collect()
        };
        batch.push(rule);

        let (job_id, created) = self.admit(rule_id, trigger, &batch)?;
        metrics::counter!("scheduler.jobs_enqueued").increment(created as u64);
        self.notify();
        info!(
            rule_id,
            job_id = %job_id,
            trigger = ?trigger,
            dependencies_enqueued = created.saturating_sub(1),
            "Materialization job enqueued"
        );
        Ok(job_id)
    }

    /// Create jobs for `batch` (dependencies first, target last) under the
    /// dispatch lock. Returns the target's job id and how many jobs were
    /// created.
    fn admit(
        &self,
        rule_id: RuleId,
        trigger: TriggerKind,
        batch: &[RuleDefinition],
    ) -> AudienceResult<(Uuid, usize)> {
        let mut state = self.state.lock();
        if let Some(existing) = Self::existing_job(&state, rule_id, trigger) {
            return existing.map(|job_id| (job_id, 0));
        }

        let mut created = Vec::with_capacity(batch.len());
        let mut ready = Vec::new();
        for definition in batch {
            if state.in_flight.contains_key(&definition.id) {
                continue;
            }
            let mut job = MaterializationJob::new(definition.id, trigger, self.retry.max_attempts);
            let waiting: BTreeSet<RuleId> = definition
                .depends_on
                .iter()
                .copied()
                .filter(|dep| state.in_flight.contains_key(dep))
                .collect();
            job.waiting_on = waiting.iter().copied().collect();
            state.in_flight.insert(definition.id, job.id);
            if waiting.is_empty() {
                ready.push(job.id);
            } else {
                debug!(rule_id = definition.id, waiting_on = ?waiting, "Job gated on dependencies");
                state.gated.insert(job.id, waiting);
            }
            created.push(job.id);
            self.jobs.insert(job.id, job);
        }

        let capacity = self.queue_tx.max_capacity();
        let sent = ready.len() <= self.queue_tx.capacity()
            && ready.iter().all(|job_id| self.queue_tx.try_send(*job_id).is_ok());
        if !sent {
            self.rollback(&mut state, &created);
            metrics::counter!("scheduler.queue_full").increment(1);
            return Err(AudienceError::QueueFull { capacity });
        }
        metrics::gauge!("scheduler.in_flight").set(state.in_flight.len() as f64);

        let job_id = state.in_flight.get(&rule_id).copied().ok_or_else(|| {
            AudienceError::Internal(anyhow::anyhow!("job for rule {rule_id} vanished during enqueue"))
        })?;
        Ok((job_id, created.len()))
    }

    fn existing_job(
        state: &DispatchState,
        rule_id: RuleId,
        trigger: TriggerKind,
    ) -> Option<AudienceResult<Uuid>> {
        let job_id = *state.in_flight.get(&rule_id)?;
        Some(match trigger {
            TriggerKind::Manual => {
                metrics::counter!("scheduler.trigger_deduplicated").increment(1);
                debug!(rule_id, job_id = %job_id, "Rule already in flight, returning existing job");
                Ok(job_id)
            }
            TriggerKind::Scheduled => Err(AudienceError::SchedulerBusy { rule_id, job_id }),
        })
    }

    /// Transitive dependencies whose published segment is missing or was
    /// built from an older revision of their definition, following only
    /// chains of such rules.
    async fn stale_dependencies(
        &self,
        rule: &RuleDefinition,
    ) -> AudienceResult<BTreeMap<RuleId, RuleDefinition>> {
        let mut stale = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut pending = rule.depends_on.clone();
        while let Some(dep) = pending.pop() {
            if !seen.insert(dep) {
                continue;
            }
            let definition = self.segmentation.get_rule(dep)?;
            if self.writer.is_current(dep, definition.revision).await? {
                continue;
            }
            pending.extend(definition.depends_on.iter().copied());
            stale.insert(dep, definition);
        }
        Ok(stale)
    }

    /// Whether the rule's live segment answers its current definition.
    async fn has_current_segment(&self, rule_id: RuleId) -> bool {
        let Ok(definition) = self.segmentation.get_rule(rule_id) else {
            return false;
        };
        self.writer
            .is_current(rule_id, definition.revision)
            .await
            .unwrap_or_else(|e| {
                warn!(rule_id, error = %e, "Could not check published segment");
                false
            })
    }

    /// Hand a released job to the workers without waiting on the queue.
    fn dispatch(&self, job_id: Uuid) {
        match self.queue_tx.try_send(job_id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job_id)) => {
                debug!(job_id = %job_id, "Work queue full, dispatching in the background");
                let queue = self.queue_tx.clone();
                tokio::spawn(async move {
                    if queue.send(job_id).await.is_err() {
                        warn!(job_id = %job_id, "Work queue closed");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(job_id)) => {
                warn!(job_id = %job_id, "Work queue closed");
            }
        }
    }

    fn rollback(&self, state: &mut DispatchState, created: &[Uuid]) {
        for job_id in created {
            if let Some((_, job)) = self.jobs.remove(job_id) {
                if state.in_flight.get(&job.rule_id) == Some(job_id) {
                    state.in_flight.remove(&job.rule_id);
                }
            }
            state.gated.remove(job_id);
        }
    }

    // ─── Cancellation ───────────────────────────────────────────────────

    /// Cancel a queued job. Running jobs cannot be preempted.
    pub async fn cancel(&self, job_id: Uuid) -> AudienceResult<MaterializationJob> {
        let rule_id = {
            let mut state = self.state.lock();
            let rule_id = {
                let mut job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or(AudienceError::JobNotFound(job_id))?;
                job.transition(JobState::Cancelled)?;
                job.rule_id
            };
            state.gated.remove(&job_id);
            rule_id
        };
        metrics::counter!("scheduler.jobs_cancelled").increment(1);
        info!(rule_id, job_id = %job_id, "Job cancelled");
        self.notify();
        self.settle(job_id).await;
        self.get_job(job_id)
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub fn get_job(&self, job_id: Uuid) -> AudienceResult<MaterializationJob> {
        self.jobs
            .get(&job_id)
            .map(|j| j.clone())
            .ok_or(AudienceError::JobNotFound(job_id))
    }

    /// Jobs for one rule, newest first.
    pub fn jobs_for_rule(&self, rule_id: RuleId) -> Vec<MaterializationJob> {
        let mut jobs: Vec<MaterializationJob> = self
            .jobs
            .iter()
            .filter(|j| j.rule_id == rule_id)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn in_flight_job(&self, rule_id: RuleId) -> Option<Uuid> {
        self.state.lock().in_flight.get(&rule_id).copied()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Wait until the job is succeeded, failed or cancelled.
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> AudienceResult<MaterializationJob> {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                let job = self.get_job(job_id)?;
                if job.is_terminal() {
                    return Ok(job);
                }
                if changes.changed().await.is_err() {
                    return Err(AudienceError::Internal(anyhow::anyhow!(
                        "scheduler shut down"
                    )));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            AudienceError::Internal(anyhow::anyhow!("timed out waiting for job {job_id}"))
        })?
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    // ─── Schedules ──────────────────────────────────────────────────────

    /// Enqueue every active rule whose schedule is due at `now`.
    ///
    /// A run that finds its rule still in flight is skipped, not queued
    /// behind it; the rule's next run is computed from `now` either way.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TickOutcome> {
        let rules = self.segmentation.list_rules();
        let due: Vec<RuleId> = {
            let mut state = self.state.lock();
            let scheduled: HashMap<RuleId, Schedule> = rules
                .iter()
                .filter(|r| r.is_active())
                .filter_map(|r| r.schedule.map(|s| (r.id, s)))
                .collect();
            state.timers.retain(|id, _| scheduled.contains_key(id));

            let mut due = Vec::new();
            for (&rule_id, &schedule) in &scheduled {
                let timer = state.timers.entry(rule_id).or_insert(ScheduleTimer {
                    schedule,
                    next_run_at: Some(schedule.first_run(now)),
                });
                if timer.schedule != schedule {
                    *timer = ScheduleTimer {
                        schedule,
                        next_run_at: Some(schedule.first_run(now)),
                    };
                }
                if matches!(timer.next_run_at, Some(at) if at <= now) {
                    timer.next_run_at = schedule.next_after(now);
                    due.push(rule_id);
                }
            }
            due.sort_unstable();
            due
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for rule_id in due {
            let outcome = match self.enqueue(rule_id, TriggerKind::Scheduled).await {
                Ok(job_id) => TickOutcome::Enqueued { rule_id, job_id },
                Err(AudienceError::SchedulerBusy { job_id, .. }) => {
                    metrics::counter!("scheduler.runs_skipped").increment(1);
                    debug!(rule_id, job_id = %job_id, "Scheduled run skipped, rule in flight");
                    TickOutcome::Skipped {
                        rule_id,
                        reason: format!("job {job_id} in flight"),
                    }
                }
                Err(e) => {
                    metrics::counter!("scheduler.runs_skipped").increment(1);
                    warn!(rule_id, error = %e, "Scheduled run could not be enqueued");
                    TickOutcome::Skipped {
                        rule_id,
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Next scheduled run of a rule, once the dispatcher has seen it.
    pub fn next_run_at(&self, rule_id: RuleId) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .timers
            .get(&rule_id)
            .and_then(|t| t.next_run_at)
    }

    // ─── Execution ──────────────────────────────────────────────────────

    /// Run one dequeued job to its next resting state. Jobs cancelled while
    /// queued are skipped.
    pub(crate) async fn execute(&self, job_id: Uuid, engine: &dyn BatchEngine) {
        let rule_id = {
            let Some(mut job) = self.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "Dequeued unknown job");
                return;
            };
            if job.state != JobState::Queued {
                debug!(job_id = %job_id, state = job.state.as_str(), "Skipping job no longer queued");
                return;
            }
            if let Err(e) = job.transition(JobState::Running) {
                warn!(job_id = %job_id, error = %e, "Could not start job");
                return;
            }
            info!(rule_id = job.rule_id, job_id = %job_id, attempt = job.attempts, engine = engine.name(), "Job started");
            job.rule_id
        };
        self.notify();

        let started = Instant::now();
        match self.run_attempt(job_id, rule_id, engine).await {
            Ok(row_count) => self.succeed(job_id, rule_id, row_count, started).await,
            Err(failure) => self.fail(job_id, rule_id, failure).await,
        }
    }

    async fn run_attempt(
        &self,
        job_id: Uuid,
        rule_id: RuleId,
        engine: &dyn BatchEngine,
    ) -> Result<u64, BatchFailure> {
        let structural = |e: AudienceError| BatchFailure::structural(e.to_string());
        // Read before planning so a concurrent update can only make the
        // recorded revision older than the table, never newer.
        let revision = self.segmentation.get_rule(rule_id).map_err(structural)?.revision;
        let step = self.segmentation.plan_step(rule_id).map_err(structural)?;
        let sql_query = step.sql.clone();
        let request = BatchRequest {
            job_id,
            rule_id,
            data_source: self.data_source.clone(),
            output_destination: format!(
                "{}/{}/{}.ndjson",
                self.output_dir.trim_end_matches('/'),
                step.output_table,
                job_id.simple()
            ),
            step,
        };

        let handle = engine.submit(request).await?;
        let deadline = Instant::now() + self.job_timeout;
        let rows = loop {
            match engine.poll(&handle).await {
                TaskStatus::Running => {
                    if Instant::now() >= deadline {
                        engine.terminate(&handle).await;
                        return Err(BatchFailure::structural(format!(
                            "batch task {} timed out after {}s",
                            handle.task_id,
                            self.job_timeout.as_secs()
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                TaskStatus::Succeeded(rows) => break rows,
                TaskStatus::Failed(failure) => return Err(failure),
            }
        };

        let entry = self
            .writer
            .publish(PublishRequest {
                rule_id,
                job_id,
                rule_revision: revision,
                sql_query,
                rows,
            })
            .await
            .map_err(structural)?;
        self.segmentation.record_segment_size(rule_id, entry.row_count);
        Ok(entry.row_count)
    }

    async fn succeed(&self, job_id: Uuid, rule_id: RuleId, row_count: u64, started: Instant) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            job.row_count = Some(row_count);
            if let Err(e) = job.transition(JobState::Succeeded) {
                warn!(job_id = %job_id, error = %e, "Could not mark job succeeded");
            }
        }
        metrics::counter!("scheduler.jobs_succeeded").increment(1);
        metrics::histogram!("scheduler.job_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(rule_id, job_id = %job_id, rows = row_count, "Job succeeded");
        self.notify();
        self.settle(job_id).await;
    }

    /// Record a failed attempt. Transient failures with attempts left go
    /// back to the queue after a backoff; everything else is terminal.
    async fn fail(&self, job_id: Uuid, rule_id: RuleId, failure: BatchFailure) {
        let retry_in = {
            let Some(mut job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            job.error = Some(failure.to_string());
            if let Err(e) = job.transition(JobState::Failed) {
                warn!(job_id = %job_id, error = %e, "Could not mark job failed");
                return;
            }
            if failure.is_retryable() && job.attempts_remaining() {
                let delay = self.retry.backoff_for_attempt(job.attempts.saturating_sub(1));
                job.next_attempt_at = Some(
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                );
                job.transition(JobState::Queued).ok().map(|_| (delay, job.attempts))
            } else {
                None
            }
        };

        match retry_in {
            Some((delay, attempts)) => {
                metrics::counter!("scheduler.jobs_retried").increment(1);
                warn!(
                    rule_id,
                    job_id = %job_id,
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Job attempt failed, retrying"
                );
                self.notify();
                let queue = self.queue_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if queue.send(job_id).await.is_err() {
                        warn!(job_id = %job_id, "Work queue closed before retry");
                    }
                });
            }
            None => {
                metrics::counter!("scheduler.jobs_failed").increment(1);
                error!(rule_id, job_id = %job_id, error = %failure, "Job failed");
                self.notify();
                self.settle(job_id).await;
            }
        }
    }

    /// Release the in-flight slot of a job that reached a terminal state and
    /// wake the jobs gated on it. Dependents go ahead when the rule's live
    /// segment answers its current definition, even if this job did not
    /// succeed; otherwise they fail too, and the release cascades.
    async fn settle(&self, job_id: Uuid) {
        let mut pending = vec![job_id];
        while let Some(id) = pending.pop() {
            let Some((rule_id, state)) = self.jobs.get(&id).map(|j| (j.rule_id, j.state)) else {
                continue;
            };
            if !state.is_terminal() {
                continue;
            }

            let has_waiters = {
                let mut dispatch = self.state.lock();
                if dispatch.in_flight.get(&rule_id) == Some(&id) {
                    dispatch.in_flight.remove(&rule_id);
                }
                metrics::gauge!("scheduler.in_flight").set(dispatch.in_flight.len() as f64);
                dispatch.gated.values().any(|deps| deps.contains(&rule_id))
            };
            if !has_waiters {
                continue;
            }
            let servable = self.has_current_segment(rule_id).await;

            let mut ready = Vec::new();
            let mut cascaded = false;
            {
                let mut dispatch = self.state.lock();
                let waiting: Vec<Uuid> = dispatch
                    .gated
                    .iter()
                    .filter(|(_, deps)| deps.contains(&rule_id))
                    .map(|(&gated, _)| gated)
                    .collect();
                for gated in waiting {
                    if servable {
                        let released = dispatch.gated.get_mut(&gated).map_or(false, |deps| {
                            deps.remove(&rule_id);
                            deps.is_empty()
                        });
                        if released {
                            dispatch.gated.remove(&gated);
                            ready.push(gated);
                        }
                    } else {
                        dispatch.gated.remove(&gated);
                        if let Some(mut job) = self.jobs.get_mut(&gated) {
                            job.error = Some(format!(
                                "dependency rule {rule_id} has no segment built from its current definition"
                            ));
                            if job.transition(JobState::Failed).is_ok() {
                                metrics::counter!("scheduler.jobs_failed").increment(1);
                                warn!(rule_id = job.rule_id, job_id = %gated, dependency = rule_id, "Gated job failed with its dependency");
                                pending.push(gated);
                                cascaded = true;
                            }
                        }
                    }
                }
            }
            if cascaded {
                self.notify();
            }

            for gated in ready {
                debug!(job_id = %gated, dependency = rule_id, "Dependencies committed, dispatching");
                self.dispatch(gated);
            }
        }
        self.notify();
    }
}
