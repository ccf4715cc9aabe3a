//! Orchestrator: runs a batch of tasks under a concurrency bound.
//!
//! # Flow
//! 1. plan: resolve the selection, skip done/busy tasks, register `pending` locks
//! 2. admit: one semaphore permit per in-flight task, spawned into a `JoinSet`
//! 3. per task: claim -> (acquire -> merge -> build -> release) with retries
//!    -> append result -> finish lock
//! 4. join everything, tear the batch's environments down, report
//!
//! A task's failure never affects its siblings. A shutdown request stops
//! admission only; tasks already admitted run to completion.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::{
    AttemptId, Claim, ClaimRequest, EnvironmentError, ErrorKind, FailureClass, LockState, LockStatus,
    MergeError, MergeOutcome, MergeStatus, OrchestratorError, ResultRecord, RunId, StoreError,
    Task, TaskKey,
};
use crate::ports::{
    Clock, EnvironmentBackend, EnvironmentRequest, IdGenerator, LockStore, ResultStore, TaskStore,
};

use super::environment::EnvironmentManager;
use super::merge::{MergeReport, MergeSimulator};
use super::retry::{AttemptFailure, Decider, Decision, RetryPolicy};
use super::summary::{BatchReport, SkipReason, Skipped};
use super::verify::{BuildReport, BuildVerifier, DEFAULT_OUTPUT_LIMIT, tail_excerpt};

/// Settings of one orchestrator run.
///
/// Defaults:
/// - `concurrency`: 4 tasks in flight
/// - `max_attempts`: 3 per task (transient faults only)
/// - `retry_policy`: 2s, 4s, 8s, ...
/// - `heartbeat_interval`: 30s
/// - `stale_after`: 10 minutes without heartbeat
/// - `force`: false (tasks with a definitive result are skipped)
/// - `output_limit`: 64 KiB of build output per record
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub force: bool,
    pub output_limit: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_policy: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(10 * 60),
            force: false,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

/// Which tasks a run covers.
///
/// Explicit keys and a glob filter combine as a union. With neither, every
/// stored task is selected.
#[derive(Debug, Clone, Default)]
pub struct TaskSelector {
    keys: Vec<TaskKey>,
    filter: Option<glob::Pattern>,
}

impl TaskSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn keys(keys: impl IntoIterator<Item = TaskKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            filter: None,
        }
    }

    /// Adds a glob over task keys, e.g. `octo_widgets_*`.
    pub fn with_filter(mut self, pattern: &str) -> Result<Self, OrchestratorError> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| OrchestratorError::InvalidFilter {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;
        self.filter = Some(pattern);
        Ok(self)
    }

    /// Selected tasks ordered by key, plus requested keys with no task.
    async fn resolve(&self, store: &dyn TaskStore) -> Result<(Vec<Task>, Vec<TaskKey>), StoreError> {
        if self.keys.is_empty() && self.filter.is_none() {
            return Ok((store.list(&|_: &Task| true).await?, Vec::new()));
        }

        let mut selected = BTreeMap::new();
        let mut missing = Vec::new();
        for key in &self.keys {
            match store.get(key).await {
                Ok(task) => {
                    selected.insert(task.key.clone(), task);
                }
                Err(StoreError::NotFound(_)) => missing.push(key.clone()),
                Err(err) => return Err(err),
            }
        }
        if let Some(pattern) = &self.filter {
            let matches = |task: &Task| pattern.matches(task.key.as_str());
            for task in store.list(&matches).await? {
                selected.insert(task.key.clone(), task);
            }
        }
        missing.sort();
        missing.dedup();
        Ok((selected.into_values().collect(), missing))
    }
}

/// Requests a graceful stop of a running batch. Cloneable; hand it to a
/// signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Stops admitting tasks. In-flight attempts are not cancelled.
    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Completes once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wiring shared by every task of every batch. Built by `OrchestratorBuilder`.
pub(super) struct Shared {
    pub(super) tasks: Arc<dyn TaskStore>,
    pub(super) results: Arc<dyn ResultStore>,
    pub(super) locks: Arc<dyn LockStore>,
    pub(super) backend: Arc<dyn EnvironmentBackend>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) decider: Arc<dyn Decider>,
    pub(super) merge: MergeSimulator,
    pub(super) verifier: BuildVerifier,
    pub(super) config: RunConfig,
    pub(super) stale_after: chrono::Duration,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    shutdown: ShutdownHandle,
}

impl Orchestrator {
    pub(super) fn from_shared(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.shared.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request_shutdown();
    }

    /// Runs every selected task once and reports on all of them.
    ///
    /// Fails only when the selection itself cannot be resolved. Everything
    /// that goes wrong with individual tasks is in the report.
    #[tracing::instrument(name = "batch", skip_all, fields(run = tracing::field::Empty))]
    pub async fn run(&self, selector: &TaskSelector) -> Result<BatchReport, OrchestratorError> {
        let run_id = self.shared.ids.generate_run_id();
        tracing::Span::current().record("run", tracing::field::display(run_id));

        let (runnable, mut skipped) = self.plan(run_id, selector).await?;
        tracing::info!(
            planned = runnable.len(),
            skipped = skipped.len(),
            concurrency = self.shared.config.concurrency,
            backend = self.shared.backend.name(),
            "batch planned"
        );

        let envs = EnvironmentManager::new(Arc::clone(&self.shared.backend));
        let batch = Arc::new(Batch {
            shared: Arc::clone(&self.shared),
            envs: envs.clone(),
            run_id,
            shutdown: self.shutdown.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.shared.config.concurrency));
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut in_flight = JoinSet::new();
        let mut unjoined = BTreeSet::new();

        let mut queue = runnable.into_iter();
        while let Some(task) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown_rx) => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                tracing::info!(not_admitted = queue.len() + 1, "admission stopped");
                skipped.extend(std::iter::once(task).chain(queue.by_ref()).map(|t| Skipped {
                    task_key: t.key,
                    reason: SkipReason::Cancelled,
                }));
                break;
            };

            unjoined.insert(task.key.clone());
            let batch = Arc::clone(&batch);
            in_flight.spawn(async move {
                let end = batch.execute(task).await;
                drop(permit);
                end
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(TaskEnd::Recorded(record)) => {
                    unjoined.remove(&record.task_key);
                    results.push(record);
                }
                Ok(TaskEnd::Skipped(skip)) => {
                    unjoined.remove(&skip.task_key);
                    skipped.push(skip);
                }
                Err(err) => tracing::error!(error = %err, "task execution aborted"),
            }
        }
        // Whatever did not come back panicked; its lock goes stale and is reclaimed later.
        skipped.extend(unjoined.into_iter().map(|task_key| Skipped {
            task_key,
            reason: SkipReason::Error {
                cause: "task execution aborted".to_string(),
            },
        }));

        envs.teardown().await;

        let previous = self.previous_records(&skipped).await;
        let report = BatchReport::new(run_id, results, previous, skipped);
        let s = &report.summary;
        tracing::info!(
            clean_success = s.clean_success,
            conflicted = s.conflicted,
            build_failed = s.build_failed,
            fetch_failed = s.fetch_failed,
            infra_error = s.infra_error,
            skipped = s.skipped,
            "batch finished"
        );
        Ok(report)
    }

    async fn plan(
        &self,
        run_id: RunId,
        selector: &TaskSelector,
    ) -> Result<(Vec<Task>, Vec<Skipped>), OrchestratorError> {
        let (tasks, missing) = selector.resolve(self.shared.tasks.as_ref()).await?;
        let mut skipped: Vec<Skipped> = missing
            .into_iter()
            .map(|task_key| {
                tracing::warn!(task = %task_key, "no such task");
                Skipped {
                    task_key,
                    reason: SkipReason::Missing,
                }
            })
            .collect();

        let now = self.shared.clock.now();
        let mut runnable = Vec::with_capacity(tasks.len());
        for task in tasks {
            let skip = |reason| Skipped {
                task_key: task.key.clone(),
                reason,
            };
            match self.shared.locks.load(&task.key).await {
                Ok(Some(lock)) if lock.status == LockStatus::Done && !self.shared.config.force => {
                    tracing::debug!(task = %task.key, "already done");
                    skipped.push(skip(SkipReason::Done));
                }
                Ok(Some(lock))
                    if lock.status == LockStatus::Running
                        && lock.owner != run_id
                        && !lock.is_stale(now, self.shared.stale_after) =>
                {
                    tracing::info!(task = %task.key, owner = %lock.owner, "held by another run");
                    skipped.push(skip(SkipReason::Busy { owner: lock.owner }));
                }
                Ok(Some(lock)) => {
                    if lock.is_stale(now, self.shared.stale_after) {
                        tracing::info!(
                            task = %task.key,
                            previous_owner = %lock.owner,
                            heartbeat = %lock.updated_at,
                            "reclaiming stale lock"
                        );
                        if !self.shared.config.force {
                            match self.settle_recorded(run_id, &lock).await {
                                Ok(None) => {}
                                Ok(Some(reason)) => {
                                    skipped.push(skip(reason));
                                    continue;
                                }
                                Err(err) => {
                                    tracing::error!(task = %task.key, error = %err, "cannot settle stale lock");
                                    skipped.push(skip(SkipReason::Error {
                                        cause: err.to_string(),
                                    }));
                                    continue;
                                }
                            }
                        }
                    }
                    runnable.push(task);
                }
                Ok(None) => match self.shared.locks.register_pending(&task.key, run_id, now).await {
                    Ok(()) => runnable.push(task),
                    Err(err) => skipped.push(skip(SkipReason::Error {
                        cause: err.to_string(),
                    })),
                },
                Err(err) => {
                    tracing::error!(task = %task.key, error = %err, "cannot read lock");
                    skipped.push(skip(SkipReason::Error {
                        cause: err.to_string(),
                    }));
                }
            }
        }
        Ok((runnable, skipped))
    }

    /// Settles a stale lock whose owner recorded a result and died before
    /// finishing the lock. `None` when the owner recorded nothing.
    async fn settle_recorded(&self, run_id: RunId, lock: &LockState) -> Result<Option<SkipReason>, StoreError> {
        let records = self.shared.results.list(&lock.task_key).await?;
        let Some(record) = records.into_iter().rev().find(|r| {
            r.run_id == lock.owner && lock.attempt_id.map_or(true, |id| id == r.attempt_id)
        }) else {
            return Ok(None);
        };

        let now = self.shared.clock.now();
        let claim = ClaimRequest {
            owner: run_id,
            now,
            stale_after: self.shared.stale_after,
            force: false,
        };
        match self.shared.locks.try_claim(&lock.task_key, claim).await? {
            Claim::Acquired(_) => {}
            Claim::AlreadyDone => return Ok(Some(SkipReason::Done)),
            Claim::Busy { owner } => return Ok(Some(SkipReason::Busy { owner })),
        }
        let status = if record.is_definitive() {
            LockStatus::Done
        } else {
            LockStatus::Failed
        };
        self.shared.locks.finish(&lock.task_key, run_id, status, now).await?;
        tracing::info!(
            task = %lock.task_key,
            previous_owner = %lock.owner,
            attempt_id = %record.attempt_id,
            ?status,
            "result already recorded; lock settled"
        );
        Ok(Some(SkipReason::Recorded { run_id: lock.owner }))
    }

    /// Latest records of tasks skipped because an earlier run recorded them.
    async fn previous_records(&self, skipped: &[Skipped]) -> Vec<ResultRecord> {
        let mut previous = Vec::new();
        for skip in skipped.iter().filter(|s| s.reason.settled_earlier()) {
            match self.shared.results.latest(&skip.task_key).await {
                Ok(Some(record)) => previous.push(record),
                Ok(None) => tracing::warn!(task = %skip.task_key, "done without a recorded result"),
                Err(err) => tracing::error!(task = %skip.task_key, error = %err, "cannot read result"),
            }
        }
        previous
    }
}

enum TaskEnd {
    Recorded(ResultRecord),
    Skipped(Skipped),
}

/// A fault that ended one attempt without a verdict.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The merge concluded but the build could not be run.
    #[error("build could not run: {source}")]
    Build {
        outcome: MergeOutcome,
        #[source]
        source: EnvironmentError,
    },
}

impl AttemptError {
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Environment(err) | AttemptError::Build { source: err, .. } => err.kind(),
            AttemptError::Merge(err) => err.kind(),
        }
    }

    fn failure_class(&self) -> FailureClass {
        match self {
            AttemptError::Environment(_) | AttemptError::Build { .. } => FailureClass::Environment,
            AttemptError::Merge(err) => err.failure_class(),
        }
    }

    /// Merge status recorded when this is the last attempt.
    fn terminal_status(&self) -> MergeStatus {
        match self {
            AttemptError::Merge(MergeError::Network { .. }) => MergeStatus::FetchFailed,
            AttemptError::Build { outcome, .. } => (*outcome).into(),
            AttemptError::Environment(_) | AttemptError::Merge(_) => MergeStatus::InfraError,
        }
    }
}

struct AttemptReport {
    merge: MergeReport,
    build: Option<BuildReport>,
}

/// Bookkeeping of one attempt, shared by every record it can produce.
struct AttemptMeta {
    id: AttemptId,
    number: u32,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
    elapsed: Duration,
}

/// One batch in flight: wiring plus the batch-scoped environment manager.
struct Batch {
    shared: Arc<Shared>,
    envs: EnvironmentManager,
    run_id: RunId,
    shutdown: ShutdownHandle,
}

impl Batch {
    #[tracing::instrument(name = "task", skip_all, fields(task = %task.key))]
    async fn execute(&self, task: Task) -> TaskEnd {
        let skipped = |reason| {
            TaskEnd::Skipped(Skipped {
                task_key: task.key.clone(),
                reason,
            })
        };

        let claim = ClaimRequest {
            owner: self.run_id,
            now: self.shared.clock.now(),
            stale_after: self.shared.stale_after,
            force: self.shared.config.force,
        };
        match self.shared.locks.try_claim(&task.key, claim).await {
            Ok(Claim::Acquired(_)) => {}
            Ok(Claim::AlreadyDone) => return skipped(SkipReason::Done),
            Ok(Claim::Busy { owner }) => return skipped(SkipReason::Busy { owner }),
            Err(err) => {
                tracing::error!(error = %err, "claim failed");
                return skipped(SkipReason::Error {
                    cause: err.to_string(),
                });
            }
        }

        let (record, status) = self.attempts(&task).await;

        if let Err(err) = self.shared.results.append(&record).await {
            tracing::error!(error = %err, "cannot record result");
            self.finish_lock(&task.key, LockStatus::Failed).await;
            return skipped(SkipReason::Error {
                cause: err.to_string(),
            });
        }
        self.finish_lock(&task.key, status).await;
        tracing::info!(
            merge = ?record.merge_outcome,
            build_success = ?record.build_success,
            attempts = record.attempt_number,
            "task finished"
        );
        TaskEnd::Recorded(record)
    }

    /// Runs attempts until one produces a verdict or retrying stops.
    async fn attempts(&self, task: &Task) -> (ResultRecord, LockStatus) {
        let mut number = 1;
        loop {
            let id = self.shared.ids.generate_attempt_id();
            let started_at = self.shared.clock.now();
            let started = Instant::now();
            let outcome = self
                .with_heartbeat(&task.key, id, self.attempt_once(task, id))
                .await;
            let meta = AttemptMeta {
                id,
                number,
                started_at,
                finished_at: self.shared.clock.now(),
                elapsed: started.elapsed(),
            };

            let err = match outcome {
                Ok(report) => return (self.verdict_record(task, &meta, report), LockStatus::Done),
                Err(err) => err,
            };

            let cause = err.to_string();
            let decision = self.shared.decider.decide(&AttemptFailure {
                attempt: number,
                kind: err.kind(),
                cause: &cause,
            });
            match decision {
                Decision::Retry { delay, reason } if !self.shutdown.is_requested() => {
                    tracing::warn!(attempt = number, attempt_id = %id, error = %cause, %reason, "attempt failed");
                    if self.backoff(delay).await {
                        number += 1;
                        continue;
                    }
                    tracing::info!("shutdown during backoff; not retrying");
                }
                Decision::Retry { .. } => tracing::info!("shutdown requested; not retrying"),
                Decision::GiveUp { reason } => {
                    tracing::warn!(attempt = number, attempt_id = %id, error = %cause, %reason, "giving up");
                }
            }
            return (self.fault_record(task, &meta, &err, cause), LockStatus::Failed);
        }
    }

    /// Sleeps for `delay`. False when interrupted by a shutdown request.
    async fn backoff(&self, delay: Duration) -> bool {
        let mut rx = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_requested(&mut rx) => false,
        }
    }

    async fn attempt_once(&self, task: &Task, attempt_id: AttemptId) -> Result<AttemptReport, AttemptError> {
        let instance_id = format!("mergecheck-{}", attempt_id.as_ulid()).to_lowercase();
        let request = EnvironmentRequest {
            label: task.key.to_string(),
            image: task.image.clone(),
            limits: task.limits,
            network: task.network,
        };
        let guard = self.envs.acquire(&instance_id, &request).await?;
        let result = self.drive(guard.env(), task).await;
        guard.release().await;
        result
    }

    async fn drive(
        &self,
        env: &crate::ports::Environment,
        task: &Task,
    ) -> Result<AttemptReport, AttemptError> {
        let started = Instant::now();
        let budgets = task.limits.phase_budgets();

        let merge = self
            .shared
            .merge
            .simulate(&self.envs, env, task, budgets.merge)
            .await?;
        if !merge.outcome.proceeds_to_build() {
            return Ok(AttemptReport { merge, build: None });
        }

        // unused merge time carries over to the build
        let remaining = task.limits.total_timeout().saturating_sub(started.elapsed());
        let build = self
            .shared
            .verifier
            .verify(&self.envs, env, &task.build_command, remaining)
            .await
            .map_err(|source| AttemptError::Build {
                outcome: merge.outcome,
                source,
            })?;
        Ok(AttemptReport {
            merge,
            build: Some(build),
        })
    }

    /// Drives `work` while refreshing the lock every heartbeat interval.
    async fn with_heartbeat<F: Future>(&self, key: &TaskKey, attempt_id: AttemptId, work: F) -> F::Output {
        self.heartbeat(key, Some(attempt_id)).await;

        let period = self.shared.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => self.heartbeat(key, None).await,
            }
        }
    }

    async fn heartbeat(&self, key: &TaskKey, attempt_id: Option<AttemptId>) {
        let now = self.shared.clock.now();
        if let Err(err) = self.shared.locks.heartbeat(key, self.run_id, attempt_id, now).await {
            tracing::warn!(error = %err, "heartbeat failed");
        }
    }

    async fn finish_lock(&self, key: &TaskKey, status: LockStatus) {
        let now = self.shared.clock.now();
        if let Err(err) = self.shared.locks.finish(key, self.run_id, status, now).await {
            tracing::error!(error = %err, ?status, "cannot finish lock");
        }
    }

    fn base_record(&self, task: &Task, meta: &AttemptMeta, merge_outcome: MergeStatus) -> ResultRecord {
        ResultRecord {
            task_key: task.key.clone(),
            run_id: self.run_id,
            attempt_id: meta.id,
            attempt_number: meta.number,
            merge_outcome,
            build_success: None,
            exit_code: None,
            output_excerpt: String::new(),
            duration_sec: meta.elapsed.as_secs_f64(),
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            failure_class: None,
            failure_cause: None,
        }
    }

    fn verdict_record(&self, task: &Task, meta: &AttemptMeta, report: AttemptReport) -> ResultRecord {
        let AttemptReport { merge, build } = report;
        let mut record = self.base_record(task, meta, merge.outcome.into());
        match build {
            Some(build) => {
                record.build_success = Some(build.success);
                record.exit_code = build.exit_code;
                record.output_excerpt = build.output;
                let mut causes = Vec::new();
                if build.timed_out {
                    record.failure_class = Some(FailureClass::Timeout);
                    causes.push("build exceeded its time budget".to_string());
                }
                if !merge.conflicts.is_empty() {
                    causes.push(format!("unmerged paths: {}", merge.conflicts.join(", ")));
                }
                if !causes.is_empty() {
                    record.failure_cause = Some(causes.join("; "));
                }
            }
            None => {
                record.output_excerpt = tail_excerpt(&merge.log, self.shared.verifier.output_limit());
                record.failure_class = Some(FailureClass::Fetch);
                record.failure_cause = merge.detail;
            }
        }
        record
    }

    fn fault_record(
        &self,
        task: &Task,
        meta: &AttemptMeta,
        err: &AttemptError,
        cause: String,
    ) -> ResultRecord {
        let mut record = self.base_record(task, meta, err.terminal_status());
        record.failure_class = Some(err.failure_class());
        record.failure_cause = Some(cause);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    use crate::app::builder::OrchestratorBuilder;
    use crate::domain::{GitRef, ImageSpec, LockState, NetworkPolicy, ResourceLimits};
    use crate::impls::{InMemoryStore, Reply, ScriptedBackend, StartFault};
    use crate::ports::FixedClock;

    fn task(key: &str) -> Task {
        Task {
            key: TaskKey::new(key),
            repo_url: format!("https://example.invalid/{key}.git"),
            source_repo_url: None,
            target: GitRef::new("main", "aaaaaaa"),
            source: GitRef::new("feature", "bbbbbbb"),
            build_command: format!("make {key}"),
            image: ImageSpec::new("debian:bookworm"),
            limits: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            project_type: None,
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            concurrency: 2,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
            },
            ..Default::default()
        }
    }

    async fn seeded(keys: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::new();
        for key in keys {
            TaskStore::put(&store, &task(key)).await.unwrap();
        }
        store
    }

    fn orchestrator(store: &InMemoryStore, backend: Arc<ScriptedBackend>, config: RunConfig) -> Orchestrator {
        OrchestratorBuilder::new()
            .stores(Arc::new(store.clone()))
            .backend(backend)
            .config(config)
            .build()
            .unwrap()
    }

    fn key(raw: &str) -> TaskKey {
        TaskKey::new(raw)
    }

    #[tokio::test]
    async fn clean_batch_records_one_result_per_task() {
        let store = seeded(&["t1", "t2", "t3"]).await;
        let backend = Arc::new(ScriptedBackend::new());
        let report = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 3);
        assert!(report.summary.is_clean());
        assert!(report.results.iter().all(|r| r.attempt_number == 1));
        for k in ["t1", "t2", "t3"] {
            assert_eq!(ResultStore::list(&store, &key(k)).await.unwrap().len(), 1);
            let lock = store.load(&key(k)).await.unwrap().unwrap();
            assert_eq!(lock.status, LockStatus::Done);
        }
        assert_eq!(backend.live_instances(), 0);
    }

    #[tokio::test]
    async fn in_flight_attempts_never_exceed_concurrency() {
        let keys = ["t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8"];
        let store = seeded(&keys).await;
        let backend = Arc::new(ScriptedBackend::new().on("make", Reply::exit(0).after(Duration::from_millis(30))));

        let report = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(report.summary.clean_success, keys.len());
        assert!(store.max_running().await <= 2);
        assert!(store.max_running().await >= 1);
        assert!(backend.max_live_instances() <= 2);
        assert_eq!(backend.started_instances(), keys.len());
        assert_eq!(store.running_count().await, 0);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let store = seeded(&["t1", "t2", "t3", "t4"]).await;
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("make t2", Reply::exit(1).stderr("compile error"))
                .on(
                    "t3.git",
                    Reply::exit(128).stderr("fatal: Remote branch main not found in upstream origin"),
                ),
        );

        let report = orchestrator(&store, backend, config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let t2 = report.result_for(&key("t2")).unwrap();
        assert_eq!(t2.merge_outcome, MergeStatus::Clean);
        assert_eq!(t2.build_success, Some(false));
        assert_eq!(t2.exit_code, Some(1));

        let t3 = report.result_for(&key("t3")).unwrap();
        assert_eq!(t3.merge_outcome, MergeStatus::FetchFailed);
        assert_eq!(t3.build_success, None);
        assert_eq!(t3.failure_class, Some(FailureClass::Fetch));

        assert!(report.result_for(&key("t1")).unwrap().is_clean_success());
        assert!(report.result_for(&key("t4")).unwrap().is_clean_success());
        assert_eq!(report.summary.clean_success, 2);
        assert!(!report.summary.is_clean());
    }

    #[tokio::test]
    async fn conflicts_still_build() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("merge --no-commit", Reply::exit(1).stdout("CONFLICT (content)"))
                .on("--diff-filter=U", Reply::exit(0).stdout("src/lib.rs\n")),
        );

        let report = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let record = &report.results[0];
        assert_eq!(record.merge_outcome, MergeStatus::Conflicted);
        assert_eq!(record.build_success, Some(true));
        assert_eq!(record.failure_cause.as_deref(), Some("unmerged paths: src/lib.rs"));
        assert_eq!(report.summary.conflicted, 1);
        assert!(backend.history().iter().any(|(_, cmd)| cmd == "make t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn conflicted_build_timeout_keeps_both_causes() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("merge --no-commit", Reply::exit(1).stdout("CONFLICT (content)"))
                .on("--diff-filter=U", Reply::exit(0).stdout("src/lib.rs\n"))
                .on("make t1", Reply::exit(0).after(Duration::from_secs(3600))),
        );

        let report = orchestrator(&store, backend, config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let record = &report.results[0];
        assert_eq!(record.merge_outcome, MergeStatus::Conflicted);
        assert_eq!(record.build_success, Some(false));
        assert_eq!(record.failure_class, Some(FailureClass::Timeout));
        assert_eq!(
            record.failure_cause.as_deref(),
            Some("build exceeded its time budget; unmerged paths: src/lib.rs")
        );
    }

    #[tokio::test]
    async fn transient_start_failures_are_retried() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(ScriptedBackend::new().fail_starts([StartFault::Refuse]));

        let report = orchestrator(&store, backend, config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let record = &report.results[0];
        assert!(record.is_clean_success());
        assert_eq!(record.attempt_number, 2);
        assert_eq!(ResultStore::list(&store, &key("t1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_produce_one_infra_error() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(ScriptedBackend::new().fail_starts([
            StartFault::Refuse,
            StartFault::FailAfterCreate,
            StartFault::Refuse,
        ]));

        let report = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let records = ResultStore::list(&store, &key("t1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merge_outcome, MergeStatus::InfraError);
        assert_eq!(records[0].attempt_number, 3);
        assert_eq!(records[0].failure_class, Some(FailureClass::Environment));
        assert_eq!(report.summary.infra_error, 1);
        assert_eq!(backend.live_instances(), 0);

        let lock = store.load(&key("t1")).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Failed);
    }

    #[tokio::test]
    async fn network_faults_end_as_fetch_failed_after_retries() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(ScriptedBackend::new().on(
            "git clone",
            Reply::exit(128).stderr("fatal: unable to access: Could not resolve host: example.invalid"),
        ));

        let report = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        let record = &report.results[0];
        assert_eq!(record.merge_outcome, MergeStatus::FetchFailed);
        assert_eq!(record.failure_class, Some(FailureClass::Network));
        assert_eq!(record.attempt_number, 3);
        assert_eq!(backend.started_instances(), 3);
    }

    #[tokio::test]
    async fn deterministic_outcomes_are_not_retried() {
        let store = seeded(&["t1", "t2"]).await;
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("make t1", Reply::exit(2))
                .on(
                    "t2.git",
                    Reply::exit(128).stderr("fatal: couldn't find remote ref refs/heads/main"),
                ),
        );

        orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(backend.started_instances(), 2);
    }

    #[tokio::test]
    async fn done_tasks_are_skipped_unless_forced() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(ScriptedBackend::new());

        orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();
        let second = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();
        assert_eq!(second.skip_reason(&key("t1")), Some(&SkipReason::Done));
        assert!(second.results.is_empty());

        let forced = orchestrator(&store, backend, RunConfig { force: true, ..config() })
            .run(&TaskSelector::all())
            .await
            .unwrap();
        assert_eq!(forced.results.len(), 1);
        assert_eq!(ResultStore::list(&store, &key("t1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rerun_of_a_clean_batch_is_clean() {
        let store = seeded(&["t1", "t2"]).await;
        let backend = Arc::new(ScriptedBackend::new());

        let first = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();
        let second = orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert!(first.summary.is_clean());
        assert!(second.results.is_empty());
        assert_eq!(second.previous.len(), 2);
        assert_eq!(second.summary.clean_success, 2);
        assert_eq!(second.summary.skipped, 0);
        assert!(second.summary.is_clean());
        assert_eq!(backend.started_instances(), 2);
    }

    #[tokio::test]
    async fn rerun_keeps_earlier_failures_failing() {
        let store = seeded(&["t1"]).await;
        let backend = Arc::new(ScriptedBackend::new().on("make t1", Reply::exit(1)));

        orchestrator(&store, backend.clone(), config())
            .run(&TaskSelector::all())
            .await
            .unwrap();
        let second = orchestrator(&store, backend, config())
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(second.skip_reason(&key("t1")), Some(&SkipReason::Done));
        assert_eq!(second.summary.build_failed, 1);
        assert!(!second.summary.is_clean());
    }

    fn crashed_record(task_key: &str, owner: RunId, at: chrono::DateTime<Utc>, merge: MergeStatus) -> ResultRecord {
        ResultRecord {
            task_key: key(task_key),
            run_id: owner,
            attempt_id: AttemptId::from_ulid(Ulid::new()),
            attempt_number: 1,
            merge_outcome: merge,
            build_success: (merge == MergeStatus::Clean).then_some(true),
            exit_code: None,
            output_excerpt: String::new(),
            duration_sec: 1.0,
            started_at: at,
            finished_at: at,
            failure_class: (merge == MergeStatus::InfraError).then_some(FailureClass::Environment),
            failure_cause: None,
        }
    }

    #[rstest::rstest]
    #[case::verdict(MergeStatus::Clean, LockStatus::Done)]
    #[case::fault(MergeStatus::InfraError, LockStatus::Failed)]
    #[tokio::test]
    async fn crash_after_recording_is_not_run_again(#[case] merge: MergeStatus, #[case] settled: LockStatus) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0 + chrono::Duration::hours(1)));
        let store = seeded(&["t1"]).await;
        let crashed = RunId::from_ulid(Ulid::new());
        let record = crashed_record("t1", crashed, t0, merge);
        store.append(&record).await.unwrap();
        store
            .insert_lock(LockState {
                task_key: key("t1"),
                status: LockStatus::Running,
                owner: crashed,
                attempt_id: Some(record.attempt_id),
                updated_at: t0,
            })
            .await;

        let backend = Arc::new(ScriptedBackend::new());
        let report = OrchestratorBuilder::new()
            .stores(Arc::new(store.clone()))
            .backend(backend.clone())
            .clock(clock)
            .config(config())
            .build()
            .unwrap()
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(ResultStore::list(&store, &key("t1")).await.unwrap(), vec![record.clone()]);
        assert_eq!(
            report.skip_reason(&key("t1")),
            Some(&SkipReason::Recorded { run_id: crashed })
        );
        assert_eq!(report.previous, vec![record]);
        assert_eq!(report.summary.is_clean(), merge == MergeStatus::Clean);
        assert_eq!(backend.started_instances(), 0);
        assert_eq!(store.load(&key("t1")).await.unwrap().unwrap().status, settled);
    }

    #[tokio::test]
    async fn stale_lock_with_a_foreign_record_is_run_again() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0 + chrono::Duration::hours(1)));
        let store = seeded(&["t1"]).await;
        let earlier = RunId::from_ulid(Ulid::new());
        let crashed = RunId::from_ulid(Ulid::new());
        store
            .append(&crashed_record("t1", earlier, t0, MergeStatus::InfraError))
            .await
            .unwrap();
        store
            .insert_lock(LockState {
                task_key: key("t1"),
                status: LockStatus::Running,
                owner: crashed,
                attempt_id: None,
                updated_at: t0,
            })
            .await;

        let report = OrchestratorBuilder::new()
            .stores(Arc::new(store.clone()))
            .backend(Arc::new(ScriptedBackend::new()))
            .clock(clock)
            .config(config())
            .build()
            .unwrap()
            .run(&TaskSelector::all())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(ResultStore::list(&store, &key("t1")).await.unwrap().len(), 2);
        assert_eq!(store.load(&key("t1")).await.unwrap().unwrap().status, LockStatus::Done);
    }

    #[tokio::test]
    async fn stale_locks_are_resumed_and_live_ones_left_alone() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0 + chrono::Duration::hours(1)));
        let store = seeded(&["stale", "live"]).await;
        let crashed = RunId::from_ulid(Ulid::new());
        store
            .insert_lock(LockState {
                task_key: key("stale"),
                status: LockStatus::Running,
                owner: crashed,
                attempt_id: None,
                updated_at: t0,
            })
            .await;
        store
            .insert_lock(LockState {
                task_key: key("live"),
                status: LockStatus::Running,
                owner: crashed,
                attempt_id: None,
                updated_at: t0 + chrono::Duration::minutes(59),
            })
            .await;

        let orchestrator = OrchestratorBuilder::new()
            .stores(Arc::new(store.clone()))
            .backend(Arc::new(ScriptedBackend::new()))
            .clock(clock)
            .config(config())
            .build()
            .unwrap();
        let report = orchestrator.run(&TaskSelector::all()).await.unwrap();

        assert_eq!(ResultStore::list(&store, &key("stale")).await.unwrap().len(), 1);
        assert_eq!(
            report.skip_reason(&key("live")),
            Some(&SkipReason::Busy { owner: crashed })
        );
        assert!(ResultStore::list(&store, &key("live")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn selection_reports_missing_keys() {
        let store = seeded(&["octo_a_1", "octo_a_2", "other_b_1"]).await;
        let selector = TaskSelector::keys([key("other_b_1"), key("nope_x_9")])
            .with_filter("octo_*")
            .unwrap();

        let report = orchestrator(&store, Arc::new(ScriptedBackend::new()), config())
            .run(&selector)
            .await
            .unwrap();

        let mut ran: Vec<_> = report.results.iter().map(|r| r.task_key.to_string()).collect();
        ran.sort();
        assert_eq!(ran, vec!["octo_a_1", "octo_a_2", "other_b_1"]);
        assert_eq!(report.skip_reason(&key("nope_x_9")), Some(&SkipReason::Missing));
        assert!(!report.summary.is_clean());
    }

    #[test]
    fn invalid_filters_are_rejected() {
        assert!(matches!(
            TaskSelector::all().with_filter("[oops"),
            Err(OrchestratorError::InvalidFilter { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_before_admission_cancels_everything() {
        let store = seeded(&["t1", "t2"]).await;
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = orchestrator(&store, backend.clone(), config());
        orchestrator.request_shutdown();

        let report = orchestrator.run(&TaskSelector::all()).await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.skip_reason(&key("t1")), Some(&SkipReason::Cancelled));
        assert_eq!(report.skip_reason(&key("t2")), Some(&SkipReason::Cancelled));
        assert_eq!(backend.started_instances(), 0);
        let lock = store.load(&key("t1")).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_tasks_finish() {
        let store = seeded(&["t1", "t2", "t3"]).await;
        let backend = Arc::new(ScriptedBackend::new().on("make", Reply::exit(0).after(Duration::from_millis(200))));
        let orchestrator = orchestrator(&store, backend.clone(), RunConfig { concurrency: 1, ..config() });

        let handle = orchestrator.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.request_shutdown();
        });
        let report = orchestrator.run(&TaskSelector::all()).await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].is_clean_success());
        assert_eq!(report.summary.skipped, 2);
        assert_eq!(backend.live_instances(), 0);
    }
}
