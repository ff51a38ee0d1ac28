//! Map-job orchestration.
//!
//! [`JobRuntime`] owns the whole lifecycle: it creates the action
//! record, plans shards, enqueues one scan task per shard, executes
//! deliveries as the queue's consumer, and chains the map phase into a
//! finalize callback that runs exactly once.
//!
//! Phase machine: `Planning -> Scanning -> Finalizing -> Done`, with
//! `Failed` reachable from any non-terminal phase. Every transition is
//! a transactional read-modify-write on the action record; the
//! Scanning -> Finalizing edge is taken by whichever shard's completion
//! decrements the outstanding-shard counter to zero, so concurrent
//! completion notifications elect a single finalizer.


use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{
    ActionKind, ActionRecord, ActionStatus, DiscrepancyLog, JobPhase, logs_for,
};
use crate::config::ReconcilerConfig;
use crate::derive::MarkerKeyDeriver;
use crate::marker::MARKER_KIND;
use crate::plan::{PlanError, plan_shards};
use crate::queue::{LocalTaskQueue, QueueError, ShardTask, TaskExecutor, TaskQueue};
use crate::reconcile::{CheckRepairHandler, CleanHandler};
use crate::scan::{EntityHandler, ScanCursor, ScanParams, run_shard};
use crate::store::{EntityStore, StoreError};

/// Polling interval for [`JobRuntime::wait`].
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Caller-supplied finalize callback, run exactly once when all shards
/// have completed.
pub type Finalizer = Box<dyn FnOnce() + Send>;

/// Orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// Store failure outside planning.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Domain partitioning failed; the job is failed with no shards
    /// dispatched.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The task queue refused the work.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// No action record exists for the id.
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),

    /// The model has no configured unique constraints.
    #[error("model '{0}' is not configured")]
    UnknownModel(String),

    /// [`JobRuntime::wait`] gave up before the job reached a terminal
    /// phase.
    #[error("timed out waiting for job {0}")]
    WaitTimeout(Uuid),
}

/// Caller-visible snapshot of one job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Job id.
    pub id: Uuid,

    /// Check, repair, or clean.
    pub kind: ActionKind,

    /// Target model.
    pub model: String,

    /// Current phase.
    pub phase: JobPhase,

    /// Derived status.
    pub status: ActionStatus,

    /// Discrepancy logs recorded so far (capped).
    pub log_count: u64,

    /// The log entries themselves.
    pub logs: Vec<DiscrepancyLog>,
}

/// The orchestrator. One runtime serves many jobs; shard workers share
/// no in-process mutable state with each other — coordination happens
/// through the store.
pub struct JobRuntime {
    store: Arc<dyn EntityStore>,
    deriver: Arc<dyn MarkerKeyDeriver>,
    config: ReconcilerConfig,
    queue: OnceLock<Arc<dyn TaskQueue>>,
    finalizers: Mutex<HashMap<Uuid, Finalizer>>,
}

impl JobRuntime {
    /// Start a runtime with its own local task queue.
    #[must_use]
    pub fn start(
        store: Arc<dyn EntityStore>,
        deriver: Arc<dyn MarkerKeyDeriver>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        let runtime = Arc::new(Self {
            store,
            deriver,
            config,
            queue: OnceLock::new(),
            finalizers: Mutex::new(HashMap::new()),
        });
        let weak: Weak<Self> = Arc::downgrade(&runtime);
        let executor: Weak<dyn TaskExecutor> = weak;
        let queue = LocalTaskQueue::start(
            executor,
            runtime.config.workers,
            runtime.config.task_retry.clone(),
        );
        let _ = runtime.queue.set(Arc::new(queue));
        runtime
    }

    /// Submit a job. Explicit call site — nothing starts implicitly on
    /// record creation.
    ///
    /// # Errors
    ///
    /// Fails on unknown models, planning failure (the job record is
    /// left in `Failed`), or store/queue errors.
    pub fn submit(&self, kind: ActionKind, model: &str) -> Result<Uuid, JobError> {
        self.submit_with_finalizer(kind, model, None)
    }

    /// Submit a job with a finalize callback, run exactly once after
    /// every shard completes (immediately, for an empty domain).
    ///
    /// # Errors
    ///
    /// See [`Self::submit`].
    pub fn submit_with_finalizer(
        &self,
        kind: ActionKind,
        model: &str,
        finalizer: Option<Finalizer>,
    ) -> Result<Uuid, JobError> {
        if self.config.model(model).is_none() {
            return Err(JobError::UnknownModel(model.to_string()));
        }

        let action = ActionRecord::new(kind, model, &self.config.alias);
        let job_id = action.id;
        self.store.put_many(&[action.to_entity()?])?;
        if let Some(finalizer) = finalizer {
            self.lock_finalizers().insert(job_id, finalizer);
        }
        info!(job = %job_id, kind = %kind, model, "job submitted");

        let scan_kind = match kind {
            ActionKind::Clean => MARKER_KIND,
            ActionKind::Check | ActionKind::Repair => model,
        };
        let shards = match plan_shards(self.store.as_ref(), scan_kind, self.config.shard_count) {
            Ok(shards) => shards,
            Err(err) => {
                warn!(job = %job_id, error = %err, "planning failed, job failed");
                self.lock_finalizers().remove(&job_id);
                self.update(job_id, &mut |a| a.phase = JobPhase::Failed)?;
                return Err(err.into());
            }
        };

        if shards.is_empty() {
            debug!(job = %job_id, "empty domain, finalizing immediately");
            self.update(job_id, &mut |a| a.phase = JobPhase::Finalizing)?;
            self.finish(job_id)?;
            return Ok(job_id);
        }

        let shard_count = u32::try_from(shards.len()).unwrap_or(u32::MAX);
        self.update(job_id, &mut |a| {
            a.phase = JobPhase::Scanning;
            a.shards_remaining = shard_count;
        })?;

        let queue = self.queue.get().ok_or(JobError::Queue(QueueError::Closed))?;
        for shard in shards {
            queue.enqueue(ShardTask {
                action_id: job_id,
                kind,
                model: model.to_string(),
                alias: self.config.alias.clone(),
                shard,
            })?;
        }
        Ok(job_id)
    }

    /// Fetch a job's status and logs.
    ///
    /// # Errors
    ///
    /// [`JobError::UnknownJob`] if no record exists; store failures
    /// otherwise.
    pub fn status(&self, job_id: Uuid) -> Result<JobStatus, JobError> {
        let found = self.store.get_many(&[ActionRecord::key(job_id)])?;
        let Some(entity) = &found[0] else {
            return Err(JobError::UnknownJob(job_id));
        };
        let action = ActionRecord::from_entity(entity)?;
        let logs = logs_for(self.store.as_ref(), job_id)?;
        let status = action.status();
        Ok(JobStatus {
            id: job_id,
            kind: action.kind,
            model: action.model,
            phase: action.phase,
            status,
            log_count: action.log_count,
            logs,
        })
    }

    /// Block until the job reaches a terminal phase.
    ///
    /// # Errors
    ///
    /// [`JobError::WaitTimeout`] if the deadline passes first.
    pub fn wait(&self, job_id: Uuid, timeout: Duration) -> Result<JobStatus, JobError> {
        let start = Instant::now();
        loop {
            let status = self.status(job_id)?;
            if status.phase.is_terminal() {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                return Err(JobError::WaitTimeout(job_id));
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn lock_finalizers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Finalizer>> {
        // A poisoned finalizer map only loses callbacks, never data.
        self.finalizers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Transactional read-modify-write of one action record.
    fn update(
        &self,
        job_id: Uuid,
        mutate: &mut dyn FnMut(&mut ActionRecord),
    ) -> Result<(), StoreError> {
        self.store.transact(&mut |txn| {
            let key = ActionRecord::key(job_id);
            let Some(entity) = txn.get(&key)? else {
                return Err(StoreError::NotFound { key: key.encode() });
            };
            let mut action = ActionRecord::from_entity(&entity)?;
            mutate(&mut action);
            txn.put(action.to_entity()?)
        })
    }

    /// Decrement the outstanding-shard counter; the single caller that
    /// takes it to zero wins the Finalizing transition and runs the
    /// finalize step.
    fn complete_shard(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut won_finalize = false;
        self.update(job_id, &mut |action| {
            won_finalize = false;
            if action.phase != JobPhase::Scanning {
                return;
            }
            action.shards_remaining = action.shards_remaining.saturating_sub(1);
            if action.shards_remaining == 0 {
                action.phase = JobPhase::Finalizing;
                won_finalize = true;
            }
        })?;
        if won_finalize {
            self.finish(job_id)?;
        }
        Ok(())
    }

    /// Run the finalize callback (at most once — the registry entry is
    /// consumed) and flip the record to done.
    fn finish(&self, job_id: Uuid) -> Result<(), StoreError> {
        if let Some(finalizer) = self.lock_finalizers().remove(&job_id) {
            finalizer();
        }
        self.update(job_id, &mut |action| action.phase = JobPhase::Done)?;
        info!(job = %job_id, "job done");
        Ok(())
    }
}

impl TaskExecutor for JobRuntime {
    fn execute(&self, task: &ShardTask) -> Result<(), StoreError> {
        let found = self.store.get_many(&[ActionRecord::key(task.action_id)])?;
        let Some(entity) = &found[0] else {
            warn!(job = %task.action_id, "dropping task for unknown job");
            return Ok(());
        };
        let action = ActionRecord::from_entity(entity)?;
        if action.phase.is_terminal() {
            debug!(
                job = %task.action_id,
                shard = task.shard.index,
                phase = %action.phase,
                "stale redelivery for terminal job, skipping"
            );
            return Ok(());
        }

        let handler: Box<dyn EntityHandler> = match task.kind {
            ActionKind::Check => Box::new(CheckRepairHandler::new(self.deriver.clone(), false)),
            ActionKind::Repair => Box::new(CheckRepairHandler::new(self.deriver.clone(), true)),
            ActionKind::Clean => Box::new(CleanHandler::new(self.deriver.clone())),
        };
        let params = ScanParams {
            batch: self.config.scan_batch,
            retry: self.config.entity_retry.clone(),
        };

        let processed = run_shard(self.store.as_ref(), handler.as_ref(), task, &params)?;
        debug!(
            job = %task.action_id,
            shard = task.shard.index,
            processed,
            "shard complete"
        );
        ScanCursor::clear(self.store.as_ref(), task.action_id, task.shard.index)?;
        self.complete_shard(task.action_id)
    }

    fn dead_letter(&self, task: &ShardTask) {
        warn!(
            job = %task.action_id,
            shard = task.shard.index,
            "shard exhausted retries, failing job"
        );
        self.lock_finalizers().remove(&task.action_id);
        // Already-applied corrections stand; the job just stops here.
        let result = self.update(task.action_id, &mut |action| {
            if !action.phase.is_terminal() {
                action.phase = JobPhase::Failed;
            }
        });
        if let Err(err) = result {
            warn!(job = %task.action_id, error = %err, "failed to mark job failed");
        }
    }
}
