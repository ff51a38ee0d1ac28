//! Per-shard sequential scanning with resumable cursors.
//!
//! A shard scan walks its `(after, until]` range in key order, invokes
//! the handler once per entity, and persists a [`ScanCursor`] after
//! every batch so a redelivered task resumes near the failure point
//! instead of restarting the shard. Handler delivery is therefore
//! at-least-once: handlers must be idempotent against current store
//! state.
//!
//! Transient store errors around a single entity are retried in place
//! with backoff; once the attempt budget is spent the whole task fails
//! and the queue redelivers it.

use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::ShardTask;
use crate::retry::RetryConfig;
use crate::store::{Entity, EntityStore, Key, StoreError, decode_record, encode_record};

/// Reserved kind holding scan cursors.
pub const CURSOR_KIND: &str = "__unimark_cursor";

/// Per-entity handler invoked by the scanner. Implementations must be
/// idempotent: a retried task may hand them an already-processed
/// entity.
pub trait EntityHandler: Send + Sync {
    /// Reconcile one entity.
    ///
    /// # Errors
    ///
    /// Only store failures; data-consistency anomalies are domain
    /// outcomes recorded as discrepancy logs, not errors.
    fn handle(
        &self,
        store: &dyn EntityStore,
        task: &ShardTask,
        entity: &Entity,
    ) -> Result<(), StoreError>;
}

/// Persisted progress of one shard scan.
///
/// Resuming from a cursor continues strictly after
/// `last_processed_key`: nothing below it is reprocessed, nothing above
/// it is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Owning job.
    pub job_id: Uuid,

    /// Shard this cursor belongs to.
    pub shard_index: u32,

    /// Last key whose handler invocation completed.
    pub last_processed_key: String,

    /// Entities processed so far in this shard.
    pub processed: u64,
}

impl ScanCursor {
    /// Store key for a job/shard pair.
    #[must_use]
    pub fn key(job_id: Uuid, shard_index: u32) -> Key {
        Key::new(CURSOR_KIND, format!("{job_id}:{shard_index:04}"))
    }

    /// Load the persisted cursor, if any.
    ///
    /// # Errors
    ///
    /// Propagates store and codec failures.
    pub fn load(
        store: &dyn EntityStore,
        job_id: Uuid,
        shard_index: u32,
    ) -> Result<Option<Self>, StoreError> {
        let found = store.get_many(&[Self::key(job_id, shard_index)])?;
        found[0].as_ref().map(decode_record).transpose()
    }

    /// Remove the cursor once its shard has completed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn clear(
        store: &dyn EntityStore,
        job_id: Uuid,
        shard_index: u32,
    ) -> Result<(), StoreError> {
        store.delete(&Self::key(job_id, shard_index))
    }

    fn to_entity(&self) -> Result<Entity, StoreError> {
        encode_record(Self::key(self.job_id, self.shard_index), self)
    }
}

/// Scanner tuning, taken from the reconciler configuration.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Entities per batch; the cursor is persisted after every batch.
    pub batch: usize,

    /// Per-entity retry policy for transient store errors.
    pub retry: RetryConfig,
}

/// Scan one shard, invoking `handler` per entity in key order.
///
/// Returns the number of entities processed in this delivery plus any
/// resumed prefix.
///
/// # Errors
///
/// Returns the store error that exhausted the per-entity retry budget;
/// the caller (the queue) redelivers the task, which then resumes from
/// the last persisted cursor.
pub fn run_shard(
    store: &dyn EntityStore,
    handler: &dyn EntityHandler,
    task: &ShardTask,
    params: &ScanParams,
) -> Result<u64, StoreError> {
    let shard = &task.shard;
    let kind = task.scan_kind();

    let resumed = with_retries(&params.retry, || {
        ScanCursor::load(store, task.action_id, shard.index)
    })?;
    let mut processed = resumed.as_ref().map_or(0, |c| c.processed);
    let mut after = match resumed {
        Some(cursor) => {
            debug!(
                action_id = %task.action_id,
                shard = shard.index,
                resume_after = %cursor.last_processed_key,
                "resuming shard from cursor"
            );
            Some(cursor.last_processed_key)
        }
        None => shard.after.clone(),
    };

    loop {
        let batch = with_retries(&params.retry, || {
            store.scan(kind, after.as_deref(), shard.until.as_deref(), params.batch)
        })?;
        let Some(last) = batch.last() else {
            break;
        };
        let last_name = last.key.name.clone();

        for entity in &batch {
            with_retries(&params.retry, || handler.handle(store, task, entity))?;
            processed += 1;
        }

        let cursor = ScanCursor {
            job_id: task.action_id,
            shard_index: shard.index,
            last_processed_key: last_name.clone(),
            processed,
        };
        with_retries(&params.retry, || store.put_many(&[cursor.to_entity()?]))?;
        debug!(
            action_id = %task.action_id,
            shard = shard.index,
            processed,
            checkpoint = %last_name,
            "cursor persisted"
        );

        if batch.len() < params.batch {
            break;
        }
        after = Some(last_name);
    }

    Ok(processed)
}

fn with_retries<T>(
    retry: &RetryConfig,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.backoff.delay_for_attempt(attempt);
                warn!(attempt, error = %err, "transient store error, backing off");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
