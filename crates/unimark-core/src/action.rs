//! Job status records and the discrepancy log.
//!
//! An [`ActionRecord`] is created once per job invocation and is the
//! single shared mutable resource between shard workers and the
//! finalizer; every mutation goes through [`EntityStore::transact`].
//! [`DiscrepancyLog`] entries are append-only and hard-capped at
//! [`MAX_ERRORS`] per action: the count check, the increment, and the
//! log write happen in one transaction, so the cap holds under
//! concurrent shard writers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Entity, EntityStore, Key, StoreError, decode_record, encode_record, prefix_bounds};

/// Reserved kind holding action records.
pub const ACTION_KIND: &str = "__unimark_action";

/// Reserved kind holding discrepancy log entries.
pub const LOG_KIND: &str = "__unimark_log";

/// Upper bound on discrepancy logs per action. Writes beyond the cap
/// are dropped.
pub const MAX_ERRORS: u64 = 100;

/// What a job does with the markers it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Verify markers and log discrepancies without mutating anything.
    Check,
    /// Recreate missing markers and fix broken back-references.
    Repair,
    /// Delete markers that no longer correspond to a live instance.
    Clean,
}

impl ActionKind {
    /// Stable string form, matching the serde encoding.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Repair => "repair",
            Self::Clean => "clean",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator phase machine. `Failed` is reachable from any
/// non-terminal phase; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Shard planning in progress; nothing dispatched yet.
    Planning,
    /// Shard tasks dispatched; waiting for all of them to report.
    Scanning,
    /// All shards done; finalize callback running.
    Finalizing,
    /// Finalize completed.
    Done,
    /// Planning failed or a shard exhausted its retries.
    Failed,
}

impl JobPhase {
    /// Whether the phase admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Scanning => "scanning",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Caller-visible job status, derived from the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Job still in flight.
    Running,
    /// Finalize completed.
    Done,
    /// Job failed terminally; resubmission is the caller's call.
    Failed,
}

/// Persistent status record for one job invocation.
///
/// `kind`, `model`, and `alias` are immutable after creation; `phase`,
/// `shards_remaining`, and `log_count` are mutated only through
/// transactional read-modify-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Job id.
    pub id: Uuid,

    /// Check, repair, or clean.
    pub kind: ActionKind,

    /// Target model name (the primary entity kind).
    pub model: String,

    /// Store alias / namespace the job runs against.
    pub alias: String,

    /// Current orchestrator phase.
    pub phase: JobPhase,

    /// Shard tasks still outstanding while scanning.
    pub shards_remaining: u32,

    /// Discrepancy logs recorded so far (capped at [`MAX_ERRORS`]).
    pub log_count: u64,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    /// Create a fresh record in the `Planning` phase.
    #[must_use]
    pub fn new(kind: ActionKind, model: &str, alias: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            model: model.to_string(),
            alias: alias.to_string(),
            phase: JobPhase::Planning,
            shards_remaining: 0,
            log_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Store key for an action id.
    #[must_use]
    pub fn key(id: Uuid) -> Key {
        Key::new(ACTION_KIND, id.to_string())
    }

    /// Derived caller-visible status.
    #[must_use]
    pub const fn status(&self) -> ActionStatus {
        match self.phase {
            JobPhase::Done => ActionStatus::Done,
            JobPhase::Failed => ActionStatus::Failed,
            _ => ActionStatus::Running,
        }
    }

    /// Encode into a store entity.
    ///
    /// # Errors
    ///
    /// Propagates codec failures.
    pub fn to_entity(&self) -> Result<Entity, StoreError> {
        encode_record(Self::key(self.id), self)
    }

    /// Decode from a store entity.
    ///
    /// # Errors
    ///
    /// Fails on malformed properties.
    pub fn from_entity(entity: &Entity) -> Result<Self, StoreError> {
        decode_record(entity)
    }
}

/// Anomaly classes recorded during scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Marker for the unique constraint is missing.
    MissingMarker,
    /// Marker exists but doesn't point at any instance.
    MissingInstance,
    /// Marker is assigned to a different instance already.
    AlreadyAssigned,
    /// Marker's back-reference uses the legacy string encoding.
    OldInstanceKey,
}

impl LogKind {
    /// Stable string form, matching the serde encoding.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingMarker => "missing_marker",
            Self::MissingInstance => "missing_instance",
            Self::AlreadyAssigned => "already_assigned",
            Self::OldInstanceKey => "old_instance_key",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscrepancyLog {
    /// Log entry id.
    pub id: Uuid,

    /// Owning action.
    pub action_id: Uuid,

    /// Anomaly class.
    pub kind: LogKind,

    /// Encoded key of the subject instance (or the marker itself for
    /// clean-mode entries).
    pub instance_key: String,

    /// Encoded key of the marker involved.
    pub marker_key: String,
}

impl DiscrepancyLog {
    /// Store key; log names are prefixed by the owning action id so one
    /// prefix scan returns a job's logs in insertion-independent order.
    #[must_use]
    pub fn key(&self) -> Key {
        Key::new(LOG_KIND, format!("{}:{}", self.action_id, self.id))
    }

    /// Encode into a store entity.
    ///
    /// # Errors
    ///
    /// Propagates codec failures.
    pub fn to_entity(&self) -> Result<Entity, StoreError> {
        encode_record(self.key(), self)
    }
}

/// Record an anomaly against an action, dropping the write once the
/// action already holds [`MAX_ERRORS`] entries.
///
/// # Errors
///
/// Fails if the action record is missing or the store errors.
pub fn append_log(
    store: &dyn EntityStore,
    action_id: Uuid,
    kind: LogKind,
    instance_key: &str,
    marker_key: &str,
) -> Result<(), StoreError> {
    store.transact(&mut |txn| {
        let key = ActionRecord::key(action_id);
        let Some(entity) = txn.get(&key)? else {
            return Err(StoreError::NotFound { key: key.encode() });
        };
        let mut action = ActionRecord::from_entity(&entity)?;
        if action.log_count >= MAX_ERRORS {
            return Ok(());
        }
        action.log_count += 1;
        let log = DiscrepancyLog {
            id: Uuid::new_v4(),
            action_id,
            kind,
            instance_key: instance_key.to_string(),
            marker_key: marker_key.to_string(),
        };
        txn.put(log.to_entity()?)?;
        txn.put(action.to_entity()?)
    })
}

/// Fetch the discrepancy logs recorded for an action.
///
/// # Errors
///
/// Propagates store and codec failures.
pub fn logs_for(
    store: &dyn EntityStore,
    action_id: Uuid,
) -> Result<Vec<DiscrepancyLog>, StoreError> {
    let (after, until) = prefix_bounds(&format!("{action_id}:"));
    let entities = store.scan(
        LOG_KIND,
        Some(&after),
        Some(&until),
        usize::try_from(MAX_ERRORS).unwrap_or(usize::MAX),
    )?;
    entities.iter().map(decode_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn seeded_action(store: &InMemoryStore) -> ActionRecord {
        let action = ActionRecord::new(ActionKind::Check, "profile", "default");
        store.put_many(&[action.to_entity().unwrap()]).unwrap();
        action
    }

    #[test]
    fn record_round_trips_through_entity() {
        let action = ActionRecord::new(ActionKind::Repair, "profile", "eu");
        let entity = action.to_entity().unwrap();
        let back = ActionRecord::from_entity(&entity).unwrap();
        assert_eq!(back.id, action.id);
        assert_eq!(back.kind, ActionKind::Repair);
        assert_eq!(back.model, "profile");
        assert_eq!(back.alias, "eu");
        assert_eq!(back.phase, JobPhase::Planning);
    }

    #[test]
    fn status_derivation() {
        let mut action = ActionRecord::new(ActionKind::Check, "m", "default");
        assert_eq!(action.status(), ActionStatus::Running);
        action.phase = JobPhase::Finalizing;
        assert_eq!(action.status(), ActionStatus::Running);
        action.phase = JobPhase::Done;
        assert_eq!(action.status(), ActionStatus::Done);
        action.phase = JobPhase::Failed;
        assert_eq!(action.status(), ActionStatus::Failed);
    }

    #[test]
    fn append_log_records_and_counts() {
        let store = InMemoryStore::new();
        let action = seeded_action(&store);

        append_log(&store, action.id, LogKind::MissingMarker, "profile/u1", "marker/m1").unwrap();
        append_log(&store, action.id, LogKind::AlreadyAssigned, "profile/u2", "marker/m2")
            .unwrap();

        let logs = logs_for(&store, action.id).unwrap();
        assert_eq!(logs.len(), 2);

        let entity = store.get_many(&[ActionRecord::key(action.id)]).unwrap()[0]
            .clone()
            .unwrap();
        let reread = ActionRecord::from_entity(&entity).unwrap();
        assert_eq!(reread.log_count, 2);
    }

    #[test]
    fn log_count_never_exceeds_cap() {
        let store = InMemoryStore::new();
        let action = seeded_action(&store);

        for i in 0..(MAX_ERRORS + 20) {
            append_log(
                &store,
                action.id,
                LogKind::MissingMarker,
                &format!("profile/u{i}"),
                "marker/m",
            )
            .unwrap();
        }

        let entity = store.get_many(&[ActionRecord::key(action.id)]).unwrap()[0]
            .clone()
            .unwrap();
        let reread = ActionRecord::from_entity(&entity).unwrap();
        assert_eq!(reread.log_count, MAX_ERRORS);
        assert_eq!(logs_for(&store, action.id).unwrap().len() as u64, MAX_ERRORS);
    }

    #[test]
    fn append_log_to_missing_action_errors() {
        let store = InMemoryStore::new();
        let result = append_log(&store, Uuid::new_v4(), LogKind::MissingMarker, "a", "b");
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn logs_do_not_leak_across_actions() {
        let store = InMemoryStore::new();
        let first = seeded_action(&store);
        let second = seeded_action(&store);

        append_log(&store, first.id, LogKind::MissingMarker, "a", "m").unwrap();
        append_log(&store, second.id, LogKind::MissingInstance, "b", "n").unwrap();

        let logs = logs_for(&store, first.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::MissingMarker);
    }
}
