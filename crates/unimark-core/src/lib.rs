//! # unimark-core
//!
//! Engine for reconciling uniqueness-constraint marker records against
//! the primary entities that own them.
//!
//! Markers are side-records in an ordered key-value store: one marker
//! per (model, unique-constraint combination, rendered values), holding
//! a back-reference to the owning instance. Application bugs, partial
//! writes, and schema changes let markers drift out of sync with the
//! instances; this crate runs sharded, resumable map jobs that detect
//! (*check*), correct (*repair*), or garbage-collect (*clean*) that
//! drift.
//!
//! ## Core Concepts
//!
//! - **Job**: one invocation of check, repair, or clean against a
//!   model, tracked by a persistent [`ActionRecord`]
//! - **Shard**: a contiguous key range of the scanned kind; shards are
//!   planned from sampled split points and scanned independently
//! - **Cursor**: per-shard checkpoint giving redelivered tasks
//!   at-least-once, resume-don't-restart semantics
//! - **Discrepancy log**: capped per-job record of anomalies found
//!
//! Every piece of coordination state lives in the same store as the
//! data being reconciled, behind the [`EntityStore`] trait, so the
//! engine runs against any ordered key-value backend. The in-memory
//! implementation ships here; the SQLite backend lives in
//! `unimark-store`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use unimark_core::{
//!     ActionKind, JobRuntime, ReconcilerConfig, UniqueConstraintSet,
//!     store::memory::InMemoryStore,
//! };
//!
//! let config = ReconcilerConfig::from_toml(
//!     r#"
//!     [[models]]
//!     name = "profile"
//!     unique = [["email"]]
//!     "#,
//! )
//! .unwrap();
//! let store = Arc::new(InMemoryStore::new());
//! let deriver = Arc::new(UniqueConstraintSet::from_models(&config.models));
//!
//! let runtime = JobRuntime::start(store, deriver, config);
//! let job_id = runtime.submit(ActionKind::Check, "profile").unwrap();
//! let status = runtime.wait(job_id, Duration::from_secs(30)).unwrap();
//! println!("{}: {} discrepancies", status.id, status.log_count);
//! ```

pub mod action;
pub mod config;
pub mod derive;
pub mod job;
pub mod marker;
pub mod plan;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod scan;
pub mod store;

pub use action::{
    ActionKind, ActionRecord, ActionStatus, DiscrepancyLog, JobPhase, LogKind, MAX_ERRORS,
};
pub use config::{ConfigError, ModelConfig, ReconcilerConfig};
pub use derive::{MarkerKeyDeriver, UniqueConstraintSet};
pub use job::{Finalizer, JobError, JobRuntime, JobStatus};
pub use marker::{BackRef, MarkerRecord};
pub use plan::{PlanError, ShardDescriptor};
pub use queue::{LocalTaskQueue, QueueError, ShardTask, TaskExecutor, TaskQueue};
pub use retry::{BackoffConfig, RetryConfig};
pub use scan::{EntityHandler, ScanCursor};
pub use store::{Entity, EntityStore, Key, StoreError};
