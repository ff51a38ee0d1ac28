//! Task scheduling: work units, the queue abstraction, and the local
//! worker-pool implementation.
//!
//! Work units are plain serializable data — no captured closures — so
//! any queue backend with at-least-once delivery can carry them. The
//! in-process [`LocalTaskQueue`] provides exactly that: a dispatcher
//! thread holding a delay heap feeds ready tasks to a pool of worker
//! threads over crossbeam channels; a failed task is redelivered with
//! backoff until its attempt budget is exhausted, at which point it is
//! dead-lettered to the executor.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::action::ActionKind;
use crate::marker::MARKER_KIND;
use crate::plan::ShardDescriptor;
use crate::retry::RetryConfig;
use crate::store::StoreError;
use uuid::Uuid;

/// How long an idle dispatcher sleeps between queue polls.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One shard-scan work unit. Everything a worker needs travels in the
/// payload; workers share no in-process state with the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTask {
    /// Owning action record.
    pub action_id: Uuid,

    /// Check, repair, or clean — selects the handler.
    pub kind: ActionKind,

    /// Target model.
    pub model: String,

    /// Store alias the job runs against.
    pub alias: String,

    /// The shard this task scans.
    pub shard: ShardDescriptor,
}

impl ShardTask {
    /// Entity kind this task scans: clean maps over the marker store
    /// directly, check/repair map over the primary entities.
    #[must_use]
    pub fn scan_kind(&self) -> &str {
        match self.kind {
            ActionKind::Clean => MARKER_KIND,
            ActionKind::Check | ActionKind::Repair => &self.model,
        }
    }
}

/// Queue submission errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue has shut down and accepts no more work.
    #[error("task queue is shut down")]
    Closed,
}

/// Task queue collaborator: at-least-once delivery with bounded
/// redelivery.
pub trait TaskQueue: Send + Sync {
    /// Submit a work unit for eventual execution.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue no longer accepts
    /// work.
    fn enqueue(&self, task: ShardTask) -> Result<(), QueueError>;
}

/// Consumer side of the queue. Implemented by the job runtime.
pub trait TaskExecutor: Send + Sync {
    /// Run one delivery of a task. An `Err` triggers redelivery until
    /// the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Any store failure that survived the scanner's own per-entity
    /// retries.
    fn execute(&self, task: &ShardTask) -> Result<(), StoreError>;

    /// Called once when a task exhausts its redeliveries.
    fn dead_letter(&self, task: &ShardTask);
}

enum Command {
    Submit(Delivery),
    Shutdown,
}

#[derive(Debug, Clone)]
struct Delivery {
    task: ShardTask,
    /// 1-based delivery attempt.
    attempt: u32,
}

/// Heap entry ordered by readiness time; `seq` breaks ties FIFO.
struct Scheduled {
    ready_at: Instant,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

/// In-process task queue: one dispatcher thread plus a worker pool.
///
/// Dropping the queue stops the dispatcher and joins all threads;
/// not-yet-delivered tasks are discarded, which mirrors a process
/// crash — at-least-once semantics never promised they'd survive.
pub struct LocalTaskQueue {
    commands: Sender<Command>,
    dispatcher: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl LocalTaskQueue {
    /// Start the dispatcher and `workers` worker threads. The executor
    /// is held weakly so the queue never keeps the runtime alive.
    #[must_use]
    pub fn start(executor: Weak<dyn TaskExecutor>, workers: usize, retry: RetryConfig) -> Self {
        let (command_tx, command_rx) = unbounded::<Command>();
        let (work_tx, work_rx) = unbounded::<Delivery>();

        let dispatcher_retry = retry.clone();
        let dispatcher = thread::spawn(move || {
            dispatch_loop(&command_rx, &work_tx, &dispatcher_retry);
        });

        let worker_handles = (0..workers.max(1))
            .map(|_| {
                let rx = work_rx.clone();
                let resubmit = command_tx.clone();
                let exec = executor.clone();
                let retry = retry.clone();
                thread::spawn(move || worker_loop(&rx, &resubmit, &exec, &retry))
            })
            .collect();

        Self {
            commands: command_tx,
            dispatcher: Some(dispatcher),
            workers: worker_handles,
        }
    }
}

impl TaskQueue for LocalTaskQueue {
    fn enqueue(&self, task: ShardTask) -> Result<(), QueueError> {
        self.commands
            .send(Command::Submit(Delivery { task, attempt: 1 }))
            .map_err(|_| QueueError::Closed)
    }
}

impl Drop for LocalTaskQueue {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        // The drop can run on a worker thread (a worker may hold the
        // last strong reference to the executor that owns this queue);
        // never join the current thread.
        let current = thread::current().id();
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn dispatch_loop(commands: &Receiver<Command>, work: &Sender<Delivery>, retry: &RetryConfig) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.ready_at <= now)
        {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if work.send(entry.delivery).is_err() {
                return;
            }
        }

        let timeout = heap
            .peek()
            .map_or(IDLE_POLL, |Reverse(entry)| {
                entry.ready_at.saturating_duration_since(now)
            });

        match commands.recv_timeout(timeout) {
            Ok(Command::Submit(delivery)) => {
                let delay = if delivery.attempt <= 1 {
                    Duration::ZERO
                } else {
                    retry.backoff.delay_for_attempt(delivery.attempt - 1)
                };
                heap.push(Reverse(Scheduled {
                    ready_at: Instant::now() + delay,
                    seq,
                    delivery,
                }));
                seq += 1;
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn worker_loop(
    work: &Receiver<Delivery>,
    resubmit: &Sender<Command>,
    executor: &Weak<dyn TaskExecutor>,
    retry: &RetryConfig,
) {
    for delivery in work.iter() {
        let Some(exec) = executor.upgrade() else {
            return;
        };
        match exec.execute(&delivery.task) {
            Ok(()) => {}
            Err(err) if delivery.attempt < retry.max_attempts => {
                warn!(
                    action_id = %delivery.task.action_id,
                    shard = delivery.task.shard.index,
                    attempt = delivery.attempt,
                    error = %err,
                    "shard task failed, scheduling redelivery"
                );
                let next = Delivery {
                    task: delivery.task,
                    attempt: delivery.attempt + 1,
                };
                if resubmit.send(Command::Submit(next)).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(
                    action_id = %delivery.task.action_id,
                    shard = delivery.task.shard.index,
                    attempts = delivery.attempt,
                    error = %err,
                    "shard task exhausted retries, dead-lettering"
                );
                exec.dead_letter(&delivery.task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::retry::BackoffConfig;

    struct FlakyExecutor {
        failures_before_success: u32,
        executions: AtomicU32,
        dead_letters: Mutex<Vec<ShardTask>>,
    }

    impl FlakyExecutor {
        fn new(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success,
                executions: AtomicU32::new(0),
                dead_letters: Mutex::new(Vec::new()),
            })
        }
    }

    impl TaskExecutor for FlakyExecutor {
        fn execute(&self, _task: &ShardTask) -> Result<(), StoreError> {
            let n = self.executions.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(StoreError::Transient("flaky".to_string()))
            } else {
                Ok(())
            }
        }

        fn dead_letter(&self, task: &ShardTask) {
            self.dead_letters.lock().unwrap().push(task.clone());
        }
    }

    fn task() -> ShardTask {
        ShardTask {
            action_id: Uuid::new_v4(),
            kind: ActionKind::Check,
            model: "profile".to_string(),
            alias: "default".to_string(),
            shard: ShardDescriptor {
                index: 0,
                after: None,
                until: None,
            },
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(5),
            },
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn delivers_and_executes() {
        let exec = FlakyExecutor::new(0);
        let weak: Weak<FlakyExecutor> = Arc::downgrade(&exec);
        let weak: Weak<dyn TaskExecutor> = weak;
        let queue = LocalTaskQueue::start(weak, 2, fast_retry(3));

        queue.enqueue(task()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            exec.executions.load(Ordering::SeqCst) == 1
        }));
        assert!(exec.dead_letters.lock().unwrap().is_empty());
    }

    #[test]
    fn redelivers_until_success() {
        let exec = FlakyExecutor::new(2);
        let weak: Weak<FlakyExecutor> = Arc::downgrade(&exec);
        let weak: Weak<dyn TaskExecutor> = weak;
        let queue = LocalTaskQueue::start(weak, 1, fast_retry(5));

        queue.enqueue(task()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            exec.executions.load(Ordering::SeqCst) == 3
        }));
        assert!(exec.dead_letters.lock().unwrap().is_empty());
        drop(queue);
        // No further deliveries after success.
        assert_eq!(exec.executions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dead_letters_after_exhaustion() {
        let exec = FlakyExecutor::new(u32::MAX);
        let weak: Weak<FlakyExecutor> = Arc::downgrade(&exec);
        let weak: Weak<dyn TaskExecutor> = weak;
        let queue = LocalTaskQueue::start(weak, 1, fast_retry(3));

        queue.enqueue(task()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            !exec.dead_letters.lock().unwrap().is_empty()
        }));
        assert_eq!(exec.executions.load(Ordering::SeqCst), 3);
        assert_eq!(exec.dead_letters.lock().unwrap().len(), 1);
    }

    #[test]
    fn drop_joins_all_threads() {
        let exec = FlakyExecutor::new(0);
        let weak: Weak<FlakyExecutor> = Arc::downgrade(&exec);
        let weak: Weak<dyn TaskExecutor> = weak;
        let queue = LocalTaskQueue::start(weak, 4, fast_retry(1));
        let sender = queue.commands.clone();
        drop(queue);
        // Dispatcher and workers are gone; the channel is fully closed.
        assert!(sender.send(Command::Shutdown).is_err());
    }

    #[test]
    fn scan_kind_dispatches_on_action_kind() {
        let mut t = task();
        assert_eq!(t.scan_kind(), "profile");
        t.kind = ActionKind::Clean;
        assert_eq!(t.scan_kind(), MARKER_KIND);
    }
}
