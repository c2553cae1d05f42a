// ================================================================================================
// Priority Job Queue & Cancellation
// ================================================================================================

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{OrchestratorError, WorldlineResult},
    types::RunId,
};

/// Scheduling priority; lower values pop first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// A queued run. Orders by priority, then FIFO by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedJob {
    priority: JobPriority,
    sequence: u64,
    run_id: RunId,
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.sequence).cmp(&(other.priority, other.sequence))
    }
}

/// Min-heap job queue consumed by the worker pool.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Reverse<QueuedJob>>>,
    notify: Notify,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, run_id: RunId, priority: JobPriority) -> WorldlineResult<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(OrchestratorError::QueueClosed.into());
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .push(Reverse(QueuedJob {
                priority,
                sequence,
                run_id,
            }));
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next run, waiting when the queue is empty. Returns `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<RunId> {
        loop {
            let notified = self.notify.notified();
            if let Some(Reverse(job)) = self.heap.lock().expect("queue lock poisoned").pop() {
                // Wake a sibling in case more work is queued.
                self.notify.notify_one();
                return Some(job.run_id);
            }
            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue; workers drain what remains and exit.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Per-run cancellation tokens, consulted at tick boundaries.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<RunId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a run, created on first use.
    pub fn token_for(&self, run_id: RunId) -> CancellationToken {
        self.tokens.entry(run_id).or_default().clone()
    }

    /// Signal cancellation. Returns false for unknown runs.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: RunId) {
        self.tokens.remove(&run_id);
    }
}
