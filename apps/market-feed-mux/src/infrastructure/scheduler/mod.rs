//! Deferred Task Scheduling
//!
//! Implementations of the `Scheduler` port plus the single-flight flag
//! used to coalesce bursts of mutations into one deferred task.
//!
//! - `TokioScheduler`: spawns each task on a current-thread tokio runtime
//! - `TaskQueue`: queues tasks until the host drains it (tests, replay)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::application::ports::{Scheduler, Task};

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Not called from within a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The runtime may run tasks on other threads.
    #[error("deferred tasks need a current-thread runtime, got {0:?}")]
    UnsupportedFlavor(RuntimeFlavor),
}

// =============================================================================
// Single Flight
// =============================================================================

/// At most one pending task per owner.
///
/// `arm` returns `true` only for the caller that should schedule the task;
/// the task calls `disarm` as its first step so that mutations made while
/// it runs schedule a fresh task.
#[derive(Debug, Default)]
pub struct SingleFlight {
    armed: AtomicBool,
}

impl SingleFlight {
    /// Create a disarmed flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
        }
    }

    /// Arm the flag. Returns `true` if it was not armed before.
    pub fn arm(&self) -> bool {
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Disarm the flag.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Check if a task is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tokio Scheduler
// =============================================================================

/// Runs deferred tasks on a current-thread tokio runtime.
///
/// A spawned task can only start once the thread that deferred it yields
/// back to the runtime, so every mutation made in one synchronous call
/// stack lands in the same flush. Multi-thread runtimes are rejected: a
/// worker could start the task while the caller is still mutating.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler bound to a runtime handle.
    ///
    /// # Errors
    ///
    /// Returns an error unless the handle belongs to a current-thread runtime.
    pub fn new(handle: Handle) -> Result<Self, SchedulerError> {
        match handle.runtime_flavor() {
            RuntimeFlavor::CurrentThread => Ok(Self { handle }),
            flavor => Err(SchedulerError::UnsupportedFlavor(flavor)),
        }
    }

    /// Create a scheduler bound to the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime or from a
    /// multi-thread runtime.
    pub fn current() -> Result<Self, SchedulerError> {
        Self::new(Handle::try_current()?)
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

// =============================================================================
// Task Queue
// =============================================================================

/// Cooperative queue drained explicitly by the host.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Run tasks until the queue is empty, including tasks queued by tasks.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before running so tasks can defer more work.
            let Some(task) = self.tasks.lock().pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl Scheduler for TaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}
