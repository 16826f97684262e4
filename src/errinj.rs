// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::Relaxed};

/// Deterministic fault insertion for tests.
///
/// Always compiled in (the switches are plain atomics and cost a relaxed
/// load on paths that are about to do I/O anyway); only tests flip them.
pub struct ErrorInjection {
    /// Fail run writing immediately on task execution.
    pub run_write: AtomicBool,

    /// Fail the run writer's commit step.
    pub run_write_commit: AtomicBool,

    /// Stall task execution until cleared.
    pub run_write_delay: AtomicBool,

    /// Stall compaction task execution until cleared.
    pub compaction_delay: AtomicBool,

    /// Fail metadata log commits.
    pub vylog_commit: AtomicBool,

    /// Fail task completion on the tx thread.
    pub task_complete: AtomicBool,

    /// Skip logging `drop-run` when a run is discarded, leaving an orphan
    /// for restart recovery.
    pub run_discard: AtomicBool,

    /// Fail creation of a dump task for the index with this `index_id`
    /// (-1 = disabled).
    pub index_dump: AtomicI64,

    /// Override for the throttle *sleep* in milliseconds (0 = disabled).
    /// The logical back-off timeout still doubles normally so its
    /// progression stays observable.
    pub sched_timeout_ms: AtomicU64,
}

impl Default for ErrorInjection {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorInjection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_write: AtomicBool::new(false),
            run_write_commit: AtomicBool::new(false),
            run_write_delay: AtomicBool::new(false),
            compaction_delay: AtomicBool::new(false),
            vylog_commit: AtomicBool::new(false),
            task_complete: AtomicBool::new(false),
            run_discard: AtomicBool::new(false),
            index_dump: AtomicI64::new(-1),
            sched_timeout_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_on(flag: &AtomicBool) -> bool {
        flag.load(Relaxed)
    }

    /// Flips a switch; visible to all threads immediately.
    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Relaxed);
    }
}
