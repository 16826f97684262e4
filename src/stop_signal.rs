// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{atomic::AtomicBool, Arc};

/// One-way latch observed at cooperative suspension points.
///
/// The scheduler raises one instance on shutdown to interrupt every worker;
/// each task additionally carries its own, raised when a deferred DELETE
/// batch fails on the tx thread. A task checks both every 32 appended
/// statements and returns a cancelled error once either fires.
#[derive(Clone, Debug, Default)]
pub(crate) struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}
