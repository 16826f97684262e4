// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Lsn;
use std::sync::{Arc, Mutex};

/// The set of LSNs that open transactions are still reading at.
///
/// The write iterator keeps, for every key, the newest version visible to
/// each registered read view in addition to the globally newest one, so
/// dump and compaction never garbage-collect a version an open reader
/// may still need.
#[derive(Clone, Default)]
pub struct ReadViewSet(Arc<Mutex<Vec<Lsn>>>);

impl ReadViewSet {
    /// Registers a read view at `lsn`.
    pub fn open(&self, lsn: Lsn) {
        self.0.lock().expect("lock is poisoned").push(lsn);
    }

    /// Drops one read view at `lsn`.
    pub fn close(&self, lsn: Lsn) {
        let mut views = self.0.lock().expect("lock is poisoned");

        if let Some(pos) = views.iter().position(|&v| v == lsn) {
            views.swap_remove(pos);
        }
    }

    /// Snapshot sorted newest-first, deduplicated.
    pub(crate) fn snapshot(&self) -> Vec<Lsn> {
        let mut views = self.0.lock().expect("lock is poisoned").clone();
        views.sort_unstable_by(|a, b| b.cmp(a));
        views.dedup();
        views
    }
}

#[cfg(test)]
mod tests {
    use super::ReadViewSet;
    use test_log::test;

    #[test]
    fn snapshot_is_sorted_and_deduped() {
        let views = ReadViewSet::default();
        views.open(5);
        views.open(7);
        views.open(5);
        views.open(3);

        assert_eq!(vec![7, 5, 3], views.snapshot());

        views.close(5);
        assert_eq!(vec![7, 5, 3], views.snapshot());

        views.close(5);
        assert_eq!(vec![7, 3], views.snapshot());
    }
}
