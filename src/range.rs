// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::heap::HEAP_POS_NONE;
use crate::slice::{Slice, SliceId};
use crate::UserKey;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, RwLock};

/// Identifier of a range, allocated by the metadata log.
pub type RangeId = u64;

/// A contiguous key span of an LSM tree holding a newest-first list of
/// slices.
///
/// Slice-list mutations happen under the write lock in one critical
/// section, so a concurrent reader never observes a statement both in a
/// compacted slice and in its replacement.
pub struct Range {
    id: RangeId,
    begin: Option<UserKey>,
    end: Option<UserKey>,

    slices: RwLock<Vec<Arc<Slice>>>,

    /// How many of the newest slices a compaction should merge;
    /// 1 means no compaction is needed.
    compact_priority: AtomicUsize,

    /// Set by a forced compaction; makes every slice eligible.
    needs_compaction: AtomicBool,

    /// Bumped on every slice-list change, for iterator invalidation.
    version: AtomicU64,

    n_compactions: AtomicUsize,

    /// Position in the LSM tree's range heap; [`HEAP_POS_NONE`] while the
    /// range is being compacted (so it is not picked twice).
    pub(crate) heap_pos: AtomicUsize,
}

impl Range {
    #[must_use]
    pub fn new(id: RangeId, begin: Option<UserKey>, end: Option<UserKey>) -> Self {
        Self {
            id,
            begin,
            end,
            slices: RwLock::new(Vec::new()),
            compact_priority: AtomicUsize::new(1),
            needs_compaction: AtomicBool::new(false),
            version: AtomicU64::new(0),
            n_compactions: AtomicUsize::new(0),
            heap_pos: AtomicUsize::new(HEAP_POS_NONE),
        }
    }

    pub fn id(&self) -> RangeId {
        self.id
    }

    pub fn begin(&self) -> Option<&UserKey> {
        self.begin.as_ref()
    }

    pub fn end(&self) -> Option<&UserKey> {
        self.end.as_ref()
    }

    /// Snapshot of the slice list, newest first.
    pub fn slices(&self) -> Vec<Arc<Slice>> {
        self.slices.read().expect("lock is poisoned").clone()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.read().expect("lock is poisoned").len()
    }

    pub fn size(&self) -> u64 {
        self.slices
            .read()
            .expect("lock is poisoned")
            .iter()
            .map(|s| s.size())
            .sum()
    }

    pub fn compact_priority(&self) -> usize {
        self.compact_priority.load(Relaxed)
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.needs_compaction.load(Relaxed)
    }

    pub(crate) fn set_needs_compaction(&self, value: bool) {
        self.needs_compaction.store(value, Relaxed);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Relaxed)
    }

    pub fn n_compactions(&self) -> usize {
        self.n_compactions.load(Relaxed)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Relaxed);
    }

    pub(crate) fn note_compaction(&self) {
        self.n_compactions.fetch_add(1, Relaxed);
    }

    /// Whether the range is currently owned by a compaction task.
    pub(crate) fn is_scheduled(&self) -> bool {
        self.heap_pos.load(Relaxed) == HEAP_POS_NONE
    }

    /// Prepends a freshly dumped slice.
    pub(crate) fn add_slice(&self, slice: Arc<Slice>) {
        self.slices
            .write()
            .expect("lock is poisoned")
            .insert(0, slice);
    }

    /// Replaces the contiguous sub-list `[first, last]` with `new_slice`
    /// (if any) at the position of `first`. A concurrent dump may have
    /// prepended newer slices while the compaction ran, which stay above.
    ///
    /// Returns the removed slices.
    pub(crate) fn replace_slices(
        &self,
        first: SliceId,
        last: SliceId,
        new_slice: Option<Arc<Slice>>,
    ) -> Vec<Arc<Slice>> {
        let mut slices = self.slices.write().expect("lock is poisoned");

        let lo = slices
            .iter()
            .position(|s| s.id() == first)
            .expect("first compacted slice must still be in the range");
        let hi = slices
            .iter()
            .position(|s| s.id() == last)
            .expect("last compacted slice must still be in the range");
        debug_assert!(lo <= hi);

        slices.splice(lo..=hi, new_slice).collect()
    }

    /// Recomputes how many of the newest slices are worth merging.
    ///
    /// Walks the slice list newest first, stopping at the first slice that
    /// dwarfs the accumulated prefix (merging small young runs into a huge
    /// old one is wasted write amplification); within the walked prefix,
    /// any count above `run_count_per_level` is scheduled.
    pub(crate) fn update_compact_priority(&self, run_count_per_level: usize) {
        let slices = self.slices.read().expect("lock is poisoned");

        if self.needs_compaction() {
            self.compact_priority.store(slices.len().max(1), Relaxed);
            return;
        }

        let mut priority = 1;
        let mut prefix_size: u64 = 0;

        for (i, slice) in slices.iter().enumerate() {
            let size = slice.size().max(1);

            if i > 0 && size > prefix_size.saturating_mul(4) {
                // Next level reached
                break;
            }

            prefix_size += size;

            if i + 1 > run_count_per_level {
                priority = i + 1;
            }
        }

        self.compact_priority.store(priority, Relaxed);
    }
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Range({}, {:?}..{:?})", self.id, self.begin, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::Range;
    use crate::run::{Run, RunInfo};
    use crate::slice::Slice;
    use std::sync::Arc;
    use test_log::test;

    fn slice_of_size(id: u64, size: u64) -> Arc<Slice> {
        let run = Arc::new(Run::new(id));
        run.set_info(RunInfo {
            count: 1,
            size,
            min_key: Some("a".into()),
            max_key: Some("z".into()),
            max_lsn: Some(1),
        });
        Arc::new(Slice::new(id, run, None, None))
    }

    #[test]
    fn priority_counts_small_runs() {
        let range = Range::new(1, None, None);
        for id in 0..3 {
            range.add_slice(slice_of_size(id, 100));
        }

        range.update_compact_priority(1);
        assert_eq!(3, range.compact_priority());

        range.update_compact_priority(4);
        assert_eq!(1, range.compact_priority());
    }

    #[test]
    fn priority_stops_at_next_level() {
        let range = Range::new(1, None, None);
        range.add_slice(slice_of_size(0, 100_000)); // old, huge
        range.add_slice(slice_of_size(1, 100));
        range.add_slice(slice_of_size(2, 100)); // newest

        range.update_compact_priority(1);
        assert_eq!(2, range.compact_priority(), "must not drag the huge run in");
    }

    #[test]
    fn forced_compaction_covers_all_slices() {
        let range = Range::new(1, None, None);
        for id in 0..3 {
            range.add_slice(slice_of_size(id, 100));
        }

        range.set_needs_compaction(true);
        range.update_compact_priority(10);
        assert_eq!(3, range.compact_priority());
    }

    #[test]
    fn replace_keeps_newer_slices_on_top() {
        let range = Range::new(1, None, None);
        range.add_slice(slice_of_size(1, 10));
        range.add_slice(slice_of_size(2, 10));
        range.add_slice(slice_of_size(3, 10)); // newest; list is [3, 2, 1]

        // Compact [2, 1], with 3 having arrived from a concurrent dump
        let replacement = slice_of_size(4, 20);
        let removed = range.replace_slices(2, 1, Some(replacement));

        assert_eq!(2, removed.len());
        let ids: Vec<_> = range.slices().iter().map(|s| s.id()).collect();
        assert_eq!(vec![3, 4], ids);
    }
}
