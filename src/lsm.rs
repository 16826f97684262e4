// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::Config;
use crate::heap::{IndexedHeap, HEAP_POS_NONE};
use crate::mem::MemTree;
use crate::range::Range;
use crate::run::{Run, RunInfo};
use crate::slice::Slice;
use crate::value::Statement;
use crate::vylog::{MetadataLog, VylogRecord};
use crate::{Lsn, UserKey};
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize,
    Ordering::Relaxed,
};
use std::sync::{Arc, Mutex, RwLock};

/// Identifier of an LSM tree, allocated by the metadata log.
pub type LsmId = u64;

fn range_heap_less(a: &Arc<Range>, b: &Arc<Range>) -> bool {
    a.compact_priority() > b.compact_priority()
}

fn range_heap_pos(r: &Arc<Range>) -> &AtomicUsize {
    &r.heap_pos
}

/// Cumulative counters, updated by the scheduler on the tx thread.
#[derive(Default)]
struct LsmCounters {
    dump_count: AtomicU64,
    dumped_in_stmts: AtomicU64,
    dumped_out_stmts: AtomicU64,
    compaction_count: AtomicU64,
    compacted_in_stmts: AtomicU64,
    compacted_out_stmts: AtomicU64,
    disk_size: AtomicU64,
    disk_stmts: AtomicU64,
}

/// Snapshot of an LSM tree's statistics.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LsmTreeStats {
    pub run_count: usize,
    pub range_count: usize,
    pub sealed_mem_count: usize,
    pub dump_count: u64,
    pub dumped_in_stmts: u64,
    pub dumped_out_stmts: u64,
    pub compaction_count: u64,
    pub compacted_in_stmts: u64,
    pub compacted_out_stmts: u64,
    pub disk_size: u64,
    pub disk_stmts: u64,
}

/// One LSM index: a stack of in-memory trees plus an ordered set of ranges
/// of immutable disk runs.
///
/// The scheduler orchestrates dumps and compactions of this structure;
/// ranges, slices and the metadata log are only ever mutated on the tx
/// thread, while foreground writers append to the active in-memory tree.
pub struct LsmTree {
    id: LsmId,
    space_id: u32,
    index_id: u32,

    /// Primary index of the same space; secondary indexes only.
    pk: Option<Arc<LsmTree>>,

    config: Arc<Config>,
    vylog: Arc<MetadataLog>,

    mem_id: AtomicU64,
    active: RwLock<Arc<MemTree>>,

    /// Sealed in-memory trees, oldest first.
    sealed: RwLock<Vec<Arc<MemTree>>>,

    /// Ranges ordered by begin key.
    ranges: RwLock<Vec<Arc<Range>>>,

    /// Ranges by compaction priority; the top is what a compaction task
    /// will pick. A range being compacted is temporarily absent.
    pub(crate) range_heap: Mutex<IndexedHeap<Arc<Range>>>,

    runs: Mutex<Vec<Arc<Run>>>,

    /// Max LSN this tree has durably dumped; statements up to here are
    /// skipped on WAL replay. 0 = never dumped.
    dump_lsn: AtomicU64,

    is_dropped: AtomicBool,

    /// Set while a dump task is in flight for this tree.
    pub(crate) is_dumping: AtomicBool,

    /// Dumps of this tree are held off while > 0; used to dump the
    /// primary index after all its secondaries.
    pub(crate) pin_count: AtomicU32,

    /// Position in the scheduler's dump heap.
    pub(crate) in_dump: AtomicUsize,

    /// Position in the scheduler's compaction heap.
    pub(crate) in_compact: AtomicUsize,

    counters: LsmCounters,
}

impl LsmTree {
    /// Creates a new LSM tree with one unbounded range.
    ///
    /// # Panics
    ///
    /// Panics if a primary index is given a `pk` or a secondary index
    /// is not.
    #[must_use]
    pub fn new(
        space_id: u32,
        index_id: u32,
        pk: Option<Arc<LsmTree>>,
        config: Arc<Config>,
        vylog: Arc<MetadataLog>,
    ) -> Arc<Self> {
        assert_eq!(
            index_id == 0,
            pk.is_none(),
            "exactly the secondary indexes reference a primary",
        );

        let id = vylog.next_id();
        let range = Arc::new(Range::new(vylog.next_id(), None, None));

        let mut range_heap = IndexedHeap::new(range_heap_less, range_heap_pos);
        range_heap.insert(range.clone());

        Arc::new(Self {
            id,
            space_id,
            index_id,
            pk,
            config,
            vylog,
            mem_id: AtomicU64::new(1),
            active: RwLock::new(Arc::new(MemTree::new(0, 0))),
            sealed: RwLock::new(Vec::new()),
            ranges: RwLock::new(vec![range]),
            range_heap: Mutex::new(range_heap),
            runs: Mutex::new(Vec::new()),
            dump_lsn: AtomicU64::new(0),
            is_dropped: AtomicBool::new(false),
            is_dumping: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            in_dump: AtomicUsize::new(HEAP_POS_NONE),
            in_compact: AtomicUsize::new(HEAP_POS_NONE),
            counters: LsmCounters::default(),
        })
    }

    pub fn id(&self) -> LsmId {
        self.id
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub(crate) fn pk(&self) -> Option<&Arc<LsmTree>> {
        self.pk.as_ref()
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn vylog(&self) -> &Arc<MetadataLog> {
        &self.vylog
    }

    /// Foreground write path: appends a statement to the active in-memory
    /// tree, pinning it for the duration of the insert.
    pub fn insert(&self, stmt: Statement) {
        let mem = self.active.read().expect("lock is poisoned").clone();

        mem.pin();
        mem.insert(stmt);
        mem.unpin();
    }

    /// Generation of the oldest in-memory tree.
    pub fn generation(&self) -> u64 {
        let sealed = self.sealed.read().expect("lock is poisoned");

        match sealed.first() {
            Some(mem) => mem.generation(),
            None => self
                .active
                .read()
                .expect("lock is poisoned")
                .generation(),
        }
    }

    pub(crate) fn active_mem(&self) -> Arc<MemTree> {
        self.active.read().expect("lock is poisoned").clone()
    }

    /// Seals the active in-memory tree and opens a fresh one at
    /// `generation`.
    pub(crate) fn rotate_mem(&self, generation: u64) {
        // Lock order: sealed before active, same as generation()
        let mut sealed = self.sealed.write().expect("lock is poisoned");
        let mut active = self.active.write().expect("lock is poisoned");

        let id = self.mem_id.fetch_add(1, Relaxed);
        let fresh = Arc::new(MemTree::new(id, generation));

        sealed.push(std::mem::replace(&mut *active, fresh));

        log::debug!("{self}: rotated in-memory tree, generation {generation}");
    }

    /// Sealed in-memory trees, oldest first.
    pub(crate) fn sealed_mems(&self) -> Vec<Arc<MemTree>> {
        self.sealed.read().expect("lock is poisoned").clone()
    }

    pub(crate) fn delete_mem(&self, mem: &Arc<MemTree>) {
        self.sealed
            .write()
            .expect("lock is poisoned")
            .retain(|m| m.id() != mem.id());
    }

    pub fn is_dropped(&self) -> bool {
        self.is_dropped.load(Relaxed)
    }

    /// Marks the tree dropped. In-flight tasks abort silently; call
    /// `Scheduler::remove_lsm` afterwards.
    pub fn mark_dropped(&self) {
        self.is_dropped.store(true, Relaxed);
    }

    pub fn is_dumping(&self) -> bool {
        self.is_dumping.load(Relaxed)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Relaxed)
    }

    pub fn dump_lsn(&self) -> Option<Lsn> {
        match self.dump_lsn.load(Relaxed) {
            0 => None,
            lsn => Some(lsn),
        }
    }

    pub(crate) fn note_dump_lsn(&self, lsn: Lsn) {
        self.dump_lsn.fetch_max(lsn, Relaxed);
    }

    /// Snapshot of all ranges, ordered by begin key.
    pub fn ranges(&self) -> Vec<Arc<Range>> {
        self.ranges.read().expect("lock is poisoned").clone()
    }

    /// Ranges intersecting `[min, max]`, ordered by begin key.
    pub(crate) fn ranges_overlapping(&self, min: &UserKey, max: &UserKey) -> Vec<Arc<Range>> {
        self.ranges
            .read()
            .expect("lock is poisoned")
            .iter()
            .filter(|r| {
                r.begin().map_or(true, |b| **b <= **max)
                    && r.end().map_or(true, |e| **min < **e)
            })
            .cloned()
            .collect()
    }

    /// Compaction benefit of the most rewarding range; the scheduler
    /// treats this as opaque.
    pub(crate) fn compact_priority(&self) -> usize {
        self.range_heap
            .lock()
            .expect("lock is poisoned")
            .top()
            .map_or(0, |r| r.compact_priority())
    }

    pub(crate) fn update_range_heap(&self, range: &Arc<Range>) {
        let mut heap = self.range_heap.lock().expect("lock is poisoned");

        if heap.contains(range) {
            heap.update(range);
        }
    }

    /// Marks every range as needing compaction, regardless of shape.
    pub fn force_compaction(&self) {
        for range in self.ranges() {
            range.set_needs_compaction(true);
            range.update_compact_priority(self.config.run_count_per_level);
            self.update_range_heap(&range);
        }

        log::info!("{self}: forced compaction");
    }

    pub(crate) fn add_run(&self, run: Arc<Run>) {
        self.runs.lock().expect("lock is poisoned").push(run);
    }

    pub(crate) fn remove_run(&self, run: &Arc<Run>) {
        self.runs
            .lock()
            .expect("lock is poisoned")
            .retain(|r| r.id() != run.id());
    }

    pub(crate) fn run_count(&self) -> usize {
        self.runs.lock().expect("lock is poisoned").len()
    }

    pub(crate) fn acct_range(&self, range: &Range) {
        self.counters.disk_size.fetch_add(range.size(), Relaxed);
        let stmts: u64 = range.slices().iter().map(|s| s.count()).sum();
        self.counters.disk_stmts.fetch_add(stmts, Relaxed);
    }

    pub(crate) fn unacct_range(&self, range: &Range) {
        self.counters.disk_size.fetch_sub(range.size(), Relaxed);
        let stmts: u64 = range.slices().iter().map(|s| s.count()).sum();
        self.counters.disk_stmts.fetch_sub(stmts, Relaxed);
    }

    pub(crate) fn acct_dump(&self, in_stmts: u64, out: &RunInfo) {
        self.counters.dump_count.fetch_add(1, Relaxed);
        self.counters.dumped_in_stmts.fetch_add(in_stmts, Relaxed);
        self.counters.dumped_out_stmts.fetch_add(out.count, Relaxed);
    }

    pub(crate) fn acct_compaction(&self, in_stmts: u64, out: &RunInfo) {
        self.counters.compaction_count.fetch_add(1, Relaxed);
        self.counters
            .compacted_in_stmts
            .fetch_add(in_stmts, Relaxed);
        self.counters
            .compacted_out_stmts
            .fetch_add(out.count, Relaxed);
    }

    pub fn stats(&self) -> LsmTreeStats {
        LsmTreeStats {
            run_count: self.run_count(),
            range_count: self.ranges.read().expect("lock is poisoned").len(),
            sealed_mem_count: self.sealed.read().expect("lock is poisoned").len(),
            dump_count: self.counters.dump_count.load(Relaxed),
            dumped_in_stmts: self.counters.dumped_in_stmts.load(Relaxed),
            dumped_out_stmts: self.counters.dumped_out_stmts.load(Relaxed),
            compaction_count: self.counters.compaction_count.load(Relaxed),
            compacted_in_stmts: self.counters.compacted_in_stmts.load(Relaxed),
            compacted_out_stmts: self.counters.compacted_out_stmts.load(Relaxed),
            disk_size: self.counters.disk_size.load(Relaxed),
            disk_stmts: self.counters.disk_stmts.load(Relaxed),
        }
    }

    /// Splits a range that outgrew the target size at the median key of
    /// its largest slice. Returns `false` if the range does not need a
    /// split or the split could not be performed.
    pub(crate) fn split_range(&self, range: &Arc<Range>) -> bool {
        if range.size() <= self.config.range_size {
            return false;
        }

        let slices = range.slices();

        let Some(largest) = slices.iter().max_by_key(|s| s.size()) else {
            return false;
        };

        let mid = match self.median_key(largest) {
            Ok(Some(mid)) => mid,
            Ok(None) => return false,
            Err(e) => {
                log::error!("{self}: failed to find split key: {e}");
                return false;
            }
        };

        // Both halves must be non-empty key spans
        if range.begin().map_or(false, |b| *b >= mid)
            || range.end().map_or(false, |e| mid >= *e)
        {
            return false;
        }

        let left = Arc::new(Range::new(
            self.vylog.next_id(),
            range.begin().cloned(),
            Some(mid.clone()),
        ));
        let right = Arc::new(Range::new(
            self.vylog.next_id(),
            Some(mid.clone()),
            range.end().cloned(),
        ));

        let mut tx = self.vylog.begin();

        for slice in &slices {
            tx.write(VylogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }

        for half in [&left, &right] {
            // Oldest first, so that prepending restores newest-first order
            for slice in slices.iter().rev() {
                let begin = clip_max(slice.begin(), half.begin());
                let end = clip_min(slice.end(), half.end());

                if let (Some(b), Some(e)) = (&begin, &end) {
                    if b >= e {
                        continue;
                    }
                }

                let slice_id = self.vylog.next_id();
                tx.write(VylogRecord::InsertSlice {
                    range_id: half.id(),
                    run_id: slice.run().id(),
                    slice_id,
                    begin: begin.clone(),
                    end: end.clone(),
                });

                half.add_slice(Arc::new(Slice::new(
                    slice_id,
                    slice.run().clone(),
                    begin,
                    end,
                )));
            }
        }

        if let Err(e) = tx.commit() {
            log::error!("{self}: failed to log range split: {e}");
            return false;
        }

        self.unacct_range(range);

        {
            let mut ranges = self.ranges.write().expect("lock is poisoned");

            if let Some(pos) = ranges.iter().position(|r| r.id() == range.id()) {
                let _old: Vec<_> = ranges
                    .splice(pos..=pos, [left.clone(), right.clone()])
                    .collect();
            }
        }

        {
            let mut heap = self.range_heap.lock().expect("lock is poisoned");
            heap.remove(range);

            for half in [&left, &right] {
                half.update_compact_priority(self.config.run_count_per_level);
                heap.insert(half.clone());
            }
        }

        self.acct_range(&left);
        self.acct_range(&right);

        log::info!("{self}: split {range:?} at {mid:?}");
        true
    }

    /// Median user key of a slice, scanned from its run file.
    fn median_key(&self, slice: &Slice) -> crate::Result<Option<UserKey>> {
        let mut keys: Vec<UserKey> = Vec::new();

        for stmt in slice.scan(&self.config.path)? {
            let stmt = stmt?;

            if keys.last() != Some(&stmt.key) {
                keys.push(stmt.key);
            }
        }

        if keys.len() < 2 {
            return Ok(None);
        }

        Ok(keys.get(keys.len() / 2).cloned())
    }

    /// Merges a run of adjacent undersized ranges around `range` into one.
    /// Returns `false` if the range is not small enough or has no mergeable
    /// neighbors.
    pub(crate) fn coalesce_range(&self, range: &Arc<Range>) -> bool {
        let max_size = self.config.range_size / 2;

        if range.size() >= self.config.range_size / 4 {
            return false;
        }

        let ranges = self.ranges();

        let Some(idx) = ranges.iter().position(|r| r.id() == range.id()) else {
            return false;
        };

        let mut lo = idx;
        let mut hi = idx;
        let mut total = range.size();

        while lo > 0 {
            let prev = &ranges[lo - 1];
            if prev.is_scheduled() || total + prev.size() > max_size {
                break;
            }
            total += prev.size();
            lo -= 1;
        }

        while hi + 1 < ranges.len() {
            let next = &ranges[hi + 1];
            if next.is_scheduled() || total + next.size() > max_size {
                break;
            }
            total += next.size();
            hi += 1;
        }

        if lo == hi {
            return false;
        }

        let span = &ranges[lo..=hi];
        let merged = Arc::new(Range::new(
            self.vylog.next_id(),
            span.first().and_then(|r| r.begin().cloned()),
            span.last().and_then(|r| r.end().cloned()),
        ));

        // Newest-first across all constituents, by run freshness
        let mut old_slices: Vec<Arc<Slice>> =
            span.iter().flat_map(|r| r.slices()).collect();
        old_slices.sort_by(|a, b| b.run().dump_lsn().cmp(&a.run().dump_lsn()));

        let mut tx = self.vylog.begin();

        for slice in &old_slices {
            tx.write(VylogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }

        for slice in old_slices.iter().rev() {
            let slice_id = self.vylog.next_id();

            tx.write(VylogRecord::InsertSlice {
                range_id: merged.id(),
                run_id: slice.run().id(),
                slice_id,
                begin: slice.begin().cloned(),
                end: slice.end().cloned(),
            });

            merged.add_slice(Arc::new(Slice::new(
                slice_id,
                slice.run().clone(),
                slice.begin().cloned(),
                slice.end().cloned(),
            )));
        }

        if let Err(e) = tx.commit() {
            log::error!("{self}: failed to log range coalescing: {e}");
            return false;
        }

        for r in span {
            self.unacct_range(r);
        }

        {
            let mut all = self.ranges.write().expect("lock is poisoned");
            let _old: Vec<_> = all.splice(lo..=hi, [merged.clone()]).collect();
        }

        {
            let mut heap = self.range_heap.lock().expect("lock is poisoned");

            for r in span {
                if heap.contains(r) {
                    heap.remove(r);
                }
            }

            merged.update_compact_priority(self.config.run_count_per_level);
            heap.insert(merged.clone());
        }

        self.acct_range(&merged);

        log::info!("{self}: coalesced {} ranges into {merged:?}", span.len());
        true
    }
}

impl std::fmt::Display for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.space_id, self.index_id)
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsmTree({self})")
    }
}

fn clip_max(a: Option<&UserKey>, b: Option<&UserKey>) -> Option<UserKey> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => Some(std::cmp::max(x, y).clone()),
    }
}

fn clip_min(a: Option<&UserKey>, b: Option<&UserKey>) -> Option<UserKey> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => Some(std::cmp::min(x, y).clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::LsmTree;
    use crate::errinj::ErrorInjection;
    use crate::run::Run;
    use crate::run_writer::{RunWriter, RunWriterOptions};
    use crate::slice::Slice;
    use crate::value::Statement;
    use crate::vylog::MetadataLog;
    use crate::Config;
    use std::sync::Arc;
    use test_log::test;

    fn tree_fixture(dir: &std::path::Path, range_size: u64) -> Arc<LsmTree> {
        let errinj = Arc::new(ErrorInjection::new());
        let config = Arc::new(
            Config::new(dir)
                .range_size(range_size)
                .run_count_per_level(1),
        );
        let vylog = Arc::new(MetadataLog::new(errinj));
        LsmTree::new(42, 0, None, config, vylog)
    }

    fn attach_run(tree: &Arc<LsmTree>, keys: &[&str], lsn: u64) -> crate::Result<()> {
        let id = tree.vylog().next_id();
        let mut writer = RunWriter::new(
            &tree.config().path,
            id,
            RunWriterOptions {
                bloom_fpr: 0.05,
                page_size: 4_096,
            },
        );

        for key in keys {
            writer.append(&Statement::new_value(*key, "xxxxxxxx", lsn))?;
        }

        let run = Arc::new(Run::new(id));
        run.note_dump_lsn(lsn);
        run.set_info(writer.commit()?);

        let ranges = tree.ranges();
        let range = ranges.first().expect("tree has a range");
        range.add_slice(Arc::new(Slice::new(
            tree.vylog().next_id(),
            run.clone(),
            None,
            None,
        )));
        tree.add_run(run);

        Ok(())
    }

    #[test]
    fn generation_follows_oldest_mem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = tree_fixture(dir.path(), u64::MAX);

        assert_eq!(0, tree.generation());

        tree.insert(Statement::new_value("a", "1", 1));
        tree.rotate_mem(3);
        assert_eq!(0, tree.generation(), "sealed tree is older");

        let sealed = tree.sealed_mems();
        tree.delete_mem(sealed.first().expect("one sealed mem"));
        assert_eq!(3, tree.generation(), "active tree remains");
    }

    #[test]
    fn split_range_divides_slices() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = tree_fixture(dir.path(), 1);

        attach_run(&tree, &["a", "b", "c", "d", "e", "f"], 1)?;

        let ranges = tree.ranges();
        let range = ranges.first().expect("tree has a range").clone();
        assert!(range.size() > 1);

        assert!(tree.split_range(&range));

        let ranges = tree.ranges();
        assert_eq!(2, ranges.len());
        assert_eq!(None, ranges[0].begin());
        assert_eq!(ranges[0].end(), ranges[1].begin());
        assert_eq!(None, ranges[1].end());
        assert_eq!(1, ranges[0].slice_count());
        assert_eq!(1, ranges[1].slice_count());

        Ok(())
    }

    #[test]
    fn coalesce_range_merges_neighbors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = tree_fixture(dir.path(), 1_000);

        // Manufacture three adjacent empty ranges
        let splinters: Vec<_> = [
            (None, Some("h".into())),
            (Some("h".into()), Some("p".into())),
            (Some("p".into()), None),
        ]
        .into_iter()
        .map(|(begin, end)| Arc::new(crate::range::Range::new(tree.vylog().next_id(), begin, end)))
        .collect();

        {
            let mut heap = tree.range_heap.lock().expect("lock is poisoned");
            let mut ranges = tree.ranges.write().expect("lock is poisoned");

            for old in ranges.drain(..) {
                heap.remove(&old);
            }

            for r in &splinters {
                ranges.push(r.clone());
                heap.insert(r.clone());
            }
        }

        assert!(tree.coalesce_range(&splinters[1]));

        let ranges = tree.ranges();
        assert_eq!(1, ranges.len());
        assert_eq!(None, ranges[0].begin());
        assert_eq!(None, ranges[0].end());
    }

    #[test]
    fn force_compaction_raises_priority() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = tree_fixture(dir.path(), u64::MAX);

        attach_run(&tree, &["a", "b"], 1)?;
        attach_run(&tree, &["a", "c"], 2)?;

        tree.force_compaction();
        assert_eq!(2, tree.compact_priority());

        Ok(())
    }

    #[test]
    fn ranges_overlapping_filters_by_key() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = tree_fixture(dir.path(), 1);

        attach_run(&tree, &["a", "b", "c", "d", "e", "f"], 1)?;
        let ranges = tree.ranges();
        let range = ranges.first().expect("tree has a range").clone();
        assert!(tree.split_range(&range));

        let ranges = tree.ranges();
        let split_key = ranges[1].begin().expect("right half is bounded").clone();

        let hits = tree.ranges_overlapping(&"a".into(), &"b".into());
        assert_eq!(1, hits.len());

        let hits = tree.ranges_overlapping(&"a".into(), &split_key);
        assert_eq!(2, hits.len());

        Ok(())
    }
}
