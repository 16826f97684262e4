// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::deferred::DeferredDeleteChannel;
use crate::errinj::ErrorInjection;
use crate::lsm::LsmTree;
use crate::range::Range;
use crate::run::Run;
use crate::run_writer::{RunWriter, RunWriterOptions};
use crate::scheduler::{SchedulerShared, SchedulerState};
use crate::slice::{Slice, SliceId};
use crate::stop_signal::StopSignal;
use crate::vylog::VylogRecord;
use crate::worker::WorkerHandle;
use crate::write_iterator::WriteIterator;
use crate::{Error, Lsn};
use std::sync::{Arc, Mutex};

/// Yield every this many appended statements to keep a task fiber
/// cooperative.
const YIELD_LOOPS: usize = 32;

pub(crate) enum TaskWork {
    Dump,
    Compact {
        range: Arc<Range>,

        /// Newest and oldest slice under compaction. A concurrent dump may
        /// prepend newer slices while the task runs; these delimit the
        /// frozen sub-list.
        first_slice: SliceId,
        last_slice: SliceId,
    },
}

/// A unit of background work: `execute` runs on a worker thread, then tx
/// runs `complete` (or `abort` on failure).
///
/// The task owns its new run until completion transfers it to the LSM
/// tree; it borrows the LSM tree (keeping it alive via `Arc`) and the
/// worker.
pub(crate) struct Task {
    pub(crate) shared: Arc<SchedulerShared>,
    pub(crate) lsm: Arc<LsmTree>,
    pub(crate) worker: WorkerHandle,

    work: TaskWork,

    new_run: Arc<Run>,
    wi: Option<WriteIterator>,

    /// Index options snapshotted at creation so a concurrent alter does
    /// not race the worker thread.
    writer_opts: RunWriterOptions,

    /// Raised by the deferred DELETE free hop (or shutdown) to interrupt
    /// the task at its next yield point.
    cancel: StopSignal,

    /// First deferred DELETE failure, captured on the worker thread.
    deferred_failure: Arc<Mutex<Option<Error>>>,

    /// Set if the task failed.
    pub(crate) is_failed: bool,

    /// In case of task failure the error is stored here.
    pub(crate) error: Option<Error>,
}

impl Task {
    fn new(
        shared: Arc<SchedulerShared>,
        lsm: Arc<LsmTree>,
        worker: WorkerHandle,
        work: TaskWork,
        new_run: Arc<Run>,
        wi: WriteIterator,
        cancel: StopSignal,
        deferred_failure: Arc<Mutex<Option<Error>>>,
    ) -> Self {
        let writer_opts = RunWriterOptions {
            bloom_fpr: shared.config.bloom_fpr,
            page_size: shared.config.page_size,
        };

        Self {
            shared,
            lsm,
            worker,
            work,
            new_run,
            wi: Some(wi),
            writer_opts,
            cancel,
            deferred_failure,
            is_failed: false,
            error: None,
        }
    }

    fn stall_while(&self, flag: &std::sync::atomic::AtomicBool) {
        while ErrorInjection::is_on(flag)
            && !self.shared.stop.is_stopped()
            && !self.cancel.is_stopped()
        {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    /// Worker-thread half of the task: drive the write iterator into the
    /// run writer and commit it.
    pub fn execute(&mut self) -> crate::Result<()> {
        let errinj = &self.shared.config.errinj;

        if ErrorInjection::is_on(&errinj.run_write) {
            return Err(Error::Injected("vinyl dump"));
        }

        self.stall_while(&errinj.run_write_delay);

        if matches!(self.work, TaskWork::Compact { .. }) {
            self.stall_while(&errinj.compaction_delay);
        }

        self.write_run()
    }

    fn write_run(&mut self) -> crate::Result<()> {
        let mut writer = RunWriter::new(
            &self.shared.config.path,
            self.new_run.id(),
            self.writer_opts,
        );

        let result = self.pump(&mut writer);

        // Flushes pending deferred DELETEs and waits until tx has
        // acknowledged them all
        if let Some(wi) = self.wi.as_mut() {
            wi.stop();
        }

        // A batch failure during the final flush surfaces here
        let result = result.and_then(|()| {
            match self
                .deferred_failure
                .lock()
                .expect("lock is poisoned")
                .take()
            {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });

        match result {
            Ok(()) => {
                if ErrorInjection::is_on(&self.shared.config.errinj.run_write_commit) {
                    writer.abort();
                    return Err(Error::Injected("vinyl run commit"));
                }

                let info = writer.commit()?;
                self.new_run.set_info(info);
                Ok(())
            }
            Err(e) => {
                writer.abort();

                // Prefer the root cause over the bare cancellation
                if matches!(e, Error::Cancelled) {
                    if let Some(cause) = self
                        .deferred_failure
                        .lock()
                        .expect("lock is poisoned")
                        .take()
                    {
                        return Err(cause);
                    }
                }

                Err(e)
            }
        }
    }

    fn pump(&mut self, writer: &mut RunWriter) -> crate::Result<()> {
        let wi = self.wi.as_mut().expect("task has a write iterator");
        wi.start()?;

        let mut loops = 0;

        while let Some(stmt) = wi.next()? {
            writer.append(&stmt)?;

            loops += 1;
            if loops % YIELD_LOOPS == 0 {
                std::thread::yield_now();
            }

            if self.shared.stop.is_stopped() || self.cancel.is_stopped() {
                return Err(Error::Cancelled);
            }
        }

        Ok(())
    }

    /// tx-thread half of the task after a successful execute: attach the
    /// run to the LSM tree and journal the turnover.
    pub fn complete(
        &mut self,
        shared: &Arc<SchedulerShared>,
        state: &mut SchedulerState,
    ) -> crate::Result<()> {
        match self.work {
            TaskWork::Dump => self.complete_dump(shared, state),
            TaskWork::Compact { .. } => self.complete_compact(shared, state),
        }
    }

    /// tx-thread cleanup after a failed execute or complete. Must not
    /// fail itself.
    pub fn abort(&mut self, shared: &Arc<SchedulerShared>, state: &mut SchedulerState) {
        match self.work {
            TaskWork::Dump => self.abort_dump(shared, state),
            TaskWork::Compact { .. } => self.abort_compact(shared, state),
        }
    }

    fn complete_dump(
        &mut self,
        shared: &Arc<SchedulerShared>,
        state: &mut SchedulerState,
    ) -> crate::Result<()> {
        let lsm = &self.lsm;
        let new_run = &self.new_run;
        let dump_lsn = new_run.dump_lsn();

        debug_assert!(lsm.is_dumping());

        if new_run.is_empty() {
            // The write iterator optimized everything away. No run to
            // attach, but the dump itself must still be journaled.
            let mut tx = shared.vylog.begin();
            tx.write(VylogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn,
            });
            tx.commit()?;

            discard_run(shared, new_run);
        } else {
            let info = new_run.info().cloned().unwrap_or_default();

            let min_key = info.min_key.clone().expect("non-empty run has keys");
            let max_key = info.max_key.clone().expect("non-empty run has keys");
            let ranges = lsm.ranges_overlapping(&min_key, &max_key);
            debug_assert!(!ranges.is_empty());

            let new_slices: Vec<(Arc<Range>, Arc<Slice>)> = ranges
                .iter()
                .map(|range| {
                    let slice = Arc::new(Slice::new(
                        shared.vylog.next_id(),
                        new_run.clone(),
                        range.begin().cloned(),
                        range.end().cloned(),
                    ));
                    (range.clone(), slice)
                })
                .collect();

            let mut tx = shared.vylog.begin();
            tx.write(VylogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: new_run.id(),
                dump_lsn,
            });

            for (range, slice) in &new_slices {
                tx.write(VylogRecord::InsertSlice {
                    range_id: range.id(),
                    run_id: new_run.id(),
                    slice_id: slice.id(),
                    begin: slice.begin().cloned(),
                    end: slice.end().cloned(),
                });
            }

            tx.write(VylogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn,
            });
            tx.commit()?;

            lsm.add_run(new_run.clone());

            // Attach the slices in one go. No blocking is permitted
            // between the first and last attachment, or a concurrent
            // reader could see a statement both in memory and on disk.
            for (range, slice) in new_slices {
                lsm.unacct_range(&range);
                range.add_slice(slice);
                range.update_compact_priority(shared.config.run_count_per_level);
                lsm.acct_range(&range);

                if !range.is_scheduled() {
                    lsm.update_range_heap(&range);
                }

                range.bump_version();
            }
        }

        // Delete the dumped in-memory trees
        let mut in_stmts: u64 = 0;

        for mem in lsm.sealed_mems() {
            if mem.generation() > state.dump_generation {
                continue;
            }

            in_stmts += mem.len() as u64;
            lsm.delete_mem(&mem);
        }

        if let Some(lsn) = dump_lsn {
            lsm.note_dump_lsn(lsn);
        }

        lsm.acct_dump(in_stmts, &new_run.info().cloned().unwrap_or_default());

        lsm.is_dumping
            .store(false, std::sync::atomic::Ordering::Relaxed);
        state.update_lsm(lsm);

        if lsm.index_id() != 0 {
            if let Some(pk) = lsm.pk().cloned() {
                state.unpin_lsm(&pk);
            }
        }

        debug_assert!(state.dump_task_count > 0);
        state.dump_task_count -= 1;

        log::info!("{lsm}: dump completed");

        state.complete_dump(shared);
        Ok(())
    }

    fn abort_dump(&mut self, shared: &Arc<SchedulerShared>, state: &mut SchedulerState) {
        let lsm = &self.lsm;

        debug_assert!(lsm.is_dumping());

        // No point alerting anyone on shutdown or drop
        if !lsm.is_dropped() {
            if let Some(e) = &self.error {
                log::error!("{lsm}: dump failed: {e}");
            } else {
                log::error!("{lsm}: dump failed");
            }
        }

        discard_run(shared, &self.new_run);

        lsm.is_dumping
            .store(false, std::sync::atomic::Ordering::Relaxed);
        state.update_lsm(lsm);

        if lsm.index_id() != 0 {
            if let Some(pk) = lsm.pk().cloned() {
                state.unpin_lsm(&pk);
            }
        }

        debug_assert!(state.dump_task_count > 0);
        state.dump_task_count -= 1;

        // A dropped LSM tree must not wedge the dump round: it will never
        // be rescheduled, so check for round completion here.
        if lsm.is_dropped() {
            state.complete_dump(shared);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn complete_compact(
        &mut self,
        shared: &Arc<SchedulerShared>,
        state: &mut SchedulerState,
    ) -> crate::Result<()> {
        let TaskWork::Compact {
            range,
            first_slice,
            last_slice,
        } = &self.work
        else {
            unreachable!("compact completion on a dump task");
        };

        let lsm = &self.lsm;
        let new_run = &self.new_run;

        let slices = range.slices();
        let lo = slices
            .iter()
            .position(|s| s.id() == *first_slice)
            .expect("compacted slices are frozen in the range");
        let hi = slices
            .iter()
            .position(|s| s.id() == *last_slice)
            .expect("compacted slices are frozen in the range");
        let compacted = &slices[lo..=hi];

        // If the new run is empty we still have to delete the compacted
        // slices, just with nothing to put in their place.
        let new_slice = if new_run.is_empty() {
            None
        } else {
            Some(Arc::new(Slice::new(
                shared.vylog.next_id(),
                new_run.clone(),
                None,
                None,
            )))
        };

        // Runs all of whose slices were just compacted become garbage.
        // Count participating slices per run, then collect runs where
        // every live slice participated.
        use std::sync::atomic::Ordering::Relaxed;

        let mut unused_runs: Vec<Arc<Run>> = Vec::new();

        for slice in compacted {
            slice.run().compacted_slice_count.fetch_add(1, Relaxed);
        }

        for slice in compacted {
            let run = slice.run();

            if run.compacted_slice_count.load(Relaxed) == run.slice_count.load(Relaxed) {
                unused_runs.push(run.clone());
            }

            run.compacted_slice_count.store(0, Relaxed);
        }

        let gc_lsn = shared.vylog.signature();

        let mut tx = shared.vylog.begin();

        for slice in compacted {
            tx.write(VylogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }

        for run in &unused_runs {
            tx.write(VylogRecord::DropRun {
                run_id: run.id(),
                gc_lsn,
            });
        }

        if let Some(slice) = &new_slice {
            tx.write(VylogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: new_run.id(),
                dump_lsn: new_run.dump_lsn(),
            });
            tx.write(VylogRecord::InsertSlice {
                range_id: range.id(),
                run_id: new_run.id(),
                slice_id: slice.id(),
                begin: None,
                end: None,
            });
        }

        tx.commit()?;

        // Compacted runs created after the last checkpoint are not
        // referenced by any checkpoint; remove their files right away to
        // save disk space. A crash between removal and the forget-run
        // record is tolerated, restart recovery re-deletes orphans.
        let mut tx = shared.vylog.begin();

        for run in &unused_runs {
            if run.dump_lsn().map_or(false, |lsn| lsn > gc_lsn)
                && run.remove_files(&shared.config.path).is_ok()
            {
                tx.write(VylogRecord::ForgetRun { run_id: run.id() });
            }
        }

        tx.try_commit();

        if new_slice.is_some() {
            lsm.add_run(new_run.clone());
        } else {
            discard_run(shared, new_run);
        }

        // Swap the compacted slices for the new one at the same list
        // position; newer slices from a concurrent dump stay above.
        lsm.unacct_range(range);
        let removed = range.replace_slices(*first_slice, *last_slice, new_slice);
        let in_stmts: u64 = removed.iter().map(|s| s.count()).sum();

        range.note_compaction();
        range.bump_version();
        range.update_compact_priority(shared.config.run_count_per_level);
        lsm.acct_range(range);
        lsm.acct_compaction(in_stmts, &new_run.info().cloned().unwrap_or_default());

        for run in &unused_runs {
            lsm.remove_run(run);
        }

        drop(removed);

        // Give the range back to the range heap
        debug_assert!(range.is_scheduled());
        lsm.range_heap
            .lock()
            .expect("lock is poisoned")
            .insert(range.clone());
        state.update_lsm(lsm);

        log::info!("{lsm}: completed compacting {range:?}");
        Ok(())
    }

    fn abort_compact(&mut self, shared: &Arc<SchedulerShared>, state: &mut SchedulerState) {
        let TaskWork::Compact { range, .. } = &self.work else {
            unreachable!("compact abort on a dump task");
        };

        let lsm = &self.lsm;

        if !lsm.is_dropped() {
            if let Some(e) = &self.error {
                log::error!("{lsm}: failed to compact {range:?}: {e}");
            } else {
                log::error!("{lsm}: failed to compact {range:?}");
            }
        }

        discard_run(shared, &self.new_run);

        debug_assert!(range.is_scheduled());
        lsm.range_heap
            .lock()
            .expect("lock is poisoned")
            .insert(range.clone());
        state.update_lsm(lsm);
    }
}

/// Allocates a run and journals its existence, so it can be found and
/// deleted even if the task fails before attaching it.
fn prepare_run(shared: &Arc<SchedulerShared>, lsm: &Arc<LsmTree>) -> crate::Result<Arc<Run>> {
    let run = Arc::new(Run::new(shared.vylog.next_id()));

    let mut tx = shared.vylog.begin();
    tx.write(VylogRecord::PrepareRun {
        lsm_id: lsm.id(),
        run_id: run.id(),
    });
    tx.commit()?;

    Ok(run)
}

/// Journals that an unused run can be dropped. Called on task abort and
/// for empty runs; must not fail, so a vylog error leaves the record
/// pending for replay and restart recovery deletes the orphan file.
fn discard_run(shared: &Arc<SchedulerShared>, run: &Arc<Run>) {
    if ErrorInjection::is_on(&shared.config.errinj.run_discard) {
        log::error!("error injection: run {} not discarded", run.id());
        return;
    }

    let mut tx = shared.vylog.begin();

    // The run was never referenced by a checkpoint, gc_lsn 0 means it can
    // be deleted right away
    tx.write(VylogRecord::DropRun {
        run_id: run.id(),
        gc_lsn: 0,
    });
    tx.try_commit();
}

/// Creates a dump task for `lsm`. Returns `Ok(None)` if every eligible
/// in-memory tree turned out empty (they are deleted on the spot).
pub(crate) fn task_dump_new(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
    worker: WorkerHandle,
    lsm: &Arc<LsmTree>,
) -> crate::Result<Option<Box<Task>>> {
    debug_assert!(!lsm.is_dropped());
    debug_assert!(!lsm.is_dumping());
    debug_assert_eq!(0, lsm.pin_count());
    debug_assert_eq!(lsm.generation(), state.dump_generation);
    debug_assert!(state.dump_generation < state.generation);

    let errinj = &shared.config.errinj;
    if errinj.index_dump.load(std::sync::atomic::Ordering::Relaxed) == i64::from(lsm.index_id()) {
        return Err(Error::Injected("vinyl index dump"));
    }

    // Rotate the active tree if it holds data of the dumped round
    if lsm.active_mem().generation() == state.dump_generation {
        lsm.rotate_mem(state.generation);
    }

    // Wait until all active writes to the trees eligible for dump are
    // over; empty trees are deleted without involving a worker.
    let mut dump_lsn: Option<Lsn> = None;
    let mut mems = Vec::new();

    for mem in lsm.sealed_mems() {
        if mem.generation() > state.dump_generation {
            continue;
        }

        mem.wait_pinned();

        if mem.is_empty() {
            lsm.delete_mem(&mem);
            continue;
        }

        dump_lsn = dump_lsn.max(mem.dump_lsn());
        mems.push(mem);
    }

    if dump_lsn.is_none() {
        // Nothing to do; this tree is done with the round
        state.update_lsm(lsm);
        state.complete_dump(shared);
        return Ok(None);
    }

    let new_run = prepare_run(shared, lsm)?;

    if let Some(lsn) = dump_lsn {
        new_run.note_dump_lsn(lsn);
    }

    // Deferred DELETEs are generated on tx commit when the overwritten
    // tuple is found in memory, so a dump never produces any and no
    // handler is attached.
    let mut wi = WriteIterator::new(
        shared.config.path.clone(),
        lsm.index_id() == 0,
        lsm.run_count() == 0,
        shared.read_views.snapshot(),
        None,
    );

    for mem in &mems {
        wi.add_mem(mem.clone());
    }

    let task = Task::new(
        shared.clone(),
        lsm.clone(),
        worker,
        TaskWork::Dump,
        new_run,
        wi,
        StopSignal::default(),
        Arc::new(Mutex::new(None)),
    );

    lsm.is_dumping
        .store(true, std::sync::atomic::Ordering::Relaxed);
    state.update_lsm(lsm);

    // The primary must be dumped after every secondary of its space, or
    // WAL replay could find the primary ahead of a secondary. Pin it so
    // the dump heap cannot pick it until this task finishes.
    if lsm.index_id() != 0 {
        if let Some(pk) = lsm.pk().cloned() {
            state.pin_lsm(&pk);
        }
    }

    state.dump_task_count += 1;

    log::info!("{lsm}: dump started");
    Ok(Some(Box::new(task)))
}

/// Creates a compaction task for the most rewarding range of `lsm`.
/// Returns `Ok(None)` if the range had to be split or coalesced first;
/// the caller retries with the updated heap.
pub(crate) fn task_compact_new(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
    worker: WorkerHandle,
    lsm: &Arc<LsmTree>,
) -> crate::Result<Option<Box<Task>>> {
    debug_assert!(!lsm.is_dropped());

    let Some(range) = lsm
        .range_heap
        .lock()
        .expect("lock is poisoned")
        .top()
        .cloned()
    else {
        return Ok(None);
    };

    debug_assert!(range.compact_priority() > 1);

    if lsm.split_range(&range) || lsm.coalesce_range(&range) {
        state.update_lsm(lsm);
        return Ok(None);
    }

    let new_run = prepare_run(shared, lsm)?;

    let slices = range.slices();
    let n = range.compact_priority().min(slices.len());
    let chosen = &slices[..n];
    debug_assert!(!chosen.is_empty());

    let is_last_level = n == slices.len();

    let cancel = StopSignal::default();
    let deferred_failure = Arc::new(Mutex::new(None));

    // Only primary-index compaction can discover overwrites the secondary
    // indexes never saw
    let handler = if lsm.index_id() == 0 {
        Some(Box::new(DeferredDeleteChannel::new(
            shared.clone(),
            lsm.clone(),
            cancel.clone(),
            deferred_failure.clone(),
        )) as Box<dyn crate::write_iterator::DeferredDeleteHandler>)
    } else {
        None
    };

    let mut wi = WriteIterator::new(
        shared.config.path.clone(),
        lsm.index_id() == 0,
        is_last_level,
        shared.read_views.snapshot(),
        handler,
    );

    for slice in chosen {
        wi.add_slice(slice.clone());

        if let Some(lsn) = slice.run().dump_lsn() {
            new_run.note_dump_lsn(lsn);
        }
    }

    debug_assert!(new_run.dump_lsn().is_some());

    let first_slice = chosen.first().expect("chosen is non-empty").id();
    let last_slice = chosen.last().expect("chosen is non-empty").id();

    range.set_needs_compaction(false);

    let task = Task::new(
        shared.clone(),
        lsm.clone(),
        worker,
        TaskWork::Compact {
            range: range.clone(),
            first_slice,
            last_slice,
        },
        new_run,
        wi,
        cancel,
        deferred_failure,
    );

    // Take the range out of the heap so no second task targets it
    lsm.range_heap
        .lock()
        .expect("lock is poisoned")
        .remove(&range);
    state.update_lsm(lsm);

    log::info!(
        "{lsm}: started compacting {range:?}, runs {n}/{}",
        slices.len(),
    );
    Ok(Some(Box::new(task)))
}
