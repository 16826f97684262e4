// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::Config;
use crate::deferred::{DeferredDeleteBatch, DeferredDeleteEntry, DeferredDeleteSink};
use crate::errinj::ErrorInjection;
use crate::heap::{IndexedHeap, HEAP_POS_NONE};
use crate::lsm::LsmTree;
use crate::read_view::ReadViewSet;
use crate::stop_signal::StopSignal;
use crate::task::{task_compact_new, task_dump_new, Task};
use crate::value::Statement;
use crate::vylog::MetadataLog;
use crate::worker::{PoolKind, WorkerHandle, WorkerPool};
use crate::Error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Min and max throttle timeout, seconds.
const TIMEOUT_MIN: f64 = 1.0;
const TIMEOUT_MAX: f64 = 60.0;

/// Invoked on the tx thread when a dump round completes, with the
/// generation that was dumped and the round duration. Used for memory
/// release and dump-bandwidth accounting. Must not call back into the
/// scheduler.
pub type DumpCompleteCallback = Box<dyn Fn(u64, Duration) + Send + Sync>;

fn dump_heap_less(a: &Arc<LsmTree>, b: &Arc<LsmTree>) -> bool {
    // Trees that are being dumped or can't be scheduled right now are
    // moved off the top of the heap
    if a.is_dumping() != b.is_dumping() {
        return !a.is_dumping();
    }

    if a.pin_count() != b.pin_count() {
        return a.pin_count() < b.pin_count();
    }

    // Older trees are dumped first
    let (a_gen, b_gen) = (a.generation(), b.generation());
    if a_gen != b_gen {
        return a_gen < b_gen;
    }

    // On WAL replay, appending to a space reads the primary index to find
    // the old tuple for its secondary indexes, so the primary must never
    // be ahead of them on disk: it is dumped last.
    a.index_id() > b.index_id()
}

fn dump_heap_pos(lsm: &Arc<LsmTree>) -> &AtomicUsize {
    &lsm.in_dump
}

fn compact_heap_less(a: &Arc<LsmTree>, b: &Arc<LsmTree>) -> bool {
    // Prefer trees whose read amplification shrinks the most
    a.compact_priority() > b.compact_priority()
}

fn compact_heap_pos(lsm: &Arc<LsmTree>) -> &AtomicUsize {
    &lsm.in_compact
}

/// Scheduler state behind the tx mutex.
pub(crate) struct SchedulerState {
    /// Current dump round; bumped to demand a new dump.
    pub(crate) generation: u64,

    /// Oldest round with un-dumped data; a dump is in progress iff it
    /// trails `generation`.
    pub(crate) dump_generation: u64,

    pub(crate) dump_task_count: usize,
    dump_start: Option<Instant>,

    checkpoint_in_progress: bool,

    /// A dump was requested while a checkpoint held it off.
    dump_pending: bool,

    is_throttled: bool,

    /// Back-off seconds after a failed task; doubles per failure within
    /// [TIMEOUT_MIN, TIMEOUT_MAX], reset on the first success.
    timeout: f64,

    /// Last fatal error, reported to `dump`/`begin_checkpoint` callers
    /// while throttled.
    last_error: Option<Arc<Error>>,

    processed: VecDeque<Box<Task>>,
    deferred: VecDeque<DeferredDeleteBatch>,

    pub(crate) dump_heap: IndexedHeap<Arc<LsmTree>>,
    pub(crate) compact_heap: IndexedHeap<Arc<LsmTree>>,

    dump_pool: WorkerPool,
    compact_pool: WorkerPool,

    shutdown: bool,
}

impl SchedulerState {
    pub(crate) fn dump_in_progress(&self) -> bool {
        self.dump_generation < self.generation
    }

    fn pool(&self, kind: PoolKind) -> &WorkerPool {
        match kind {
            PoolKind::Dump => &self.dump_pool,
            PoolKind::Compact => &self.compact_pool,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut WorkerPool {
        match kind {
            PoolKind::Dump => &mut self.dump_pool,
            PoolKind::Compact => &mut self.compact_pool,
        }
    }

    /// Re-sifts the tree in both heaps after its ordering keys changed.
    pub(crate) fn update_lsm(&mut self, lsm: &Arc<LsmTree>) {
        if lsm.is_dropped() {
            // Dropped trees are exempted from scheduling
            debug_assert!(!self.dump_heap.contains(lsm));
            debug_assert!(!self.compact_heap.contains(lsm));
            return;
        }

        if self.dump_heap.contains(lsm) {
            self.dump_heap.update(lsm);
        }

        if self.compact_heap.contains(lsm) {
            self.compact_heap.update(lsm);
        }
    }

    /// Holds `lsm` off the dump heap top until unpinned.
    pub(crate) fn pin_lsm(&mut self, lsm: &Arc<LsmTree>) {
        debug_assert!(!lsm.is_dumping());

        if lsm.pin_count.fetch_add(1, Relaxed) == 0 {
            self.update_lsm(lsm);
        }
    }

    pub(crate) fn unpin_lsm(&mut self, lsm: &Arc<LsmTree>) {
        debug_assert!(!lsm.is_dumping());
        debug_assert!(lsm.pin_count() > 0);

        if lsm.pin_count.fetch_sub(1, Relaxed) == 1 {
            self.update_lsm(lsm);
        }
    }

    /// Checks whether the current dump round is over; if so, advances
    /// `dump_generation`, reports bandwidth and wakes round waiters.
    pub(crate) fn complete_dump(&mut self, shared: &Arc<SchedulerShared>) {
        debug_assert!(self.dump_in_progress());

        if self.dump_task_count > 0 {
            // Dump tasks still in flight, the round can't be over yet
            return;
        }

        let min_generation = self
            .dump_heap
            .top()
            .map_or(self.generation, |lsm| lsm.generation());

        if min_generation == self.dump_generation {
            // Some tree still holds data of the current round
            return;
        }

        let now = Instant::now();
        let dump_duration = self
            .dump_start
            .map_or(Duration::ZERO, |start| now.duration_since(start));
        self.dump_start = Some(now);
        self.dump_generation = min_generation;

        (shared.dump_complete_cb)(min_generation - 1, dump_duration);
        shared.dump_cond.notify_all();
    }

    fn trigger_dump(&mut self, shared: &Arc<SchedulerShared>) {
        if self.dump_in_progress() {
            // Already dumping, nothing to do
            return;
        }

        if self.checkpoint_in_progress {
            // No dump may start until the checkpoint completes, or
            // statements inserted after WAL rotation could leak into
            // the snapshot
            self.dump_pending = true;
            return;
        }

        self.dump_start = Some(Instant::now());
        self.generation += 1;
        self.dump_pending = false;
        shared.scheduler_cond.notify_all();
    }

    fn throttled_error(&self) -> Error {
        match &self.last_error {
            Some(e) => Error::Throttled(e.clone()),
            None => Error::Cancelled,
        }
    }
}

/// Everything the tx loop, workers and API handles share.
pub(crate) struct SchedulerShared {
    pub(crate) state: Mutex<SchedulerState>,

    /// Wakes the scheduler loop: new completions, deferred batches, or a
    /// generation bump.
    pub(crate) scheduler_cond: Condvar,

    /// Wakes dump-round waiters (`dump`, `wait_checkpoint`).
    pub(crate) dump_cond: Condvar,

    pub(crate) config: Arc<Config>,
    pub(crate) vylog: Arc<MetadataLog>,
    pub(crate) sink: Arc<dyn DeferredDeleteSink>,
    pub(crate) dump_complete_cb: DumpCompleteCallback,
    pub(crate) read_views: ReadViewSet,

    /// Raised once on shutdown; tasks observe it at yield points.
    pub(crate) stop: StopSignal,

    /// High-water mark of deferred DELETE batches in flight for any one
    /// task; cannot exceed the in-flight cap.
    pub(crate) deferred_inflight_hwm: AtomicUsize,
}

impl SchedulerShared {
    /// Worker → tx completion route.
    pub(crate) fn push_processed(&self, task: Box<Task>) {
        self.state
            .lock()
            .expect("lock is poisoned")
            .processed
            .push_back(task);
        self.scheduler_cond.notify_all();
    }

    /// Worker → tx deferred DELETE route, first hop.
    pub(crate) fn push_deferred(&self, batch: DeferredDeleteBatch) {
        self.state
            .lock()
            .expect("lock is poisoned")
            .deferred
            .push_back(batch);
        self.scheduler_cond.notify_all();
    }

    /// tx side of the deferred DELETE route: publish the batch through the
    /// `_deferred_delete` space and send it back to the worker that made
    /// it (second hop), which releases the statements and cancels the task
    /// on failure.
    pub(crate) fn process_deferred_batch(&self, mut batch: DeferredDeleteBatch) {
        // A space can be dropped while its compaction is in flight; the
        // statements are still released by the worker-side hop.
        if !batch.pk.is_dropped() {
            let result = (|| -> crate::Result<()> {
                let mut tx = self.sink.begin()?;

                for stmt in &batch.stmts {
                    let entry = DeferredDeleteEntry {
                        space_id: batch.pk.space_id(),
                        lsn: stmt.new.lsn,
                        delete: Statement::surrogate_delete(&stmt.old, stmt.new.lsn),
                    };
                    tx.replace(&entry)?;
                }

                tx.commit()
            })();

            if let Err(e) = result {
                log::error!("failed to process deferred DELETE batch: {e}");
                batch.is_failed = true;
                batch.error = Some(e);
            }
        }

        let reply = batch.reply.clone();
        let _ = reply.send(batch);
    }
}

/// Runs `complete` or `abort` of a processed task on the tx thread.
/// Returns `true` if the task counts as successful.
fn complete_task(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
    task: &mut Task,
) -> bool {
    if task.lsm.is_dropped() {
        // Not an error; silently roll the task back
        task.abort(shared, state);
        return true;
    }

    if task.is_failed {
        task.abort(shared, state);

        let e = task.error.take().unwrap_or(Error::Cancelled);
        state.last_error = Some(Arc::new(e));
        return false;
    }

    if ErrorInjection::is_on(&shared.config.errinj.task_complete) {
        state.last_error = Some(Arc::new(Error::Injected("vinyl task completion")));
        task.abort(shared, state);
        return false;
    }

    match task.complete(shared, state) {
        Ok(()) => true,
        Err(e) => {
            state.last_error = Some(Arc::new(e));
            task.abort(shared, state);
            false
        }
    }
}

/// Picks the oldest LSM tree eligible for dump and builds a task for it.
///
/// Dumping the oldest tree frees the most memory quota; see the dump heap
/// ordering for the eligibility rules.
fn peek_dump(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
) -> crate::Result<Option<Box<Task>>> {
    let mut worker: Option<WorkerHandle> = None;

    let result = loop {
        if !state.dump_in_progress() {
            // All memory of past generations is on disk already
            break None;
        }

        let Some(lsm) = state.dump_heap.top().cloned() else {
            // No tree at all; close the round
            state.complete_dump(shared);
            break None;
        };

        if lsm.is_dumping() || lsm.pin_count() > 0 || lsm.generation() != state.dump_generation
        {
            // Everything eligible is already being dumped; the round
            // completes when those tasks do
            break None;
        }

        if worker.is_none() {
            worker = state.dump_pool.get(shared);

            if worker.is_none() {
                break None; // all dump workers are busy
            }
        }

        let Some(w) = worker else { unreachable!() };

        match task_dump_new(shared, state, w, &lsm) {
            Ok(Some(task)) => {
                worker = None;
                break Some(task);
            }
            // Only empty trees; check the next one
            Ok(None) => continue,
            Err(e) => {
                state.dump_pool.put(w);
                return Err(e);
            }
        }
    };

    if let Some(w) = worker {
        state.dump_pool.put(w);
    }

    Ok(result)
}

/// Picks the range whose compaction reduces read amplification the most
/// and builds a task for it.
fn peek_compact(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
) -> crate::Result<Option<Box<Task>>> {
    let mut worker: Option<WorkerHandle> = None;

    let result = loop {
        let Some(lsm) = state.compact_heap.top().cloned() else {
            break None;
        };

        if lsm.compact_priority() <= 1 {
            break None; // nothing worth merging
        }

        if worker.is_none() {
            worker = state.compact_pool.get(shared);

            if worker.is_none() {
                break None; // all compaction workers are busy
            }
        }

        let Some(w) = worker else { unreachable!() };

        match task_compact_new(shared, state, w, &lsm) {
            Ok(Some(task)) => {
                worker = None;
                break Some(task);
            }
            // Range was split or coalesced; retry with the new shape
            Ok(None) => continue,
            Err(e) => {
                state.compact_pool.put(w);
                return Err(e);
            }
        }
    };

    if let Some(w) = worker {
        state.compact_pool.put(w);
    }

    Ok(result)
}

fn schedule(
    shared: &Arc<SchedulerShared>,
    state: &mut SchedulerState,
) -> crate::Result<Option<Box<Task>>> {
    if let Some(task) = peek_dump(shared, state)? {
        return Ok(Some(task));
    }

    if let Some(task) = peek_compact(shared, state)? {
        return Ok(Some(task));
    }

    Ok(None)
}

/// Exponential back-off after a failed task: another task would likely hit
/// the same memory or disk condition right away.
///
/// Deferred DELETE batches keep flowing during the sleep so no worker
/// deadlocks against a throttled tx.
fn throttle<'a>(shared: &'a Arc<SchedulerShared>, mut state: MutexGuard<'a, SchedulerState>) {
    state.timeout = (state.timeout * 2.0).clamp(TIMEOUT_MIN, TIMEOUT_MAX);
    log::warn!("throttling scheduler for {:.0} second(s)", state.timeout);

    state.is_throttled = true;
    // Let checkpoint waiters fail fast instead of waiting out the back-off
    shared.dump_cond.notify_all();

    let sleep_override = shared.config.errinj.sched_timeout_ms.load(Relaxed);
    let sleep = if sleep_override > 0 {
        Duration::from_millis(sleep_override)
    } else {
        Duration::from_secs_f64(state.timeout)
    };
    let deadline = Instant::now() + sleep;

    loop {
        if state.shutdown {
            break;
        }

        if let Some(batch) = state.deferred.pop_front() {
            drop(state);
            shared.process_deferred_batch(batch);
            state = shared.state.lock().expect("lock is poisoned");
            continue;
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let (guard, _) = shared
            .scheduler_cond
            .wait_timeout(state, deadline.duration_since(now))
            .expect("lock is poisoned");
        state = guard;
    }

    state.is_throttled = false;
}

/// The scheduler loop: the tx thread.
fn scheduler_loop(shared: &Arc<SchedulerShared>) {
    log::debug!("vinyl scheduler started");

    loop {
        let mut state = shared.state.lock().expect("lock is poisoned");

        if state.shutdown {
            break;
        }

        // Deferred DELETE batches come first: a worker may be suspended
        // waiting for one to return.
        if let Some(batch) = state.deferred.pop_front() {
            drop(state);
            shared.process_deferred_batch(batch);
            continue;
        }

        // Complete processed tasks.
        let processed: Vec<Box<Task>> = state.processed.drain(..).collect();

        if !processed.is_empty() {
            let mut done = 0usize;
            let mut failed = 0usize;

            for mut task in processed {
                if complete_task(shared, &mut state, &mut task) {
                    done += 1;
                } else {
                    failed += 1;
                }

                let worker = task.worker;
                state.pool_mut(worker.kind).put(worker);
            }

            if done > 0 {
                // More completions may have queued while we worked;
                // recheck before waiting so no wakeup is lost
                state.timeout = 0.0;
                continue;
            }

            if failed > 0 && !shared.stop.is_stopped() {
                throttle(shared, state);
            }

            continue;
        }

        // Get a task to schedule.
        match schedule(shared, &mut state) {
            Ok(Some(task)) => {
                state.pool(task.worker.kind).send(task);

                // Let foreground callers in before the next pick
                drop(state);
                std::thread::yield_now();
            }
            Ok(None) => {
                // Nothing to do or all workers are busy
                let state = shared
                    .scheduler_cond
                    .wait(state)
                    .expect("lock is poisoned");
                drop(state);
            }
            Err(e) => {
                state.last_error = Some(Arc::new(e));
                throttle(shared, state);
            }
        }
    }

    log::debug!("vinyl scheduler stopped");
}

/// Snapshot of the scheduler's state, for introspection and tests.
#[derive(Clone, Debug)]
pub struct SchedulerStats {
    /// Current dump round.
    pub generation: u64,

    /// Oldest round still holding un-dumped data.
    pub dump_generation: u64,

    /// Dump tasks currently in flight.
    pub dump_task_count: usize,

    /// A checkpoint holds new dump rounds off.
    pub checkpoint_in_progress: bool,

    /// A dump was requested while a checkpoint was in progress.
    pub dump_pending: bool,

    /// The scheduler is backing off after a failed task.
    pub is_throttled: bool,

    /// Current back-off timeout, seconds; 0 after a successful task.
    pub timeout_secs: f64,

    /// Most deferred DELETE batches any single task ever had in flight.
    pub deferred_delete_inflight_hwm: usize,
}

/// The vinyl write scheduler.
///
/// A single tx-thread loop drains task completions, picks the neediest
/// LSM tree off the dump and compaction heaps, and ships tasks to a fixed
/// pool of worker threads. See the crate docs for the big picture.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// `config.write_threads` must be at least 2: a quarter of the threads
    /// (at least one) dump, the rest compact. Dumps get a dedicated pool
    /// because stalling them stalls foreground writes on memory quota.
    ///
    /// # Panics
    ///
    /// Panics if `config.write_threads < 2`.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        vylog: Arc<MetadataLog>,
        sink: Arc<dyn DeferredDeleteSink>,
        read_views: ReadViewSet,
        dump_complete_cb: DumpCompleteCallback,
    ) -> Self {
        assert!(config.write_threads >= 2, "write_threads must be at least 2");

        let dump_threads = (config.write_threads / 4).max(1);
        let compact_threads = config.write_threads - dump_threads;

        let state = SchedulerState {
            generation: 0,
            dump_generation: 0,
            dump_task_count: 0,
            dump_start: None,
            checkpoint_in_progress: false,
            dump_pending: false,
            is_throttled: false,
            timeout: 0.0,
            last_error: None,
            processed: VecDeque::new(),
            deferred: VecDeque::new(),
            dump_heap: IndexedHeap::new(dump_heap_less, dump_heap_pos),
            compact_heap: IndexedHeap::new(compact_heap_less, compact_heap_pos),
            dump_pool: WorkerPool::new(PoolKind::Dump, dump_threads),
            compact_pool: WorkerPool::new(PoolKind::Compact, compact_threads),
            shutdown: false,
        };

        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(state),
                scheduler_cond: Condvar::new(),
                dump_cond: Condvar::new(),
                config,
                vylog,
                sink,
                dump_complete_cb,
                read_views,
                stop: StopSignal::default(),
                deferred_inflight_hwm: AtomicUsize::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the scheduler loop thread. Must be called before any dump
    /// or checkpoint can make progress.
    pub fn start(&self) {
        let mut thread = self.thread.lock().expect("lock is poisoned");

        if thread.is_some() {
            return;
        }

        let shared = self.shared.clone();

        *thread = Some(
            std::thread::Builder::new()
                .name("vinyl.scheduler".into())
                .spawn(move || scheduler_loop(&shared))
                .expect("failed to spawn vinyl scheduler thread"),
        );
    }

    /// Stops the loop, joins all workers and rolls back whatever was in
    /// flight, journaling a drop record for every prepared run.
    pub fn stop(&self) {
        let thread = self.thread.lock().expect("lock is poisoned").take();

        let worker_threads = {
            let mut state = self.shared.state.lock().expect("lock is poisoned");

            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                self.shared.stop.send();

                let mut threads = state.dump_pool.shutdown();
                threads.extend(state.compact_pool.shutdown());
                threads
            }
        };

        self.shared.scheduler_cond.notify_all();
        self.shared.dump_cond.notify_all();

        if let Some(thread) = thread {
            let _ = thread.join();
        }

        // Workers may be suspended on the deferred DELETE round trip;
        // bounce their batches back as failed until they wind down.
        for thread in worker_threads {
            while !thread.is_finished() {
                self.bounce_deferred();
                std::thread::sleep(Duration::from_millis(1));
            }

            let _ = thread.join();
        }

        self.bounce_deferred();

        // Abort tasks that never got completed so every prepared run is
        // either created or dropped in the metadata log.
        let mut state = self.shared.state.lock().expect("lock is poisoned");
        let leftover: Vec<Box<Task>> = state.processed.drain(..).collect();

        for mut task in leftover {
            task.abort(&self.shared, &mut state);
        }
    }

    /// Sends queued deferred batches back unprocessed, marked failed.
    fn bounce_deferred(&self) {
        let batches: Vec<DeferredDeleteBatch> = {
            let mut state = self.shared.state.lock().expect("lock is poisoned");
            state.deferred.drain(..).collect()
        };

        for mut batch in batches {
            batch.is_failed = true;
            batch.error = Some(Error::Cancelled);
            batch.cancel.send();

            let reply = batch.reply.clone();
            let _ = reply.send(batch);
        }
    }

    /// Registers an LSM tree with both scheduling heaps.
    pub fn add_lsm(&self, lsm: &Arc<LsmTree>) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        debug_assert_eq!(HEAP_POS_NONE, lsm.in_dump.load(Relaxed));
        debug_assert_eq!(HEAP_POS_NONE, lsm.in_compact.load(Relaxed));

        state.dump_heap.insert(lsm.clone());
        state.compact_heap.insert(lsm.clone());

        // A tree is in both heaps or in neither
        debug_assert_eq!(state.dump_heap.len(), state.compact_heap.len());
    }

    /// Removes an LSM tree from scheduling; mark it dropped first if an
    /// in-flight task should be rolled back silently.
    pub fn remove_lsm(&self, lsm: &Arc<LsmTree>) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        state.dump_heap.remove(lsm);
        state.compact_heap.remove(lsm);
    }

    /// Demands a new dump round, unless one is already in progress. While
    /// a checkpoint is running the request is remembered and honored at
    /// `end_checkpoint`.
    pub fn trigger_dump(&self) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");
        state.trigger_dump(&self.shared);
    }

    /// Triggers a dump round and waits for it to complete.
    pub fn dump(&self) -> crate::Result<()> {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        // A dump must not start while a checkpoint is in progress
        while state.checkpoint_in_progress {
            if state.shutdown {
                return Err(Error::Cancelled);
            }

            state = self.shared.dump_cond.wait(state).expect("lock is poisoned");
        }

        if !state.dump_in_progress() {
            state.dump_start = Some(Instant::now());
        }

        state.generation += 1;
        self.shared.scheduler_cond.notify_all();

        while state.dump_in_progress() {
            if state.shutdown {
                return Err(Error::Cancelled);
            }

            if state.is_throttled {
                // A dump error occurred
                return Err(state.throttled_error());
            }

            state = self.shared.dump_cond.wait(state).expect("lock is poisoned");
        }

        Ok(())
    }

    /// Forces compaction of every range of `lsm`.
    pub fn force_compaction(&self, lsm: &Arc<LsmTree>) {
        lsm.force_compaction();

        let mut state = self.shared.state.lock().expect("lock is poisoned");
        state.update_lsm(lsm);
        self.shared.scheduler_cond.notify_all();
    }

    /// Starts a dump round on behalf of a checkpoint. Fails fast with the
    /// cached error while the scheduler is throttled.
    pub fn begin_checkpoint(&self) -> crate::Result<()> {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        debug_assert!(!state.checkpoint_in_progress);

        if state.is_throttled {
            let e = state.throttled_error();
            log::error!("cannot checkpoint vinyl, scheduler is throttled: {e}");
            return Err(e);
        }

        if !state.dump_in_progress() {
            // Remember the round start for dump-bandwidth accounting
            state.dump_start = Some(Instant::now());
        }

        state.generation += 1;
        state.checkpoint_in_progress = true;
        self.shared.scheduler_cond.notify_all();

        log::info!("vinyl checkpoint started");
        Ok(())
    }

    /// Waits until every in-memory tree created before the checkpoint
    /// began is on disk.
    pub fn wait_checkpoint(&self) -> crate::Result<()> {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        if !state.checkpoint_in_progress {
            return Ok(());
        }

        while state.dump_in_progress() {
            if state.shutdown {
                return Err(Error::Cancelled);
            }

            if state.is_throttled {
                let e = state.throttled_error();
                log::error!("vinyl checkpoint failed: {e}");
                return Err(e);
            }

            state = self.shared.dump_cond.wait(state).expect("lock is poisoned");
        }

        log::info!("vinyl checkpoint completed");
        Ok(())
    }

    /// Ends the checkpoint; a dump postponed by it starts now.
    pub fn end_checkpoint(&self) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        if !state.checkpoint_in_progress {
            return;
        }

        state.checkpoint_in_progress = false;
        self.shared.dump_cond.notify_all();

        if state.dump_pending {
            state.trigger_dump(&self.shared);
        }
    }

    /// Whether a dump round is in progress.
    pub fn dump_in_progress(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock is poisoned")
            .dump_in_progress()
    }

    /// Snapshot of the scheduler's counters and flags.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock().expect("lock is poisoned");

        SchedulerStats {
            generation: state.generation,
            dump_generation: state.dump_generation,
            dump_task_count: state.dump_task_count,
            checkpoint_in_progress: state.checkpoint_in_progress,
            dump_pending: state.dump_pending,
            is_throttled: state.is_throttled,
            timeout_secs: state.timeout,
            deferred_delete_inflight_hwm: self.shared.deferred_inflight_hwm.load(Relaxed),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
