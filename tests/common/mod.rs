// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vinyl_scheduler::{
    Config, DeferredDeleteEntry, DeferredDeleteSink, DeferredDeleteTx, MetadataLog, ReadViewSet,
    Scheduler,
};

pub struct Fixture {
    // Declared first so shutdown happens before the tempdir is removed
    pub scheduler: Scheduler,

    pub dir: tempfile::TempDir,
    pub config: Arc<Config>,
    pub vylog: Arc<MetadataLog>,

    /// Dump rounds completed so far.
    pub rounds: Arc<AtomicUsize>,
}

/// Builds a started scheduler around `sink` with 2 write threads.
pub fn fixture_with(
    sink: Arc<dyn DeferredDeleteSink>,
    configure: impl FnOnce(Config) -> Config,
) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(configure(Config::new(dir.path()).write_threads(2)));
    let vylog = Arc::new(MetadataLog::new(config.errinj.clone()));

    let rounds = Arc::new(AtomicUsize::new(0));
    let rounds_cb = rounds.clone();

    let scheduler = Scheduler::new(
        config.clone(),
        vylog.clone(),
        sink,
        ReadViewSet::default(),
        Box::new(move |_generation, _duration| {
            rounds_cb.fetch_add(1, Relaxed);
        }),
    );
    scheduler.start();

    Fixture {
        scheduler,
        dir,
        config,
        vylog,
        rounds,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(Arc::new(vinyl_scheduler::DiscardingSink), |c| c)
}

/// Polls `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if pred() {
            return true;
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    pred()
}

/// Sink that records every published entry, optionally sleeping per batch
/// to simulate a slow tx thread.
pub struct RecordingSink {
    pub entries: Mutex<Vec<DeferredDeleteEntry>>,
    pub batches: AtomicUsize,
    pub delay: Duration,
}

impl RecordingSink {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            batches: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("lock is poisoned").len()
    }
}

pub struct RecordingTx<'a> {
    sink: &'a RecordingSink,
    staged: Vec<DeferredDeleteEntry>,
}

impl DeferredDeleteTx for RecordingTx<'_> {
    fn replace(&mut self, entry: &DeferredDeleteEntry) -> vinyl_scheduler::Result<()> {
        self.staged.push(entry.clone());
        Ok(())
    }

    fn commit(&mut self) -> vinyl_scheduler::Result<()> {
        self.sink
            .entries
            .lock()
            .expect("lock is poisoned")
            .append(&mut self.staged);
        Ok(())
    }
}

impl DeferredDeleteSink for RecordingSink {
    fn begin(&self) -> vinyl_scheduler::Result<Box<dyn DeferredDeleteTx + '_>> {
        self.batches.fetch_add(1, Relaxed);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        Ok(Box::new(RecordingTx {
            sink: self,
            staged: Vec::new(),
        }))
    }
}

/// Sink that fails every transaction.
pub struct FailingSink;

impl DeferredDeleteSink for FailingSink {
    fn begin(&self) -> vinyl_scheduler::Result<Box<dyn DeferredDeleteTx + '_>> {
        Err(vinyl_scheduler::Error::Injected("deferred delete sink"))
    }
}
