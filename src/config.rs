// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::errinj::ErrorInjection;
use std::path::PathBuf;
use std::sync::Arc;

/// Scheduler configuration
pub struct Config {
    /// Base folder runs are written to.
    pub path: PathBuf,

    /// Total worker thread count; at least 2.
    ///
    /// A quarter (at least one) is dedicated to dump tasks, the rest to
    /// compaction.
    pub write_threads: usize,

    /// Bloom filter false-positive rate handed to the run writer.
    ///
    /// Snapshotted per task so a concurrent alter does not race a worker.
    pub bloom_fpr: f64,

    /// Run writer page size in bytes, snapshotted per task.
    pub page_size: u64,

    /// How many runs a level may accumulate before a range becomes a
    /// compaction candidate.
    pub run_count_per_level: usize,

    /// Target range size in bytes; ranges grow past it are split,
    /// ranges far below it are coalesced with neighbors.
    pub range_size: u64,

    /// Error-injection switches.
    pub errinj: Arc<ErrorInjection>,
}

impl Config {
    /// Creates a new configuration with sensible defaults.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_threads: 4,
            bloom_fpr: 0.05,
            page_size: 8 * 1_024,
            run_count_per_level: 2,
            range_size: 1_024 * 1_024 * 1_024,
            errinj: Arc::new(ErrorInjection::new()),
        }
    }

    /// Sets the worker thread count.
    ///
    /// # Panics
    ///
    /// Panics if `count < 2` (there must be at least one dump worker and
    /// one compaction worker).
    #[must_use]
    pub fn write_threads(mut self, count: usize) -> Self {
        assert!(count >= 2, "write_threads must be at least 2");
        self.write_threads = count;
        self
    }

    /// Sets the bloom filter false-positive rate.
    #[must_use]
    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Sets the run writer page size.
    #[must_use]
    pub fn page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the per-level run count threshold.
    #[must_use]
    pub fn run_count_per_level(mut self, count: usize) -> Self {
        self.run_count_per_level = count;
        self
    }

    /// Sets the target range size.
    #[must_use]
    pub fn range_size(mut self, bytes: u64) -> Self {
        self.range_size = bytes;
        self
    }
}
