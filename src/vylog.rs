// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::errinj::ErrorInjection;
use crate::{Lsn, UserKey};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

/// Identifier of a metadata-log object (run, slice, range, LSM tree).
pub type ObjectId = u64;

/// A run/slice lifecycle event journaled by the metadata log.
///
/// The log is the source of truth on restart: every run that was ever
/// prepared is either created or dropped here, so recovery can garbage
/// collect files that lost their race with a crash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VylogRecord {
    /// A new run id was allocated for a dump or compaction.
    PrepareRun { lsm_id: ObjectId, run_id: ObjectId },

    /// The run was written and belongs to the LSM tree now.
    CreateRun {
        lsm_id: ObjectId,
        run_id: ObjectId,
        dump_lsn: Option<Lsn>,
    },

    /// A slice of a run was attached to a range.
    InsertSlice {
        range_id: ObjectId,
        run_id: ObjectId,
        slice_id: ObjectId,
        begin: Option<UserKey>,
        end: Option<UserKey>,
    },

    /// The slice is gone (compacted away or re-cut).
    DeleteSlice { slice_id: ObjectId },

    /// The run is not referenced by the tree anymore; files may still be
    /// needed by checkpoints up to `gc_lsn`.
    DropRun { run_id: ObjectId, gc_lsn: Lsn },

    /// The run files were physically removed.
    ForgetRun { run_id: ObjectId },

    /// The LSM tree was dumped up to `dump_lsn`.
    DumpLsm {
        lsm_id: ObjectId,
        dump_lsn: Option<Lsn>,
    },
}

struct LogInner {
    committed: Vec<VylogRecord>,

    /// Records from a failed `try_commit`, replayed by the next
    /// successful commit.
    pending: Vec<VylogRecord>,
}

/// The durable journal of run and slice lifecycle events ("vylog").
///
/// Writes are transactional: records stage in a [`VylogTx`] and move to the
/// committed log atomically. Object ids for runs, slices and ranges are
/// allocated here so they are unique across the whole engine.
pub struct MetadataLog {
    inner: Mutex<LogInner>,
    next_id: AtomicU64,

    /// LSN of the last checkpoint the log was rotated at.
    signature: AtomicU64,

    errinj: Arc<ErrorInjection>,
}

impl MetadataLog {
    #[must_use]
    pub fn new(errinj: Arc<ErrorInjection>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                committed: Vec::new(),
                pending: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            signature: AtomicU64::new(0),
            errinj,
        }
    }

    /// Allocates a fresh object id.
    pub fn next_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Relaxed)
    }

    /// LSN of the last checkpoint; runs dumped after it are not referenced
    /// by any checkpoint and may be removed eagerly once compacted away.
    pub fn signature(&self) -> Lsn {
        self.signature.load(Relaxed)
    }

    /// Rotates the log at a checkpoint; called by the checkpoint driver.
    pub fn set_signature(&self, lsn: Lsn) {
        self.signature.store(lsn, Relaxed);
    }

    /// Starts a transaction.
    pub fn begin(&self) -> VylogTx<'_> {
        VylogTx {
            log: self,
            records: Vec::new(),
        }
    }

    /// Snapshot of all committed records, in commit order.
    pub fn committed(&self) -> Vec<VylogRecord> {
        self.inner.lock().expect("lock is poisoned").committed.clone()
    }

    /// Records from failed `try_commit`s still awaiting replay.
    pub fn pending(&self) -> Vec<VylogRecord> {
        self.inner.lock().expect("lock is poisoned").pending.clone()
    }

    fn commit_records(&self, records: Vec<VylogRecord>) -> crate::Result<()> {
        if ErrorInjection::is_on(&self.errinj.vylog_commit) {
            return Err(crate::Error::Injected("vylog commit"));
        }

        let mut inner = self.inner.lock().expect("lock is poisoned");

        // A successful commit flushes whatever an earlier try_commit
        // left behind first, preserving record order.
        let pending = std::mem::take(&mut inner.pending);
        inner.committed.extend(pending);
        inner.committed.extend(records);

        Ok(())
    }

    fn stash_records(&self, records: Vec<VylogRecord>) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.pending.extend(records);
    }
}

/// A metadata log transaction; records are staged until commit.
pub struct VylogTx<'a> {
    log: &'a MetadataLog,
    records: Vec<VylogRecord>,
}

impl VylogTx<'_> {
    pub fn write(&mut self, record: VylogRecord) {
        self.records.push(record);
    }

    /// Commits atomically; on failure no staged record is visible.
    pub fn commit(self) -> crate::Result<()> {
        self.log.commit_records(self.records)
    }

    /// Commits, but tolerates failure: records are kept in the pending
    /// buffer and replayed by the next successful commit. Used on paths
    /// that must not fail, like task abort.
    pub fn try_commit(self) {
        let log = self.log;

        if let Err(e) = log.commit_records(self.records.clone()) {
            log::warn!("failed to flush vylog transaction, stashing for replay: {e}");
            log.stash_records(self.records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MetadataLog, VylogRecord};
    use crate::errinj::ErrorInjection;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn commit_is_atomic() {
        let log = MetadataLog::new(Arc::new(ErrorInjection::new()));

        let mut tx = log.begin();
        tx.write(VylogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 2,
        });

        assert!(log.committed().is_empty(), "no records before commit");

        tx.commit().expect("commit should work");
        assert_eq!(1, log.committed().len());
    }

    #[test]
    fn failed_commit_stages_nothing() {
        let errinj = Arc::new(ErrorInjection::new());
        let log = MetadataLog::new(errinj.clone());

        errinj.vylog_commit.store(true, Relaxed);

        let mut tx = log.begin();
        tx.write(VylogRecord::ForgetRun { run_id: 7 });
        tx.commit().expect_err("commit should fail");

        assert!(log.committed().is_empty());
        assert!(log.pending().is_empty());
    }

    #[test]
    fn try_commit_replays_after_recovery() {
        let errinj = Arc::new(ErrorInjection::new());
        let log = MetadataLog::new(errinj.clone());

        errinj.vylog_commit.store(true, Relaxed);

        let mut tx = log.begin();
        tx.write(VylogRecord::DropRun {
            run_id: 7,
            gc_lsn: 0,
        });
        tx.try_commit();

        assert!(log.committed().is_empty());
        assert_eq!(1, log.pending().len());

        errinj.vylog_commit.store(false, Relaxed);

        let mut tx = log.begin();
        tx.write(VylogRecord::ForgetRun { run_id: 8 });
        tx.commit().expect("commit should work");

        // Pending records replay ahead of the new ones
        assert_eq!(
            vec![
                VylogRecord::DropRun {
                    run_id: 7,
                    gc_lsn: 0
                },
                VylogRecord::ForgetRun { run_id: 8 },
            ],
            log.committed(),
        );
        assert!(log.pending().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let log = MetadataLog::new(Arc::new(ErrorInjection::new()));
        let a = log.next_id();
        let b = log.next_id();
        assert_ne!(a, b);
    }
}
