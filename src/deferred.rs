// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::lsm::LsmTree;
use crate::scheduler::SchedulerShared;
use crate::stop_signal::StopSignal;
use crate::value::Statement;
use crate::write_iterator::DeferredDeleteHandler;
use crate::{Error, Lsn};
use byteorder::{WriteBytesExt, LE};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::io::Write;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use varint_rs::VarintWriter;

/// Max statements per deferred DELETE batch shipped to tx.
pub const DEFERRED_DELETE_BATCH_MAX: usize = 100;

/// Max batches a single task may have in flight before its worker fiber
/// suspends, bounding memory consumption.
pub const DEFERRED_DELETE_MAX_IN_FLIGHT: usize = 10;

/// One REPLACE into the `_deferred_delete` system space.
///
/// The space carries an on-replace trigger which propagates the DELETE to
/// the secondary indexes through the regular write path, and therefore
/// through the WAL: the DELETE survives a crash even if the compaction
/// output that discovered it is lost.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeferredDeleteEntry {
    /// Space the overwrite happened in.
    pub space_id: u32,

    /// LSN of the overwriting statement.
    pub lsn: Lsn,

    /// Surrogate DELETE built from the overwritten tuple.
    pub delete: Statement,
}

impl DeferredDeleteEntry {
    /// Wire format: `[space_id: u32][lsn: u64][key len: varint][key]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.delete.key.len() + 16);

        // Writing to a Vec cannot fail
        buf.write_u32::<LE>(self.space_id).expect("vec write");
        buf.write_u64::<LE>(self.lsn).expect("vec write");

        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32_varint(self.delete.key.len() as u32)
            .expect("vec write");
        buf.write_all(&self.delete.key).expect("vec write");

        buf
    }
}

/// Transaction against the `_deferred_delete` system space.
pub trait DeferredDeleteTx {
    fn replace(&mut self, entry: &DeferredDeleteEntry) -> crate::Result<()>;
    fn commit(&mut self) -> crate::Result<()>;
}

/// DML surface of the transactional engine the scheduler publishes
/// deferred DELETEs through. Runs on the tx thread only.
pub trait DeferredDeleteSink: Send + Sync {
    fn begin(&self) -> crate::Result<Box<dyn DeferredDeleteTx + '_>>;
}

/// A no-op sink for engines without secondary indexes.
pub struct DiscardingSink;

struct DiscardingTx;

impl DeferredDeleteTx for DiscardingTx {
    fn replace(&mut self, _entry: &DeferredDeleteEntry) -> crate::Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

impl DeferredDeleteSink for DiscardingSink {
    fn begin(&self) -> crate::Result<Box<dyn DeferredDeleteTx + '_>> {
        Ok(Box::new(DiscardingTx))
    }
}

/// An overwritten/overwriting statement pair awaiting publication.
pub(crate) struct DeferredDeleteStmt {
    pub old: Statement,
    pub new: Statement,
}

/// A batch of deferred DELETEs in flight between a worker and tx.
///
/// Travels two hops: worker → tx (`Scheduler` runs `process_deferred_batch`
/// against the sink), then tx → worker over `reply`, where the producing
/// worker releases the statements and, on failure, cancels the task.
pub(crate) struct DeferredDeleteBatch {
    pub stmts: Vec<DeferredDeleteStmt>,

    /// Primary index the compaction runs against.
    pub pk: Arc<LsmTree>,

    /// The producing task's cancellation latch.
    pub cancel: StopSignal,

    pub reply: Sender<DeferredDeleteBatch>,

    /// Set if the tx thread failed to process the batch.
    pub is_failed: bool,

    /// In case of failure the error is stored here.
    pub error: Option<Error>,
}

/// Worker-side accumulator implementing the deferred DELETE round trip.
pub(crate) struct DeferredDeleteChannel {
    shared: Arc<SchedulerShared>,
    pk: Arc<LsmTree>,

    buf: Vec<DeferredDeleteStmt>,
    in_flight: usize,

    reply_tx: Sender<DeferredDeleteBatch>,
    reply_rx: Receiver<DeferredDeleteBatch>,

    /// The task's cancellation latch, raised when a batch fails.
    cancel: StopSignal,

    /// Failure slot shared with the task; first batch error wins.
    failure: Arc<Mutex<Option<Error>>>,
}

impl DeferredDeleteChannel {
    pub fn new(
        shared: Arc<SchedulerShared>,
        pk: Arc<LsmTree>,
        cancel: StopSignal,
        failure: Arc<Mutex<Option<Error>>>,
    ) -> Self {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();

        Self {
            shared,
            pk,
            buf: Vec::new(),
            in_flight: 0,
            reply_tx,
            reply_rx,
            cancel,
            failure,
        }
    }

    /// Ships the current batch to tx.
    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        self.in_flight += 1;
        self.shared
            .deferred_inflight_hwm
            .fetch_max(self.in_flight, Relaxed);

        let batch = DeferredDeleteBatch {
            stmts: std::mem::take(&mut self.buf),
            pk: self.pk.clone(),
            cancel: self.cancel.clone(),
            reply: self.reply_tx.clone(),
            is_failed: false,
            error: None,
        };

        self.shared.push_deferred(batch);
    }

    /// Receives one processed batch back from tx and releases its
    /// statements on this (the producing) thread. Returns `false` if no
    /// batch was available.
    fn reap(&mut self, block: bool) -> bool {
        let batch = if block {
            match self.reply_rx.recv() {
                Ok(batch) => Some(batch),
                Err(_) => None,
            }
        } else {
            match self.reply_rx.try_recv() {
                Ok(batch) => Some(batch),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => None,
            }
        };

        let Some(mut batch) = batch else {
            // tx is gone; the task can only be cancelled
            let mut failure = self.failure.lock().expect("lock is poisoned");
            failure.get_or_insert(Error::Cancelled);
            self.cancel.send();
            return false;
        };

        if batch.is_failed {
            let mut failure = self.failure.lock().expect("lock is poisoned");

            if failure.is_none() {
                *failure = Some(batch.error.take().unwrap_or(Error::Cancelled));
            }

            // Cancel the task fiber; observed at its next yield point
            self.cancel.send();
        }

        debug_assert!(self.in_flight > 0);
        self.in_flight -= 1;

        // batch.stmts dropped here, on the worker thread that created them
        true
    }
}

impl DeferredDeleteHandler for DeferredDeleteChannel {
    fn process(&mut self, old: &Statement, new: &Statement) -> crate::Result<()> {
        // Release any batches tx has already acknowledged
        while self.reap(false) {}

        // Throttle the compaction if tx cannot keep up
        while self.in_flight >= DEFERRED_DELETE_MAX_IN_FLIGHT {
            if !self.reap(true) {
                break;
            }
        }

        if self.cancel.is_stopped() {
            return Err(Error::Cancelled);
        }

        self.buf.push(DeferredDeleteStmt {
            old: old.clone(),
            new: new.clone(),
        });

        if self.buf.len() == DEFERRED_DELETE_BATCH_MAX {
            self.flush();
        }

        Ok(())
    }

    fn destroy(&mut self) {
        self.flush();

        while self.in_flight > 0 {
            if !self.reap(true) {
                break;
            }
        }
    }
}
