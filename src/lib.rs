// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background write scheduler for an LSM-tree storage engine.
//!
//! ##### About
//!
//! An LSM tree absorbs writes into in-memory trees and occasionally has to
//! do two kinds of background work:
//!
//! - **dump**: flush sealed in-memory trees into a new immutable run on
//!   disk, releasing memory quota,
//! - **compaction**: merge a range's newest runs into one, keeping read
//!   amplification bounded.
//!
//! This crate provides the [`Scheduler`] that orchestrates both across a
//! fixed pool of worker threads while a single transactional thread
//! ("tx") keeps serving foreground reads and writes. The scheduler picks
//! the neediest tree off two priority heaps (dump urgency, compaction
//! benefit), builds a task, and ships it to a worker over a typed channel;
//! the worker drives a merge iterator into a run writer and ships the task
//! back for completion on tx. Run and slice lifecycle is journaled in a
//! [`MetadataLog`] so crash recovery can always tell a live run from
//! garbage.
//!
//! Two details make the scheduler more than a thread pool:
//!
//! - **ordering**: within a space, the primary index is always dumped
//!   after its secondary indexes (enforced by pinning), and a dump round
//!   must complete before a checkpoint can finalize;
//! - **deferred DELETEs**: compacting a primary index discovers
//!   overwrites the secondary indexes never saw. Those synthetic DELETEs
//!   are round-tripped through tx into the `_deferred_delete` system
//!   space ([`DeferredDeleteSink`]) so they reach the WAL even if the
//!   compaction output is lost.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vinyl_scheduler::{
//!     Config, DiscardingSink, LsmTree, MetadataLog, ReadViewSet, Scheduler, Statement,
//! };
//!
//! # fn main() -> vinyl_scheduler::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let config = Arc::new(Config::new(dir.path()).write_threads(2));
//! let vylog = Arc::new(MetadataLog::new(config.errinj.clone()));
//!
//! let scheduler = Scheduler::new(
//!     config.clone(),
//!     vylog.clone(),
//!     Arc::new(DiscardingSink),
//!     ReadViewSet::default(),
//!     Box::new(|_generation, _duration| {}),
//! );
//! scheduler.start();
//!
//! let lsm = LsmTree::new(512, 0, None, config, vylog);
//! scheduler.add_lsm(&lsm);
//!
//! lsm.insert(Statement::new_value("key", "value", 1));
//!
//! // Flush everything to disk
//! scheduler.dump()?;
//! assert_eq!(1, lsm.stats().run_count);
//!
//! scheduler.remove_lsm(&lsm);
//! scheduler.stop();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod config;
mod deferred;
mod errinj;
mod error;
mod heap;
mod lsm;
mod mem;
mod range;
mod read_view;
mod run;
mod run_writer;
mod scheduler;
mod slice;
mod stop_signal;
mod task;
mod value;
mod vylog;
mod worker;
mod write_iterator;

pub use config::Config;
pub use deferred::{
    DeferredDeleteEntry, DeferredDeleteSink, DeferredDeleteTx, DiscardingSink,
    DEFERRED_DELETE_BATCH_MAX, DEFERRED_DELETE_MAX_IN_FLIGHT,
};
pub use errinj::ErrorInjection;
pub use error::{Error, Result};
pub use lsm::{LsmId, LsmTree, LsmTreeStats};
pub use mem::{MemId, MemTree};
pub use range::{Range, RangeId};
pub use read_view::ReadViewSet;
pub use run::{Run, RunId, RunInfo};
pub use scheduler::{DumpCompleteCallback, Scheduler, SchedulerStats};
pub use slice::{Slice, SliceId, SliceScanner};
pub use value::{Bytes, Lsn, Statement, UserKey, UserValue, ValueType};
pub use vylog::{MetadataLog, ObjectId, VylogRecord};
