// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::{Statement, StmtKey, UserValue, ValueType};
use crate::Lsn;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};

/// Identifier of an in-memory tree within one LSM tree.
pub type MemId = u64;

/// An in-memory tree: ephemeral sorted storage for statements that have
/// not been dumped yet.
///
/// The active tree of an LSM tree accepts inserts; once sealed by a
/// rotation it is immutable by convention and only waits to be dumped.
pub struct MemTree {
    id: MemId,

    /// Dump round the tree was created in. The scheduler dumps trees
    /// oldest-generation-first.
    generation: u64,

    items: SkipMap<StmtKey, (ValueType, UserValue)>,

    /// Max LSN inserted so far (0 = empty tree).
    dump_lsn: AtomicU64,

    approximate_size: AtomicU64,

    /// Foreground writers pin the tree for the duration of an insert so a
    /// dump does not read a half-applied statement.
    pins: Mutex<usize>,
    unpinned: Condvar,
}

impl MemTree {
    #[must_use]
    pub fn new(id: MemId, generation: u64) -> Self {
        Self {
            id,
            generation,
            items: SkipMap::new(),
            dump_lsn: AtomicU64::new(0),
            approximate_size: AtomicU64::new(0),
            pins: Mutex::new(0),
            unpinned: Condvar::new(),
        }
    }

    pub fn id(&self) -> MemId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Max LSN of the statements in this tree, `None` if empty.
    pub fn dump_lsn(&self) -> Option<Lsn> {
        match self.dump_lsn.load(Relaxed) {
            0 => None,
            lsn => Some(lsn),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.load(Relaxed)
    }

    pub fn insert(&self, stmt: Statement) {
        debug_assert!(stmt.lsn > 0, "LSN 0 is reserved");

        self.approximate_size
            .fetch_add(stmt.approximate_size(), Relaxed);
        self.dump_lsn.fetch_max(stmt.lsn, Relaxed);

        self.items.insert(
            StmtKey {
                key: stmt.key,
                lsn: stmt.lsn,
            },
            (stmt.value_type, stmt.value),
        );
    }

    pub(crate) fn pin(&self) {
        *self.pins.lock().expect("lock is poisoned") += 1;
    }

    pub(crate) fn unpin(&self) {
        let mut pins = self.pins.lock().expect("lock is poisoned");
        debug_assert!(*pins > 0);
        *pins -= 1;

        if *pins == 0 {
            self.unpinned.notify_all();
        }
    }

    /// Blocks until no writer is pinning the tree.
    pub(crate) fn wait_pinned(&self) {
        let mut pins = self.pins.lock().expect("lock is poisoned");

        while *pins > 0 {
            pins = self.unpinned.wait(pins).expect("lock is poisoned");
        }
    }

    /// Creates an owned iterator over all statements in order.
    pub(crate) fn scan(self: &Arc<Self>) -> MemIter {
        MemIter {
            mem: self.clone(),
            last: None,
        }
    }
}

/// Cursor-style iterator that owns its tree, so it can cross into a worker
/// thread together with the task.
pub(crate) struct MemIter {
    mem: Arc<MemTree>,
    last: Option<StmtKey>,
}

impl Iterator for MemIter {
    type Item = crate::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match &self.last {
            None => self.mem.items.front(),
            Some(last) => self
                .mem
                .items
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next(),
        }?;

        let key = entry.key().clone();
        let (value_type, value) = entry.value().clone();
        self.last = Some(key.clone());

        Some(Ok(Statement {
            key: key.key,
            lsn: key.lsn,
            value_type,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::MemTree;
    use crate::value::Statement;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn scan_is_sorted_newest_version_first() {
        let mem = Arc::new(MemTree::new(0, 0));
        mem.insert(Statement::new_value("b", "1", 5));
        mem.insert(Statement::new_value("a", "1", 3));
        mem.insert(Statement::new_value("a", "2", 7));

        let stmts: Vec<_> = mem
            .scan()
            .map(|s| s.expect("mem scan cannot fail"))
            .collect();

        assert_eq!(3, stmts.len());
        assert_eq!((&b"a"[..], 7), (&*stmts[0].key, stmts[0].lsn));
        assert_eq!((&b"a"[..], 3), (&*stmts[1].key, stmts[1].lsn));
        assert_eq!((&b"b"[..], 5), (&*stmts[2].key, stmts[2].lsn));

        assert_eq!(Some(7), mem.dump_lsn());
    }

    #[test]
    fn wait_pinned_blocks_until_writers_finish() {
        let mem = Arc::new(MemTree::new(0, 0));
        mem.pin();

        let mem2 = mem.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            mem2.unpin();
        });

        mem.wait_pinned();
        handle.join().expect("thread should not panic");
    }
}
