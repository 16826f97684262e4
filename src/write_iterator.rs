// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::mem::MemTree;
use crate::slice::Slice;
use crate::value::Statement;
use crate::Lsn;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

/// Receives the deferred DELETEs discovered while the write iterator merges
/// primary-index slices: `old` was overwritten by `new` and the secondary
/// indexes have never heard about it.
pub(crate) trait DeferredDeleteHandler: Send {
    fn process(&mut self, old: &Statement, new: &Statement) -> crate::Result<()>;

    /// Called when the iterator stops; flushes and waits out any pending
    /// work.
    fn destroy(&mut self);
}

enum Input {
    Mem(Arc<MemTree>),
    Slice(Arc<Slice>),
}

type SourceIter = Box<dyn Iterator<Item = crate::Result<Statement>> + Send>;

struct Source {
    iter: SourceIter,
    peeked: Option<Statement>,
}

impl Source {
    fn advance(&mut self) -> crate::Result<()> {
        self.peeked = self.iter.next().transpose()?;
        Ok(())
    }
}

/// Lazy merge-sort cursor over in-memory trees and/or slices producing the
/// statement stream for a new run.
///
/// Inputs must be added newest first. For every key the newest version is
/// emitted, plus the newest version visible to each registered read view;
/// tombstones are evicted on last-level merges. Runs on a worker thread
/// from `start` to `stop`.
pub(crate) struct WriteIterator {
    dir: PathBuf,
    inputs: Vec<Input>,
    sources: Vec<Source>,

    is_primary: bool,
    is_last_level: bool,

    /// Read view LSNs, newest first.
    read_views: Vec<Lsn>,

    handler: Option<Box<dyn DeferredDeleteHandler>>,

    /// Versions of the current key still to hand out, newest first.
    output: VecDeque<Statement>,

    started: bool,
}

impl WriteIterator {
    pub fn new(
        dir: PathBuf,
        is_primary: bool,
        is_last_level: bool,
        read_views: Vec<Lsn>,
        handler: Option<Box<dyn DeferredDeleteHandler>>,
    ) -> Self {
        debug_assert!(
            handler.is_none() || is_primary,
            "only primary-index compaction generates deferred DELETEs",
        );

        Self {
            dir,
            inputs: Vec::new(),
            sources: Vec::new(),
            is_primary,
            is_last_level,
            read_views,
            handler,
            output: VecDeque::new(),
            started: false,
        }
    }

    pub fn add_mem(&mut self, mem: Arc<MemTree>) {
        debug_assert!(!self.started);
        self.inputs.push(Input::Mem(mem));
    }

    pub fn add_slice(&mut self, slice: Arc<Slice>) {
        debug_assert!(!self.started);
        self.inputs.push(Input::Slice(slice));
    }

    /// Opens all sources; slice sources open their run files here, on the
    /// worker thread.
    pub fn start(&mut self) -> crate::Result<()> {
        debug_assert!(!self.started);
        self.started = true;

        for input in &self.inputs {
            let iter: SourceIter = match input {
                Input::Mem(mem) => Box::new(mem.scan()),
                Input::Slice(slice) => Box::new(slice.scan(&self.dir)?),
            };

            let mut source = Source { iter, peeked: None };
            source.advance()?;
            self.sources.push(source);
        }

        Ok(())
    }

    /// Closes the iterator; flushes the deferred DELETE handler and waits
    /// for it to settle.
    pub fn stop(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.destroy();
        }

        self.sources.clear();
    }

    pub fn next(&mut self) -> crate::Result<Option<Statement>> {
        debug_assert!(self.started);

        loop {
            if let Some(stmt) = self.output.pop_front() {
                return Ok(Some(stmt));
            }

            // Smallest key any source is sitting on
            let Some(key) = self
                .sources
                .iter()
                .filter_map(|s| s.peeked.as_ref().map(|p| p.key.clone()))
                .min()
            else {
                return Ok(None);
            };

            // All versions of that key, newest first
            let mut versions: Vec<Statement> = Vec::new();

            for source in &mut self.sources {
                while source
                    .peeked
                    .as_ref()
                    .is_some_and(|p| p.key == key)
                {
                    let stmt = source.peeked.take().expect("peeked twice");
                    source.advance()?;
                    versions.push(stmt);
                }
            }

            versions.sort_by(|a, b| b.lsn.cmp(&a.lsn));

            let newest = versions.first().cloned().expect("key came from a source");

            if self.is_primary {
                if let Some(handler) = self.handler.as_mut() {
                    // The newest overwritten value is what the secondary
                    // indexes still hold
                    if let Some(old) = versions.iter().skip(1).find(|v| !v.is_tombstone()) {
                        handler.process(old, &newest)?;
                    }
                }
            }

            let mut kept: Vec<Statement> = vec![newest];

            for &rv in &self.read_views {
                let Some(visible) = versions.iter().find(|v| v.lsn <= rv) else {
                    continue;
                };

                if kept.last().map_or(true, |last| last.lsn != visible.lsn) {
                    kept.push(visible.clone());
                }
            }

            if self.is_last_level {
                // Nothing exists below the last level for a tombstone
                // to shadow
                kept.retain(|stmt| !stmt.is_tombstone());
            }

            self.output.extend(kept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WriteIterator;
    use crate::mem::MemTree;
    use crate::value::Statement;
    use std::path::PathBuf;
    use std::sync::Arc;
    use test_log::test;

    fn collect(wi: &mut WriteIterator) -> Vec<Statement> {
        let mut out = vec![];

        while let Some(stmt) = wi.next().expect("iteration should work") {
            out.push(stmt);
        }

        out
    }

    #[test]
    fn keeps_newest_version() -> crate::Result<()> {
        let mem = Arc::new(MemTree::new(0, 0));
        mem.insert(Statement::new_value("a", "old", 1));
        mem.insert(Statement::new_value("a", "new", 2));
        mem.insert(Statement::new_value("b", "x", 3));

        let mut wi = WriteIterator::new(PathBuf::new(), true, false, vec![], None);
        wi.add_mem(mem);
        wi.start()?;

        let out = collect(&mut wi);
        wi.stop();

        assert_eq!(
            vec![Statement::new_value("a", "new", 2), Statement::new_value("b", "x", 3)],
            out,
        );

        Ok(())
    }

    #[test]
    fn merges_across_sources() -> crate::Result<()> {
        let new_mem = Arc::new(MemTree::new(1, 1));
        new_mem.insert(Statement::new_value("b", "2", 4));

        let old_mem = Arc::new(MemTree::new(0, 0));
        old_mem.insert(Statement::new_value("a", "1", 1));
        old_mem.insert(Statement::new_value("b", "1", 2));

        let mut wi = WriteIterator::new(PathBuf::new(), true, false, vec![], None);
        wi.add_mem(new_mem);
        wi.add_mem(old_mem);
        wi.start()?;

        let out = collect(&mut wi);
        wi.stop();

        assert_eq!(
            vec![Statement::new_value("a", "1", 1), Statement::new_value("b", "2", 4)],
            out,
        );

        Ok(())
    }

    #[test]
    fn last_level_evicts_tombstones() -> crate::Result<()> {
        let mem = Arc::new(MemTree::new(0, 0));
        mem.insert(Statement::new_value("a", "x", 1));
        mem.insert(Statement::new_tombstone("a", 2));
        mem.insert(Statement::new_value("b", "y", 3));

        let mut wi = WriteIterator::new(PathBuf::new(), true, true, vec![], None);
        wi.add_mem(mem);
        wi.start()?;

        let out = collect(&mut wi);
        wi.stop();

        assert_eq!(vec![Statement::new_value("b", "y", 3)], out);

        Ok(())
    }

    #[test]
    fn read_views_keep_old_versions() -> crate::Result<()> {
        let mem = Arc::new(MemTree::new(0, 0));
        mem.insert(Statement::new_value("a", "v1", 1));
        mem.insert(Statement::new_value("a", "v2", 5));
        mem.insert(Statement::new_value("a", "v3", 9));

        let mut wi = WriteIterator::new(PathBuf::new(), true, false, vec![6, 2], None);
        wi.add_mem(mem);
        wi.start()?;

        let out = collect(&mut wi);
        wi.stop();

        let lsns: Vec<_> = out.iter().map(|s| s.lsn).collect();
        assert_eq!(vec![9, 5, 1], lsns);

        Ok(())
    }

    #[test]
    fn reports_overwrites_to_handler() -> crate::Result<()> {
        struct Recorder(Arc<std::sync::Mutex<Vec<(Statement, Statement)>>>);

        impl super::DeferredDeleteHandler for Recorder {
            fn process(&mut self, old: &Statement, new: &Statement) -> crate::Result<()> {
                self.0
                    .lock()
                    .expect("lock is poisoned")
                    .push((old.clone(), new.clone()));
                Ok(())
            }

            fn destroy(&mut self) {}
        }

        let mem = Arc::new(MemTree::new(0, 0));
        mem.insert(Statement::new_value("a", "old", 1));
        mem.insert(Statement::new_value("a", "new", 2));
        mem.insert(Statement::new_tombstone("b", 4));
        mem.insert(Statement::new_value("b", "gone", 3));
        mem.insert(Statement::new_value("c", "only", 5));

        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let mut wi = WriteIterator::new(
            PathBuf::new(),
            true,
            false,
            vec![],
            Some(Box::new(Recorder(seen.clone()))),
        );
        wi.add_mem(mem);
        wi.start()?;

        let _ = collect(&mut wi);
        wi.stop();

        let seen = seen.lock().expect("lock is poisoned");
        assert_eq!(2, seen.len(), "one overwrite per key, none for c");
        assert_eq!(
            (Statement::new_value("a", "old", 1), Statement::new_value("a", "new", 2)),
            seen[0],
        );
        assert_eq!(
            (Statement::new_value("b", "gone", 3), Statement::new_tombstone("b", 4)),
            seen[1],
        );

        Ok(())
    }
}
