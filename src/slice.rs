// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::run::{Run, RunScanner};
use crate::value::Statement;
use crate::UserKey;
use std::path::Path;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Identifier of a slice, allocated by the metadata log.
pub type SliceId = u64;

/// A half-open key interval `[begin, end)` of a run, attached to exactly
/// one range. `None` bounds mean unbounded.
pub struct Slice {
    id: SliceId,
    run: Arc<Run>,
    begin: Option<UserKey>,
    end: Option<UserKey>,
}

impl Slice {
    #[must_use]
    pub fn new(id: SliceId, run: Arc<Run>, begin: Option<UserKey>, end: Option<UserKey>) -> Self {
        run.slice_count.fetch_add(1, Relaxed);

        Self {
            id,
            run,
            begin,
            end,
        }
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn run(&self) -> &Arc<Run> {
        &self.run
    }

    pub fn begin(&self) -> Option<&UserKey> {
        self.begin.as_ref()
    }

    pub fn end(&self) -> Option<&UserKey> {
        self.end.as_ref()
    }

    /// Approximate payload bytes covered by this slice.
    ///
    /// Whole-run slices know exactly; clipped slices fall back to the run
    /// size (good enough for compaction priority).
    pub fn size(&self) -> u64 {
        self.run.info().map_or(0, |info| info.size)
    }

    /// Approximate statement count, see [`Slice::size`].
    pub fn count(&self) -> u64 {
        self.run.info().map_or(0, |info| info.count)
    }

    /// Opens an iterator over the run clipped to the slice bounds.
    pub fn scan(&self, dir: &Path) -> crate::Result<SliceScanner> {
        Ok(SliceScanner {
            inner: self.run.scan(dir)?,
            begin: self.begin.clone(),
            end: self.end.clone(),
            done: false,
        })
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        self.run.slice_count.fetch_sub(1, Relaxed);
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Slice({}, run {}, {:?}..{:?})",
            self.id, self.run.id(), self.begin, self.end,
        )
    }
}

/// Iterator over the statements of one slice, in `(key ASC, lsn DESC)`
/// order. Stops early once the end bound is passed.
pub struct SliceScanner {
    inner: RunScanner,
    begin: Option<UserKey>,
    end: Option<UserKey>,
    done: bool,
}

impl Iterator for SliceScanner {
    type Item = crate::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let stmt = match self.inner.next()? {
                Ok(stmt) => stmt,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if let Some(begin) = &self.begin {
                if stmt.key < *begin {
                    continue;
                }
            }

            if let Some(end) = &self.end {
                if stmt.key >= *end {
                    self.done = true;
                    return None;
                }
            }

            return Some(Ok(stmt));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Slice;
    use crate::run::Run;
    use crate::run_writer::{RunWriter, RunWriterOptions};
    use crate::value::Statement;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;
    use test_log::test;

    fn write_run(dir: &std::path::Path, id: u64) -> crate::Result<Arc<Run>> {
        let mut writer = RunWriter::new(
            dir,
            id,
            RunWriterOptions {
                bloom_fpr: 0.05,
                page_size: 4_096,
            },
        );

        for key in ["a", "b", "c", "d"] {
            writer.append(&Statement::new_value(key, "x", 1))?;
        }

        let run = Arc::new(Run::new(id));
        run.set_info(writer.commit()?);
        Ok(run)
    }

    #[test]
    fn scan_clips_to_bounds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = write_run(dir.path(), 1)?;

        let slice = Slice::new(1, run, Some("b".into()), Some("d".into()));

        let keys: Vec<_> = slice
            .scan(dir.path())?
            .map(|s| s.map(|s| s.key))
            .collect::<crate::Result<_>>()?;

        assert_eq!(vec![crate::Bytes::from("b"), "c".into()], keys);

        Ok(())
    }

    #[test]
    fn slice_count_tracks_lifetime() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = write_run(dir.path(), 1)?;

        let a = Slice::new(1, run.clone(), None, None);
        let b = Slice::new(2, run.clone(), None, Some("c".into()));
        assert_eq!(2, run.slice_count.load(Relaxed));

        drop(a);
        drop(b);
        assert_eq!(0, run.slice_count.load(Relaxed));

        Ok(())
    }
}
