// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::run::{RunId, RunInfo, RUN_FORMAT_VERSION, RUN_MAGIC};
use crate::value::{Statement, TRAILER_TAG};
use crate::{Lsn, UserKey};
use byteorder::{WriteBytesExt, LE};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use varint_rs::VarintWriter;

/// Writer options snapshotted from the LSM tree when a task is created,
/// so a concurrent alter cannot race the worker thread.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RunWriterOptions {
    pub bloom_fpr: f64,
    pub page_size: u64,
}

struct ChecksummedWriter<W: Write> {
    inner: W,
    hasher: xxhash_rust::xxh3::Xxh3Default,
}

impl<W: Write> ChecksummedWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: xxhash_rust::xxh3::Xxh3Default::new(),
        }
    }

    fn digest(&self) -> u128 {
        self.hasher.digest128()
    }

    fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for ChecksummedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_opt_key<W: Write>(writer: &mut W, key: Option<&UserKey>) -> std::io::Result<()> {
    match key {
        None => writer.write_u8(0),
        Some(key) => {
            writer.write_u8(1)?;

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(key.len() as u32)?;
            writer.write_all(key)
        }
    }
}

/// Sequential run file emitter, running on a worker thread.
///
/// The file is created lazily on the first append, so committing a run
/// that received no statements leaves nothing on disk. Statements must
/// arrive in `(key ASC, lsn DESC)` order.
pub(crate) struct RunWriter {
    run_id: RunId,
    path: PathBuf,
    opts: RunWriterOptions,

    file: Option<ChecksummedWriter<BufWriter<File>>>,

    count: u64,
    size: u64,
    min_key: Option<UserKey>,
    max_key: Option<UserKey>,
    max_lsn: Option<Lsn>,
}

impl RunWriter {
    pub fn new(dir: &Path, run_id: RunId, opts: RunWriterOptions) -> Self {
        Self {
            run_id,
            path: crate::run::Run::file_path(dir, run_id),
            opts,
            file: None,
            count: 0,
            size: 0,
            min_key: None,
            max_key: None,
            max_lsn: None,
        }
    }

    fn create_file(&mut self) -> crate::Result<()> {
        log::trace!(
            "creating run file {:?} (page_size={}, bloom_fpr={})",
            self.path,
            self.opts.page_size,
            self.opts.bloom_fpr,
        );

        #[allow(clippy::cast_possible_truncation)]
        let buf_capacity = self.opts.page_size.max(512) as usize;

        let file = File::create(&self.path)?;
        let mut writer = ChecksummedWriter::new(BufWriter::with_capacity(buf_capacity, file));

        writer.write_all(RUN_MAGIC)?;
        writer.write_u8(RUN_FORMAT_VERSION)?;

        self.file = Some(writer);
        Ok(())
    }

    pub fn append(&mut self, stmt: &Statement) -> crate::Result<()> {
        if self.file.is_none() {
            self.create_file()?;
        }

        debug_assert!(
            self.max_key.as_ref().map_or(true, |max| *max <= stmt.key),
            "statements must arrive sorted",
        );

        let writer = self.file.as_mut().expect("file was just created");
        stmt.encode_into(writer)?;

        self.count += 1;
        self.size += stmt.approximate_size();
        self.max_lsn = Some(self.max_lsn.map_or(stmt.lsn, |lsn| lsn.max(stmt.lsn)));

        if self.min_key.is_none() {
            self.min_key = Some(stmt.key.clone());
        }

        if self.max_key.as_ref() != Some(&stmt.key) {
            self.max_key = Some(stmt.key.clone());
        }

        Ok(())
    }

    /// Finalizes the file and returns the run statistics.
    pub fn commit(mut self) -> crate::Result<RunInfo> {
        let Some(mut writer) = self.file.take() else {
            // Nothing was appended; no file exists
            return Ok(RunInfo::default());
        };

        writer.write_u8(TRAILER_TAG)?;
        writer.write_u64::<LE>(self.count)?;
        writer.write_u64::<LE>(self.size)?;
        writer.write_u64::<LE>(self.max_lsn.unwrap_or(0))?;
        write_opt_key(&mut writer, self.min_key.as_ref())?;
        write_opt_key(&mut writer, self.max_key.as_ref())?;

        let digest = writer.digest();
        writer.inner_mut().write_u128::<LE>(digest)?;
        writer.flush()?;
        writer.inner_mut().get_ref().sync_all()?;

        log::trace!("committed run file {:?} ({} statements)", self.path, self.count);

        Ok(RunInfo {
            count: self.count,
            size: self.size,
            min_key: self.min_key,
            max_key: self.max_key,
            max_lsn: self.max_lsn,
        })
    }

    /// Drops the partially written file.
    pub fn abort(mut self) {
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::error!("failed to remove aborted run file {:?}: {e}", self.path);
            }
        }

        log::debug!("aborted writing run {}", self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::{RunWriter, RunWriterOptions};
    use crate::run::{Run, RunScanner};
    use crate::value::Statement;
    use test_log::test;

    const OPTS: RunWriterOptions = RunWriterOptions {
        bloom_fpr: 0.05,
        page_size: 8 * 1_024,
    };

    #[test]
    fn roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let stmts = vec![
            Statement::new_value("a", "0", 9),
            Statement::new_value("a", "1", 4),
            Statement::new_tombstone("b", 7),
            Statement::new_value("c", "2", 1),
        ];

        let mut writer = RunWriter::new(dir.path(), 1, OPTS);
        for stmt in &stmts {
            writer.append(stmt)?;
        }
        let info = writer.commit()?;

        assert_eq!(4, info.count);
        assert_eq!(Some(9), info.max_lsn);
        assert_eq!(Some("a".into()), info.min_key);
        assert_eq!(Some("c".into()), info.max_key);

        let read: Vec<_> = RunScanner::open(&Run::file_path(dir.path(), 1))?
            .collect::<crate::Result<_>>()?;
        assert_eq!(stmts, read);

        Ok(())
    }

    #[test]
    fn empty_commit_leaves_no_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let writer = RunWriter::new(dir.path(), 1, OPTS);
        let info = writer.commit()?;

        assert_eq!(0, info.count);
        assert!(!Run::file_path(dir.path(), 1).exists());

        Ok(())
    }

    #[test]
    fn abort_removes_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = RunWriter::new(dir.path(), 1, OPTS);
        writer.append(&Statement::new_value("a", "0", 1))?;
        assert!(Run::file_path(dir.path(), 1).exists());

        writer.abort();
        assert!(!Run::file_path(dir.path(), 1).exists());

        Ok(())
    }

    #[test]
    fn detects_truncated_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = RunWriter::new(dir.path(), 1, OPTS);
        for i in 0..100u32 {
            writer.append(&Statement::new_value(
                format!("key{i:03}").as_bytes(),
                "x",
                u64::from(i) + 1,
            ))?;
        }
        writer.commit()?;

        let path = Run::file_path(dir.path(), 1);
        let data = std::fs::read(&path)?;
        std::fs::write(&path, &data[..data.len() - 1])?;

        let result: crate::Result<Vec<_>> = RunScanner::open(&path)?.collect();
        assert!(result.is_err());

        Ok(())
    }
}
