// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::Statement;
use crate::{Lsn, UserKey};
use byteorder::{ReadBytesExt, LE};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::OnceLock;
use varint_rs::VarintReader;

/// Identifier of a run, allocated by the metadata log.
pub type RunId = u64;

pub(crate) const RUN_MAGIC: &[u8; 4] = b"VRUN";
pub(crate) const RUN_FORMAT_VERSION: u8 = 1;

/// Statistics of a finished run file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunInfo {
    /// Number of statements.
    pub count: u64,

    /// Payload bytes.
    pub size: u64,

    /// Smallest key, `None` for an empty run.
    pub min_key: Option<UserKey>,

    /// Largest key, `None` for an empty run.
    pub max_key: Option<UserKey>,

    /// Max LSN of any statement.
    pub max_lsn: Option<Lsn>,
}

/// An immutable sorted file of statements, produced by one dump or
/// compaction.
///
/// A run is owned by the task that writes it until task completion hands
/// it over to the LSM tree (or abort discards it through the metadata log).
pub struct Run {
    id: RunId,

    /// Max LSN the run covers; on recovery, statements up to here are not
    /// replayed from the WAL for this tree. 0 = not assigned yet.
    dump_lsn: AtomicU64,

    info: OnceLock<RunInfo>,

    /// Live slices referencing this run.
    pub(crate) slice_count: AtomicUsize,

    /// Scratch counter used by compaction completion to find runs whose
    /// every slice was just compacted.
    pub(crate) compacted_slice_count: AtomicUsize,
}

impl Run {
    #[must_use]
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            dump_lsn: AtomicU64::new(0),
            info: OnceLock::new(),
            slice_count: AtomicUsize::new(0),
            compacted_slice_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn dump_lsn(&self) -> Option<Lsn> {
        match self.dump_lsn.load(Relaxed) {
            0 => None,
            lsn => Some(lsn),
        }
    }

    /// Raises the run's dump LSN; keeps the max when called repeatedly.
    pub(crate) fn note_dump_lsn(&self, lsn: Lsn) {
        self.dump_lsn.fetch_max(lsn, Relaxed);
    }

    pub(crate) fn set_info(&self, info: RunInfo) {
        // A run is written exactly once
        let _ = self.info.set(info);
    }

    pub fn info(&self) -> Option<&RunInfo> {
        self.info.get()
    }

    /// Whether the writer produced no statements.
    pub fn is_empty(&self) -> bool {
        self.info.get().map_or(true, |info| info.count == 0)
    }

    pub(crate) fn file_path(dir: &Path, id: RunId) -> PathBuf {
        dir.join(format!("{id:08}.run"))
    }

    /// Opens a scanner over the whole run.
    pub(crate) fn scan(&self, dir: &Path) -> crate::Result<RunScanner> {
        RunScanner::open(&Self::file_path(dir, self.id))
    }

    /// Physically removes the run's files.
    pub(crate) fn remove_files(&self, dir: &Path) -> std::io::Result<()> {
        let path = Self::file_path(dir, self.id);
        std::fs::remove_file(&path)?;
        log::debug!("removed run file {path:?}");
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Run({})", self.id)
    }
}

/// Reader that hashes everything it reads, for trailer verification.
pub(crate) struct ChecksummedReader<R: Read> {
    inner: R,
    hasher: xxhash_rust::xxh3::Xxh3Default,
}

impl<R: Read> ChecksummedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: xxhash_rust::xxh3::Xxh3Default::new(),
        }
    }

    pub fn digest(&self) -> u128 {
        self.hasher.digest128()
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for ChecksummedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;

        if let Some(read) = buf.get(..n) {
            self.hasher.update(read);
        }

        Ok(n)
    }
}

pub(crate) fn read_opt_key<R: Read>(reader: &mut R) -> crate::Result<Option<UserKey>> {
    if reader.read_u8()? == 0 {
        return Ok(None);
    }

    let len = reader.read_u32_varint()? as usize;
    let mut key = vec![0; len];
    reader.read_exact(&mut key)?;
    Ok(Some(key.into()))
}

/// Sequential reader over one run file.
///
/// Statements come back in `(key ASC, lsn DESC)` order, as written. The
/// trailer checksum is verified when the end of data is reached.
pub(crate) struct RunScanner {
    reader: ChecksummedReader<BufReader<File>>,
    finished: bool,
}

impl RunScanner {
    pub fn open(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;
        let mut reader = ChecksummedReader::new(BufReader::new(file));

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if &magic != RUN_MAGIC {
            return Err(crate::Error::Corrupted("bad magic"));
        }

        if reader.read_u8()? != RUN_FORMAT_VERSION {
            return Err(crate::Error::Corrupted("unsupported format version"));
        }

        Ok(Self {
            reader,
            finished: false,
        })
    }

    fn verify_trailer(&mut self) -> crate::Result<()> {
        // Footer fields go through the hasher as well; only the checksum
        // itself is read raw.
        let _count = self.reader.read_u64::<LE>()?;
        let _size = self.reader.read_u64::<LE>()?;
        let _max_lsn = self.reader.read_u64::<LE>()?;
        let _min_key = read_opt_key(&mut self.reader)?;
        let _max_key = read_opt_key(&mut self.reader)?;

        let digest = self.reader.digest();
        let expected = self.reader.inner_mut().read_u128::<LE>()?;

        if digest == expected {
            Ok(())
        } else {
            Err(crate::Error::Corrupted("checksum mismatch"))
        }
    }
}

impl Iterator for RunScanner {
    type Item = crate::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match Statement::decode_from(&mut self.reader) {
            Ok(Some(stmt)) => Some(Ok(stmt)),
            Ok(None) => {
                self.finished = true;

                match self.verify_trailer() {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                }
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
