// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};
use std::sync::Arc;
use varint_rs::{VarintReader, VarintWriter};

/// An immutable byte slice that can be cloned without additional heap allocation
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Bytes(Arc<[u8]>);

impl Bytes {
    /// Construct from a byte slice.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    /// Returns the number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the slice contains no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Bytes {
    fn from(value: &[u8]) -> Self {
        Self(value.into())
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl From<&str> for Bytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().into())
    }
}

impl std::borrow::Borrow<[u8]> for Bytes {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// User defined key
pub type UserKey = Bytes;

/// User defined value (blob of bytes)
pub type UserValue = Bytes;

/// Log sequence number.
///
/// Assigned by the write-ahead log on commit; a statement with a higher LSN
/// shadows a statement with the same key and a lower LSN. LSN 0 is reserved,
/// real LSNs start at 1, so "no data" is representable as `Option<Lsn>`
/// without a magic sentinel.
pub type Lsn = u64;

/// Statement type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            _ => Err(()),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
        }
    }
}

/// End-of-data marker in a run file, distinct from any statement tag.
pub(crate) const TRAILER_TAG: u8 = 2;

/// A single versioned key-value statement
#[derive(Clone, Eq, PartialEq)]
pub struct Statement {
    /// User key
    pub key: UserKey,

    /// Log sequence number the statement was committed at
    pub lsn: Lsn,

    /// Value or tombstone
    pub value_type: ValueType,

    /// User value (empty for tombstones)
    pub value: UserValue,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.key,
            self.lsn,
            match self.value_type {
                ValueType::Value => "value",
                ValueType::Tombstone => "tombstone",
            },
        )
    }
}

impl Statement {
    /// Creates a new value statement.
    #[must_use]
    pub fn new_value<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V, lsn: Lsn) -> Self {
        Self {
            key: key.into(),
            lsn,
            value_type: ValueType::Value,
            value: value.into(),
        }
    }

    /// Creates a new tombstone statement.
    #[must_use]
    pub fn new_tombstone<K: Into<UserKey>>(key: K, lsn: Lsn) -> Self {
        Self {
            key: key.into(),
            lsn,
            value_type: ValueType::Tombstone,
            value: Bytes::new(&[]),
        }
    }

    /// Builds the synthetic DELETE replayed into secondary indexes when
    /// `old` is discovered overwritten during primary-index compaction.
    ///
    /// Only the key of `old` survives; the LSN is the one of the statement
    /// that did the overwrite, so replay orders correctly against the WAL.
    #[must_use]
    pub fn surrogate_delete(old: &Self, lsn: Lsn) -> Self {
        Self::new_tombstone(old.key.clone(), lsn)
    }

    /// Returns `true` if the statement is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }

    /// Approximate heap size, used for memory accounting.
    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        (self.key.len() + self.value.len() + std::mem::size_of::<Lsn>() + 1) as u64
    }

    pub(crate) fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(u8::from(self.value_type))?;

        // NOTE: Key bytes are varint-prefixed; keys are limited to 2^16 bytes anyway
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.key.len() as u32)?;
        writer.write_all(&self.key)?;

        writer.write_u64::<LE>(self.lsn)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.value.len() as u32)?;
        writer.write_all(&self.value)?;

        Ok(())
    }

    /// Decodes the next statement, or `None` when the trailer tag is reached.
    pub(crate) fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Option<Self>> {
        let tag = reader.read_u8()?;

        if tag == TRAILER_TAG {
            return Ok(None);
        }

        let value_type =
            ValueType::try_from(tag).map_err(|()| crate::Error::Corrupted("invalid value tag"))?;

        let key_len = reader.read_u32_varint()? as usize;
        let mut key = vec![0; key_len];
        reader.read_exact(&mut key)?;

        let lsn = reader.read_u64::<LE>()?;

        let value_len = reader.read_u32_varint()? as usize;
        let mut value = vec![0; value_len];
        reader.read_exact(&mut value)?;

        Ok(Some(Self {
            key: key.into(),
            lsn,
            value_type,
            value: value.into(),
        }))
    }
}

/// Key of a statement inside an in-memory tree.
///
/// Sorted by key ascending, then LSN *descending*, so that for any key the
/// newest version comes first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StmtKey {
    pub key: UserKey,
    pub lsn: Lsn,
}

impl Ord for StmtKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.lsn.cmp(&self.lsn))
    }
}

impl PartialOrd for StmtKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
