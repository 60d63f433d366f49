//! Immutable buckets.
//!
//! A [`Bucket`] is one sorted, hashed file plus its index. Buckets are
//! immutable once registered and are shared by reference count: any
//! number of snapshots may point at the same bucket, and the file
//! outlives every snapshot that references it.
//!
//! The empty bucket is a sentinel with no file and the zero hash; all
//! reads against it short-circuit.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Limits, ReadXdr};

use strata_common::Hash256;

use crate::entry::BucketEntry;
use crate::index::{BucketIndex, IndexConfig};
use crate::{BucketError, Result};

/// One immutable bucket file with its content hash and index.
pub struct Bucket {
    hash: Hash256,
    file: Option<PathBuf>,
    index: OnceLock<BucketIndex>,
    index_config: IndexConfig,
}

impl Bucket {
    /// The empty bucket sentinel: no file, zero hash, empty index.
    pub fn empty() -> Self {
        let index = OnceLock::new();
        let _ = index.set(BucketIndex::empty());
        Self {
            hash: Hash256::ZERO,
            file: None,
            index,
            index_config: IndexConfig::default(),
        }
    }

    /// Loads a bucket from an existing file, computing its hash and
    /// building the index by streaming the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with_config(path, IndexConfig::default())
    }

    pub fn from_file_with_config(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref();
        let hash = hash_file(path)?;
        let index = OnceLock::new();
        let _ = index.set(BucketIndex::from_file(path, &config)?);
        Ok(Self {
            hash,
            file: Some(path.to_path_buf()),
            index,
            index_config: config,
        })
    }

    /// Wraps a freshly written file whose hash is already known.
    ///
    /// Used by the bucket manager when adopting merge output; the index
    /// may have been built on the fly, otherwise it is built lazily on
    /// first read.
    pub(crate) fn adopted(path: PathBuf, hash: Hash256, index: Option<BucketIndex>) -> Self {
        let cell = OnceLock::new();
        if let Some(index) = index {
            let _ = cell.set(index);
        }
        Self {
            hash,
            file: Some(path),
            index: cell,
            index_config: IndexConfig::default(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_none()
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// True once the index has been built (or supplied at adoption).
    pub fn is_indexed(&self) -> bool {
        self.index.get().is_some()
    }

    /// Supplies an index for a bucket adopted without one. A loss in the
    /// set race just means another thread indexed first.
    pub(crate) fn set_index(&self, index: BucketIndex) {
        let _ = self.index.set(index);
    }

    /// The bucket's index, built from the file on first use.
    pub fn index(&self) -> Result<&BucketIndex> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let path = self
            .file
            .as_deref()
            .expect("empty buckets are indexed at construction");
        let built = BucketIndex::from_file(path, &self.index_config)?;
        let _ = self.index.set(built);
        Ok(self.index.get().expect("index was just set"))
    }

    /// Streams the bucket's entries in file order.
    pub fn iter(&self) -> Result<BucketIter> {
        let frames = match &self.file {
            Some(path) => Some(stream_frames(path)?),
            None => None,
        };
        Ok(BucketIter { frames })
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("hash", &self.hash.to_hex())
            .field("file", &self.file)
            .finish()
    }
}

/// Hashes a bucket file: SHA-256 over every record byte in file order,
/// record marks included.
fn hash_file(path: &Path) -> Result<Hash256> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Hash256::from_bytes(hasher.finalize().into()))
}

/// Iterator over the decoded entries of a bucket file.
pub struct BucketIter {
    frames: Option<FrameIter>,
}

impl Iterator for BucketIter {
    type Item = Result<BucketEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let frames = self.frames.as_mut()?;
        frames.next().map(|r| r.map(|(entry, _)| entry))
    }
}

/// Streams `(entry, record_offset)` pairs from a record-marked bucket
/// file, one frame at a time.
pub(crate) fn stream_frames(path: &Path) -> Result<FrameIter> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    Ok(FrameIter {
        reader: BufReader::new(file),
        file_len,
        position: 0,
    })
}

pub(crate) struct FrameIter {
    reader: BufReader<File>,
    file_len: u64,
    position: u64,
}

impl Iterator for FrameIter {
    type Item = Result<(BucketEntry, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position + 4 > self.file_len {
            return None;
        }
        let record_start = self.position;

        let mut mark = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut mark) {
            return Some(Err(BucketError::Io(e)));
        }
        self.position += 4;

        let record_len = (u32::from_be_bytes(mark) & 0x7FFF_FFFF) as u64;
        if self.position + record_len > self.file_len {
            return None;
        }

        let mut payload = vec![0u8; record_len as usize];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            return Some(Err(BucketError::Io(e)));
        }
        self.position += record_len;

        match stellar_xdr::curr::BucketEntry::from_xdr(&payload, Limits::none()) {
            Ok(entry) => Some(Ok((BucketEntry::from_xdr_entry(entry), record_start))),
            Err(e) => Some(Err(BucketError::Serialization(format!(
                "failed to decode bucket record at offset {record_start}: {e}"
            )))),
        }
    }
}
