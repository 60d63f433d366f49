//! Write-side merge sink.
//!
//! A [`BucketOutputIterator`] absorbs an ordered stream of entries and
//! produces one hashed bucket file. It enforces the sorted-input
//! contract, deduplicates adjacent same-key entries through a one-entry
//! buffer, elides tombstones at the bottom level, rewrites bottom-level
//! live entries to init entries, and hashes every record byte as it is
//! written.
//!
//! The iterator is generic over [`BucketKind`], so the live and
//! hot-archive cascades share the machinery while keeping their own
//! tombstone semantics and payload validation.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::BucketMetadata;

use strata_common::protocol::protocol_version_starts_from;
use strata_common::Hash256;

use crate::bucket::Bucket;
use crate::entry::BucketKind;
use crate::index::{BucketIndex, IndexConfig};
use crate::manager::{random_bucket_path, BucketManager, MergeKey};
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// Fine-grained counters for merge events.
///
/// These stay out of any metrics registry on purpose: merges should run
/// as fast as possible, and this granularity only matters in tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeCounters {
    pub output_iterator_tombstone_elisions: u64,
    pub output_iterator_buffer_updates: u64,
    pub output_iterator_actual_writes: u64,
    pub output_iterator_live_to_init_rewrites: u64,
}

impl AddAssign<&MergeCounters> for MergeCounters {
    fn add_assign(&mut self, delta: &MergeCounters) {
        self.output_iterator_tombstone_elisions += delta.output_iterator_tombstone_elisions;
        self.output_iterator_buffer_updates += delta.output_iterator_buffer_updates;
        self.output_iterator_actual_writes += delta.output_iterator_actual_writes;
        self.output_iterator_live_to_init_rewrites += delta.output_iterator_live_to_init_rewrites;
    }
}

/// Streaming sink that turns sorted entries into one bucket file.
///
/// `keep_tombstones` is `false` only when writing the bottom level of a
/// cascade, where tombstones have nothing left to shadow.
pub struct BucketOutputIterator<'a, K: BucketKind> {
    filename: PathBuf,
    out: Option<BufWriter<File>>,
    buf: Option<K::Entry>,
    keep_tombstones: bool,
    meta: BucketMetadata,
    meta_written: bool,
    bytes_put: u64,
    objects_put: u64,
    hasher: Sha256,
    counters: &'a mut MergeCounters,
    do_fsync: bool,
}

impl<'a, K: BucketKind> BucketOutputIterator<'a, K> {
    /// Opens a uniquely named output file in `tmp_dir` and, when the
    /// protocol allows metadata records, writes the metadata header as
    /// the very first record.
    pub fn new(
        tmp_dir: &Path,
        keep_tombstones: bool,
        meta: BucketMetadata,
        counters: &'a mut MergeCounters,
        do_fsync: bool,
    ) -> Result<Self> {
        let filename = random_bucket_path(tmp_dir);
        tracing::trace!(file = %filename.display(), "bucket output iterator opening file");
        let out = BufWriter::new(File::create(&filename)?);

        let mut iter = Self {
            filename,
            out: Some(out),
            buf: None,
            keep_tombstones,
            meta,
            meta_written: false,
            bytes_put: 0,
            objects_put: 0,
            hasher: Sha256::new(),
            counters,
            do_fsync,
        };

        if protocol_version_starts_from(
            iter.meta.ledger_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        ) {
            K::check_meta_legality(&iter.meta)?;
            let meta_entry = K::make_meta_entry(iter.meta.clone());
            // The header is hashed like every other record but kept out
            // of the data-entry accounting.
            iter.write_frame(&meta_entry)?;
            iter.meta_written = true;
        }

        Ok(iter)
    }

    /// Absorbs one entry.
    ///
    /// # Panics
    ///
    /// Panics if `entry` sorts before the previously buffered entry:
    /// feeding unsorted input is a bug in the merge driving this sink.
    pub fn put(&mut self, entry: K::Entry) -> Result<()> {
        K::check_legality(&entry, self.meta.ledger_version)?;

        if K::is_metadata(&entry) && self.meta_written {
            return Err(BucketError::InvalidEntry(
                "metadata entry after the first bucket record".to_string(),
            ));
        }

        // Tombstones at the bottom level have nothing to shadow: drop.
        if !self.keep_tombstones && K::is_tombstone(&entry) {
            self.counters.output_iterator_tombstone_elisions += 1;
            return Ok(());
        }

        if let Some(buffered) = self.buf.take() {
            assert!(
                K::compare(&entry, &buffered) != Ordering::Less,
                "out-of-order entry fed to bucket output iterator"
            );
            if K::compare(&buffered, &entry) == Ordering::Less {
                // Larger identity: the buffered entry is final, write it.
                self.flush_buffered(&buffered)?;
                self.counters.output_iterator_actual_writes += 1;
            }
            // Same identity: the new entry simply replaces the buffer.
        }

        let (entry, rewritten) = if self.keep_tombstones {
            (entry, false)
        } else {
            K::maybe_rewrite_live_to_init(entry, self.meta.ledger_version)
        };
        if rewritten {
            self.counters.output_iterator_live_to_init_rewrites += 1;
        }

        self.counters.output_iterator_buffer_updates += 1;
        self.buf = Some(entry);
        Ok(())
    }

    /// Bytes of data records written so far (header excluded).
    pub fn bytes_put(&self) -> u64 {
        self.bytes_put
    }

    /// Data records written so far (header excluded).
    pub fn objects_put(&self) -> u64 {
        self.objects_put
    }

    /// Path of the in-progress output file.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Flushes the final buffered entry, closes the file and registers
    /// it with the bucket manager.
    ///
    /// A run that wrote no data records deletes its file, notifies the
    /// manager through `merge_key` when one is provided, and returns the
    /// empty-bucket sentinel.
    pub fn finalize(
        mut self,
        bucket_manager: &BucketManager,
        synchronously_index: bool,
        merge_key: Option<&MergeKey>,
    ) -> Result<Arc<Bucket>> {
        if let Some(buffered) = self.buf.take() {
            self.flush_buffered(&buffered)?;
        }

        let writer = self.out.take().expect("output stream open until finalize");
        let file = writer.into_inner().map_err(|e| {
            BucketError::Io(std::io::Error::other(format!(
                "failed to flush bucket output: {e}"
            )))
        })?;
        if self.do_fsync {
            file.sync_all()?;
        }
        drop(file);

        if self.objects_put == 0 {
            assert_eq!(self.bytes_put, 0, "no records written but bytes counted");
            tracing::debug!(file = %self.filename.display(), "deleting empty bucket output");
            fs::remove_file(&self.filename)?;
            if let Some(merge_key) = merge_key {
                bucket_manager.note_empty_merge_output(merge_key);
            }
            return Ok(bucket_manager.empty_bucket());
        }

        let hash = Hash256::from_bytes(self.hasher.finalize().into());

        // Index now when asked to, unless an indexed bucket with this
        // hash already exists.
        let mut index = None;
        if synchronously_index {
            let already_indexed = bucket_manager
                .get_if_exists(&hash)
                .is_some_and(|b| b.is_indexed());
            if !already_indexed {
                index = Some(BucketIndex::from_file(
                    &self.filename,
                    &IndexConfig::default(),
                )?);
            }
        }

        bucket_manager.adopt_file_as_bucket(&self.filename, hash, merge_key, index)
    }

    /// Writes one record frame: record mark, payload, hash update.
    fn write_frame(&mut self, entry: &K::Entry) -> Result<u64> {
        let payload = K::serialize(entry)?;
        let mark = (payload.len() as u32) | 0x8000_0000;
        let out = self.out.as_mut().expect("output stream open");
        out.write_all(&mark.to_be_bytes())?;
        out.write_all(&payload)?;
        self.hasher.update(mark.to_be_bytes());
        self.hasher.update(&payload);
        Ok(payload.len() as u64 + 4)
    }

    fn flush_buffered(&mut self, entry: &K::Entry) -> Result<()> {
        let frame_len = self.write_frame(entry)?;
        self.bytes_put += frame_len;
        self.objects_put += 1;
        Ok(())
    }
}
