//! Bucket file registry.
//!
//! The [`BucketManager`] owns the directory of canonical bucket files
//! and the process-wide registry mapping content hashes to shared
//! [`Bucket`] handles. Merge sinks hand their finished temp files to
//! [`BucketManager::adopt_file_as_bucket`], which renames them into
//! place and dedupes against buckets that already exist with the same
//! hash.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use strata_common::Hash256;

use crate::bucket::Bucket;
use crate::index::BucketIndex;
use crate::Result;

/// Identifies one merge by its inputs.
///
/// Recorded when a merge produces no output so the scheduler does not
/// wait for a bucket that will never appear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub keep_tombstones: bool,
    pub input_curr: Hash256,
    pub input_snap: Hash256,
}

impl MergeKey {
    pub fn new(keep_tombstones: bool, input_curr: Hash256, input_snap: Hash256) -> Self {
        Self {
            keep_tombstones,
            input_curr,
            input_snap,
        }
    }
}

/// Canonical on-disk name for a bucket with the given hash.
pub fn canonical_bucket_filename(hash: &Hash256) -> String {
    format!("{}.bucket.xdr", hash.to_hex())
}

/// A fresh, collision-unlikely temp path for in-progress merge output.
pub fn random_bucket_path(dir: &Path) -> PathBuf {
    let nonce: u64 = rand::thread_rng().gen();
    dir.join(format!("tmp-bucket-{nonce:016x}.xdr"))
}

/// Registry of live bucket files keyed by content hash.
pub struct BucketManager {
    bucket_dir: PathBuf,
    buckets: Mutex<HashMap<Hash256, Arc<Bucket>>>,
    empty_merge_outputs: Mutex<HashSet<MergeKey>>,
    empty_bucket: Arc<Bucket>,
}

impl BucketManager {
    pub fn new(bucket_dir: impl Into<PathBuf>) -> Self {
        Self {
            bucket_dir: bucket_dir.into(),
            buckets: Mutex::new(HashMap::new()),
            empty_merge_outputs: Mutex::new(HashSet::new()),
            empty_bucket: Arc::new(Bucket::empty()),
        }
    }

    /// Directory holding canonical bucket files.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// The shared empty-bucket sentinel.
    pub fn empty_bucket(&self) -> Arc<Bucket> {
        Arc::clone(&self.empty_bucket)
    }

    /// Looks up a registered bucket by hash.
    pub fn get_if_exists(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        if hash.is_zero() {
            return Some(self.empty_bucket());
        }
        self.buckets.lock().get(hash).cloned()
    }

    /// Registers a finished merge output file as a bucket.
    ///
    /// If a bucket with the same hash is already registered, the new
    /// file is deleted and the existing handle returned; an index built
    /// for the new file is donated to the existing bucket when it has
    /// none. Otherwise the file is renamed to its canonical path and a
    /// new handle registered.
    pub fn adopt_file_as_bucket(
        &self,
        path: &Path,
        hash: Hash256,
        merge_key: Option<&MergeKey>,
        index: Option<BucketIndex>,
    ) -> Result<Arc<Bucket>> {
        let mut buckets = self.buckets.lock();

        if let Some(existing) = buckets.get(&hash) {
            tracing::debug!(
                hash = %hash.to_hex(),
                file = %path.display(),
                "adopting duplicate bucket, reusing existing file"
            );
            if let Some(index) = index {
                if !existing.is_indexed() {
                    existing.set_index(index);
                }
            }
            fs::remove_file(path)?;
            return Ok(Arc::clone(existing));
        }

        let canonical = self.bucket_dir.join(canonical_bucket_filename(&hash));
        fs::rename(path, &canonical)?;

        tracing::debug!(
            hash = %hash.to_hex(),
            file = %canonical.display(),
            merge_key = ?merge_key,
            "adopted bucket file"
        );

        let bucket = Arc::new(Bucket::adopted(canonical, hash, index));
        buckets.insert(hash, Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Records that the merge identified by `merge_key` produced nothing.
    pub fn note_empty_merge_output(&self, merge_key: &MergeKey) {
        tracing::debug!(?merge_key, "merge produced empty output");
        self.empty_merge_outputs.lock().insert(merge_key.clone());
    }

    /// Whether `merge_key` was recorded as producing empty output.
    pub fn is_empty_merge_output(&self, merge_key: &MergeKey) -> bool {
        self.empty_merge_outputs.lock().contains(merge_key)
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("registered", &self.buckets.lock().len())
            .finish()
    }
}
