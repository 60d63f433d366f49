//! Per-bucket key index.
//!
//! Every non-empty bucket carries a [`BucketIndex`] mapping entry
//! identities to byte offsets in the bucket file. Two strategies sit
//! behind one type:
//!
//! - **Key-level** (small buckets): every key is indexed with its exact
//!   record offset. `page_size()` is 0 and readers decode exactly one
//!   record per hit.
//! - **Page-level** (large buckets): keys are grouped into byte-aligned
//!   pages and only each page's key range is kept. `page_size()` is
//!   nonzero and readers must scan within the returned page.
//!
//! Both strategies carry a seeded binary fuse filter for cheap negative
//! lookups and a reverse map from assets to the liquidity pools that
//! contain them.
//!
//! Point lookups go through [`BucketIndex::lookup`]. Bulk lookups use
//! the resumable [`BucketIndex::scan`] so that a sorted sweep of N keys
//! costs one pass over the index instead of N independent searches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Asset, LedgerKey, Limits, PoolId, WriteXdr};

use crate::bloom_filter::{BucketBloomFilter, HashSeed};
use crate::bucket;
use crate::entry::BucketEntry;
use crate::Result;

/// Default page size for page-level indexes, in bytes.
pub const DEFAULT_PAGE_SIZE: u64 = 16 * 1024;

/// File-size cutoff above which the page-level strategy is selected.
pub const DEFAULT_INDEX_CUTOFF: u64 = 20 * 1024 * 1024;

/// Buckets with fewer keys than this skip the bloom filter entirely.
const BLOOM_MIN_KEYS: usize = 2;

/// Hash seed used when no caller-specific seed is in play.
pub const DEFAULT_BLOOM_SEED: HashSeed = [0u8; 16];

/// Index construction parameters.
///
/// The defaults match production sizing; tests shrink `cutoff` to force
/// the page-level strategy onto small files.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    pub page_size: u64,
    pub cutoff: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cutoff: DEFAULT_INDEX_CUTOFF,
        }
    }
}

/// Opaque, monotone position for [`BucketIndex::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor(usize);

fn hash_asset(asset: &Asset) -> [u8; 32] {
    let bytes = asset.to_xdr(Limits::none()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// The key range covered by one page of the bucket file.
#[derive(Debug, Clone)]
struct PageEntry {
    lower: LedgerKey,
    upper: LedgerKey,
    offset: u64,
}

enum IndexKind {
    /// Exact per-key offsets, kept sorted by key.
    KeyLevel { entries: Vec<(LedgerKey, u64)> },
    /// Per-page key ranges; a hit names the page start offset.
    PageLevel { page_size: u64, pages: Vec<PageEntry> },
}

/// Index over one immutable bucket file.
pub struct BucketIndex {
    kind: IndexKind,
    bloom: Option<BucketBloomFilter>,
    bloom_seed: HashSeed,
    pools_by_asset: HashMap<[u8; 32], Vec<PoolId>>,
    key_count: usize,
    bloom_misses: AtomicU64,
}

impl BucketIndex {
    /// An index over nothing; every lookup misses. Used by the empty
    /// bucket sentinel.
    pub fn empty() -> Self {
        Self {
            kind: IndexKind::KeyLevel {
                entries: Vec::new(),
            },
            bloom: None,
            bloom_seed: DEFAULT_BLOOM_SEED,
            pools_by_asset: HashMap::new(),
            key_count: 0,
            bloom_misses: AtomicU64::new(0),
        }
    }

    /// Builds an index from `(entry, offset)` pairs in file order.
    ///
    /// Metadata records carry no identity and are not indexed. The
    /// strategy is picked by comparing `file_len` against the configured
    /// cutoff.
    pub fn from_entries<I>(entries: I, file_len: u64, config: &IndexConfig) -> Self
    where
        I: IntoIterator<Item = (BucketEntry, u64)>,
    {
        let paged = config.page_size > 0 && file_len >= config.cutoff;
        let bloom_seed = DEFAULT_BLOOM_SEED;

        let mut key_entries: Vec<(LedgerKey, u64)> = Vec::new();
        let mut pages: Vec<PageEntry> = Vec::new();
        let mut page_upper_bound = 0u64;
        let mut bloom_hashes: Vec<u64> = Vec::new();
        let mut pools_by_asset: HashMap<[u8; 32], Vec<PoolId>> = HashMap::new();

        for (entry, offset) in entries {
            let Some(key) = entry.key() else { continue };

            bloom_hashes.push(BucketBloomFilter::hash_key(&key, &bloom_seed));

            if let Some(e) = entry.live_entry() {
                if let stellar_xdr::curr::LedgerEntryData::LiquidityPool(pool) = &e.data {
                    let stellar_xdr::curr::LiquidityPoolEntryBody::LiquidityPoolConstantProduct(
                        cp,
                    ) = &pool.body;
                    for asset in [&cp.params.asset_a, &cp.params.asset_b] {
                        pools_by_asset
                            .entry(hash_asset(asset))
                            .or_default()
                            .push(pool.liquidity_pool_id.clone());
                    }
                }
            }

            if paged {
                // A new page starts whenever the record offset crosses the
                // next page boundary.
                if pages.is_empty() || offset >= page_upper_bound {
                    page_upper_bound = (offset / config.page_size + 1) * config.page_size;
                    pages.push(PageEntry {
                        lower: key.clone(),
                        upper: key,
                        offset,
                    });
                } else {
                    pages
                        .last_mut()
                        .expect("page list is non-empty here")
                        .upper = key;
                }
            } else {
                key_entries.push((key, offset));
            }
        }

        let key_count = bloom_hashes.len();
        let bloom = if key_count >= BLOOM_MIN_KEYS {
            BucketBloomFilter::from_hashes(&bloom_hashes, &bloom_seed).ok()
        } else {
            None
        };

        let kind = if paged {
            IndexKind::PageLevel {
                page_size: config.page_size,
                pages,
            }
        } else {
            IndexKind::KeyLevel {
                entries: key_entries,
            }
        };

        let index = Self {
            kind,
            bloom,
            bloom_seed,
            pools_by_asset,
            key_count,
            bloom_misses: AtomicU64::new(0),
        };

        tracing::debug!(
            keys = index.key_count,
            file_len,
            paged,
            bloom_bytes = index.bloom.as_ref().map_or(0, |f| f.size_bytes()),
            "built bucket index"
        );
        index
    }

    /// Builds an index by streaming a bucket file from disk.
    pub fn from_file(path: &Path, config: &IndexConfig) -> Result<Self> {
        let file_len = std::fs::metadata(path)?.len();
        let mut frames = Vec::new();
        for frame in bucket::stream_frames(path)? {
            let (entry, offset) = frame?;
            frames.push((entry, offset));
        }
        Ok(Self::from_entries(frames, file_len, config))
    }

    /// Probabilistic point lookup.
    ///
    /// `None` means the key is definitely absent (or was rejected by the
    /// bloom filter). `Some(offset)` names a record or page that *may*
    /// contain the key; page-level callers must verify.
    pub fn lookup(&self, key: &LedgerKey) -> Option<u64> {
        if !self.may_contain(key) {
            return None;
        }
        match &self.kind {
            IndexKind::KeyLevel { entries } => entries
                .binary_search_by(|(k, _)| k.cmp(key))
                .ok()
                .map(|i| entries[i].1),
            IndexKind::PageLevel { pages, .. } => {
                let i = pages.partition_point(|p| p.upper < *key);
                match pages.get(i) {
                    Some(p) if p.lower <= *key => Some(p.offset),
                    _ => None,
                }
            }
        }
    }

    /// Starting cursor for a sorted sweep.
    pub fn begin(&self) -> ScanCursor {
        ScanCursor(0)
    }

    /// Resumable forward scan.
    ///
    /// Advances the cursor past every index position whose keys are
    /// smaller than `key`, then reports a hit the same way [`lookup`]
    /// does. Feeding keys in ascending order makes a whole sweep cost one
    /// pass over the index.
    ///
    /// [`lookup`]: Self::lookup
    pub fn scan(&self, cursor: ScanCursor, key: &LedgerKey) -> (Option<u64>, ScanCursor) {
        match &self.kind {
            IndexKind::KeyLevel { entries } => {
                let mut i = cursor.0;
                while i < entries.len() && entries[i].0 < *key {
                    i += 1;
                }
                match entries.get(i) {
                    Some((k, offset)) if k == key => (Some(*offset), ScanCursor(i)),
                    _ => (None, ScanCursor(i)),
                }
            }
            IndexKind::PageLevel { pages, .. } => {
                let mut i = cursor.0;
                while i < pages.len() && pages[i].upper < *key {
                    i += 1;
                }
                match pages.get(i) {
                    Some(p) if p.lower <= *key => (Some(p.offset), ScanCursor(i)),
                    _ => (None, ScanCursor(i)),
                }
            }
        }
    }

    /// True when a cursor has moved past the last index position.
    pub fn at_end(&self, cursor: ScanCursor) -> bool {
        let len = match &self.kind {
            IndexKind::KeyLevel { entries } => entries.len(),
            IndexKind::PageLevel { pages, .. } => pages.len(),
        };
        cursor.0 >= len
    }

    /// Page size in bytes; 0 means offsets are exact record positions.
    pub fn page_size(&self) -> u64 {
        match &self.kind {
            IndexKind::KeyLevel { .. } => 0,
            IndexKind::PageLevel { page_size, .. } => *page_size,
        }
    }

    /// Liquidity pools containing `asset`, recorded at index build time.
    pub fn pool_ids_by_asset(&self, asset: &Asset) -> &[PoolId] {
        self.pools_by_asset
            .get(&hash_asset(asset))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Records that a looked-up offset did not actually contain the key.
    pub fn mark_bloom_miss(&self) {
        self.bloom_misses.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::trace!("bloom filter false positive");
    }

    /// Number of recorded bloom misses.
    pub fn bloom_miss_count(&self) -> u64 {
        self.bloom_misses.load(AtomicOrdering::Relaxed)
    }

    /// Number of indexed keys.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    fn may_contain(&self, key: &LedgerKey) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.may_contain(key, &self.bloom_seed),
            None => true,
        }
    }
}
