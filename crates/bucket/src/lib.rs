//! Snapshot read path and bucket materialization for the strata ledger store.
//!
//! Ledger state lives in a cascade of levels, each holding two immutable
//! sorted files ("buckets"). New state enters the top level and is merged
//! downward as levels fill. This crate covers the two ends of that
//! pipeline:
//!
//! - **Reading**: immutable [`BucketListSnapshot`]s over the cascade,
//!   queried through a per-thread [`SearchableBucketListSnapshot`] that
//!   resolves keys top-down with tombstone shadowing.
//! - **Writing**: the [`BucketOutputIterator`] merge sink, which turns a
//!   sorted entry stream into a single hashed bucket file, eliding
//!   tombstones and rewriting live entries to init entries at the bottom
//!   level.
//!
//! The merge scheduler that feeds the output iterator and the process
//! lifecycle around the [`BucketSnapshotManager`] live elsewhere; this
//! crate only defines the data structures and algorithms between them.

pub mod bloom_filter;
pub mod bucket;
pub mod entry;
pub mod index;
pub mod manager;
pub mod meter;
pub mod output;
pub mod snapshot;

use strata_common::protocol::ProtocolVersion;
use thiserror::Error;

/// First protocol version in which buckets may contain `Init` entries and
/// a leading metadata record.
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: ProtocolVersion = ProtocolVersion::V11;

/// First protocol version in which merges stop consulting shadow buckets.
/// Exported for the merge scheduler driving the output iterator; nothing
/// below that scheduler branches on it.
pub const FIRST_PROTOCOL_SHADOWS_REMOVED: ProtocolVersion = ProtocolVersion::V12;

/// First protocol version supporting persistent eviction and therefore
/// hot-archive buckets. Archive bucket metadata below this version is
/// rejected outright.
pub const FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION: ProtocolVersion = ProtocolVersion::V23;

/// First protocol version in which bottom-level merges rewrite `Live`
/// entries to `Init` entries.
pub const FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT: ProtocolVersion =
    ProtocolVersion::V23;

/// Errors produced by bucket reads and writes.
///
/// Out-of-order input to the output iterator and wrong-thread access to
/// main-thread-only queries are programmer errors and panic instead of
/// returning a variant here.
#[derive(Error, Debug)]
pub enum BucketError {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// XDR encoding or decoding failed.
    #[error("XDR serialization error: {0}")]
    Serialization(String),

    /// An entry is not legal at the bucket's protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An entry violates the shape the target bucket requires.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// Binary fuse filter construction failed.
    #[error("bloom filter error: {0}")]
    BloomFilter(String),
}

pub type Result<T> = std::result::Result<T, BucketError>;

pub use bloom_filter::{BucketBloomFilter, HashSeed};
pub use bucket::Bucket;
pub use entry::{BucketEntry, BucketKind, HotArchiveBucket, HotArchiveEntry, LiveBucket};
pub use index::{BucketIndex, IndexConfig, ScanCursor};
pub use manager::{BucketManager, MergeKey};
pub use meter::LedgerKeyMeter;
pub use output::{BucketOutputIterator, MergeCounters};
pub use snapshot::{
    BucketLevelSnapshot, BucketListSnapshot, BucketSnapshot, BucketSnapshotManager,
    InflationWinner, SearchableBucketListSnapshot,
};
