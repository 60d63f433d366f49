//! Binary fuse filter for fast negative index lookups.
//!
//! Point lookups first ask this filter whether a key could be in the
//! bucket at all; a `false` answer skips the index search and the disk
//! read entirely. The filter is a [`BinaryFuse16`], giving a false
//! positive rate of roughly 1/65536 at about 18 bits per key, with no
//! false negatives.
//!
//! Keys are hashed with SipHash-2-4 under a 16-byte seed so that the
//! filter's probe positions are not predictable from key material
//! alone. The seed used at construction must also be used for every
//! membership query.

use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use stellar_xdr::curr::{LedgerKey, Limits, WriteXdr};
use xorf::{BinaryFuse16, Filter};

use crate::{BucketError, Result};

/// Size of the SipHash key in bytes.
pub const HASH_KEY_BYTES: usize = 16;

/// Seed for the key hash underlying a filter.
pub type HashSeed = [u8; HASH_KEY_BYTES];

/// A binary fuse filter over the hashed keys of one bucket.
#[derive(Clone)]
pub struct BucketBloomFilter {
    filter: BinaryFuse16,
    seed: HashSeed,
}

impl BucketBloomFilter {
    /// Builds a filter from pre-computed key hashes.
    ///
    /// Construction needs at least two elements and distinct hashes; a
    /// bucket never holds the same key twice, so hashes are deduplicated
    /// up front before being handed to the underlying filter (which
    /// requires all-distinct input and panics rather than erroring on
    /// duplicates).
    pub fn from_hashes(key_hashes: &[u64], seed: &HashSeed) -> Result<Self> {
        if key_hashes.len() < 2 {
            return Err(BucketError::BloomFilter(
                "binary fuse filter requires at least 2 elements".to_string(),
            ));
        }

        let mut deduped = key_hashes.to_vec();
        deduped.sort_unstable();
        deduped.dedup();

        BinaryFuse16::try_from(deduped.as_slice())
            .map(|filter| Self {
                filter,
                seed: *seed,
            })
            .map_err(|e| {
                BucketError::BloomFilter(format!(
                    "failed to construct binary fuse filter: {e:?}"
                ))
            })
    }

    /// SipHash-2-4 of a ledger key under `seed`.
    pub fn hash_key(key: &LedgerKey, seed: &HashSeed) -> u64 {
        let key_bytes = key.to_xdr(Limits::none()).unwrap_or_default();
        Self::hash_bytes(&key_bytes, seed)
    }

    /// SipHash-2-4 of pre-serialized key bytes under `seed`.
    pub fn hash_bytes(bytes: &[u8], seed: &HashSeed) -> u64 {
        let mut hasher = SipHasher24::new_with_key(seed);
        hasher.write(bytes);
        hasher.finish()
    }

    /// Whether `key` might be in the set. `false` is definitive.
    pub fn may_contain(&self, key: &LedgerKey, seed: &HashSeed) -> bool {
        self.may_contain_hash(Self::hash_key(key, seed))
    }

    /// Membership test over a pre-computed hash.
    pub fn may_contain_hash(&self, hash: u64) -> bool {
        self.filter.contains(&hash)
    }

    /// The seed the filter was built with.
    pub fn seed(&self) -> &HashSeed {
        &self.seed
    }

    /// Approximate filter size: one u16 fingerprint per slot.
    pub fn size_bytes(&self) -> usize {
        self.filter.len() * std::mem::size_of::<u16>()
    }
}

impl std::fmt::Debug for BucketBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketBloomFilter")
            .field("fingerprints", &self.filter.len())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
