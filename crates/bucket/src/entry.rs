//! Bucket entry model.
//!
//! A bucket file is a sorted run of entries. The live cascade stores
//! [`BucketEntry`] records; the hot-archive cascade stores
//! [`HotArchiveEntry`] records. Both carry an optional leading metadata
//! record that, when present, must be the first record of the file.
//!
//! Entries are ordered by their *identity* — the [`LedgerKey`] they
//! concern. Metadata has no identity and sorts before everything else.
//!
//! The two cascades share the output-iterator machinery but differ in
//! tombstone semantics, metadata gating and payload validation. Those
//! differences are expressed through the [`BucketKind`] trait, with
//! [`LiveBucket`] and [`HotArchiveBucket`] as its two instances.

use std::cmp::Ordering;
use std::fmt;

use stellar_xdr::curr::{
    BucketMetadata, LedgerEntry, LedgerEntryData, LedgerEntryType, LedgerKey, LedgerKeyAccount,
    LedgerKeyClaimableBalance, LedgerKeyConfigSetting, LedgerKeyContractCode,
    LedgerKeyContractData, LedgerKeyData, LedgerKeyLiquidityPool, LedgerKeyOffer,
    LedgerKeyTrustLine, LedgerKeyTtl, Limits, WriteXdr,
};

use crate::{
    BucketError, Result, FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT,
    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION,
};
use strata_common::protocol::protocol_version_starts_from;

/// An entry in a live-cascade bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    /// A key/value record currently in state.
    Live(LedgerEntry),
    /// A live record with the promise that no older level holds the same
    /// key.
    Init(LedgerEntry),
    /// A tombstone masking the key at deeper levels.
    Dead(LedgerKey),
    /// The optional file header. Never compared against data entries.
    Metadata(BucketMetadata),
}

impl BucketEntry {
    /// The entry's identity, or `None` for metadata.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Live(e) | BucketEntry::Init(e) => Some(ledger_entry_key(e)),
            BucketEntry::Dead(k) => Some(k.clone()),
            BucketEntry::Metadata(_) => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, BucketEntry::Metadata(_))
    }

    /// The carried ledger entry, for `Live` and `Init` records.
    pub fn live_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(e) | BucketEntry::Init(e) => Some(e),
            _ => None,
        }
    }

    /// Converts from the wire representation.
    pub fn from_xdr_entry(entry: stellar_xdr::curr::BucketEntry) -> Self {
        use stellar_xdr::curr::BucketEntry as Xdr;
        match entry {
            Xdr::Liveentry(e) => BucketEntry::Live(e),
            Xdr::Initentry(e) => BucketEntry::Init(e),
            Xdr::Deadentry(k) => BucketEntry::Dead(k),
            Xdr::Metaentry(m) => BucketEntry::Metadata(m),
        }
    }

    /// Converts to the wire representation.
    pub fn to_xdr_entry(&self) -> stellar_xdr::curr::BucketEntry {
        use stellar_xdr::curr::BucketEntry as Xdr;
        match self {
            BucketEntry::Live(e) => Xdr::Liveentry(e.clone()),
            BucketEntry::Init(e) => Xdr::Initentry(e.clone()),
            BucketEntry::Dead(k) => Xdr::Deadentry(k.clone()),
            BucketEntry::Metadata(m) => Xdr::Metaentry(m.clone()),
        }
    }

    /// Serializes the wire representation to XDR bytes.
    pub fn to_xdr(&self) -> Result<Vec<u8>> {
        self.to_xdr_entry()
            .to_xdr(Limits::none())
            .map_err(|e| BucketError::Serialization(e.to_string()))
    }
}

/// An entry in a hot-archive bucket.
///
/// Archive buckets only ever hold Soroban state: `Archived` payloads and
/// `Live` keys must both be contract data or contract code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotArchiveEntry {
    /// The key is live again in the main cascade; masks `Archived`
    /// records at deeper archive levels.
    Live(LedgerKey),
    /// An archived ledger entry.
    Archived(LedgerEntry),
    /// The optional file header.
    Metadata(BucketMetadata),
}

impl HotArchiveEntry {
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            HotArchiveEntry::Live(k) => Some(k.clone()),
            HotArchiveEntry::Archived(e) => Some(ledger_entry_key(e)),
            HotArchiveEntry::Metadata(_) => None,
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, HotArchiveEntry::Metadata(_))
    }

    pub fn from_xdr_entry(entry: stellar_xdr::curr::HotArchiveBucketEntry) -> Self {
        use stellar_xdr::curr::HotArchiveBucketEntry as Xdr;
        match entry {
            Xdr::Live(k) => HotArchiveEntry::Live(k),
            Xdr::Archived(e) => HotArchiveEntry::Archived(e),
            Xdr::Metaentry(m) => HotArchiveEntry::Metadata(m),
        }
    }

    pub fn to_xdr_entry(&self) -> stellar_xdr::curr::HotArchiveBucketEntry {
        use stellar_xdr::curr::HotArchiveBucketEntry as Xdr;
        match self {
            HotArchiveEntry::Live(k) => Xdr::Live(k.clone()),
            HotArchiveEntry::Archived(e) => Xdr::Archived(e.clone()),
            HotArchiveEntry::Metadata(m) => Xdr::Metaentry(m.clone()),
        }
    }

    pub fn to_xdr(&self) -> Result<Vec<u8>> {
        self.to_xdr_entry()
            .to_xdr(Limits::none())
            .map_err(|e| BucketError::Serialization(e.to_string()))
    }
}

/// Derives the ledger key identifying an entry.
pub fn ledger_entry_key(entry: &LedgerEntry) -> LedgerKey {
    match &entry.data {
        LedgerEntryData::Account(e) => LedgerKey::Account(LedgerKeyAccount {
            account_id: e.account_id.clone(),
        }),
        LedgerEntryData::Trustline(e) => LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: e.account_id.clone(),
            asset: e.asset.clone(),
        }),
        LedgerEntryData::Offer(e) => LedgerKey::Offer(LedgerKeyOffer {
            seller_id: e.seller_id.clone(),
            offer_id: e.offer_id,
        }),
        LedgerEntryData::Data(e) => LedgerKey::Data(LedgerKeyData {
            account_id: e.account_id.clone(),
            data_name: e.data_name.clone(),
        }),
        LedgerEntryData::ClaimableBalance(e) => {
            LedgerKey::ClaimableBalance(LedgerKeyClaimableBalance {
                balance_id: e.balance_id.clone(),
            })
        }
        LedgerEntryData::LiquidityPool(e) => LedgerKey::LiquidityPool(LedgerKeyLiquidityPool {
            liquidity_pool_id: e.liquidity_pool_id.clone(),
        }),
        LedgerEntryData::ContractData(e) => LedgerKey::ContractData(LedgerKeyContractData {
            contract: e.contract.clone(),
            key: e.key.clone(),
            durability: e.durability,
        }),
        LedgerEntryData::ContractCode(e) => LedgerKey::ContractCode(LedgerKeyContractCode {
            hash: e.hash.clone(),
        }),
        LedgerEntryData::ConfigSetting(e) => LedgerKey::ConfigSetting(LedgerKeyConfigSetting {
            config_setting_id: e.discriminant(),
        }),
        LedgerEntryData::Ttl(e) => LedgerKey::Ttl(LedgerKeyTtl {
            key_hash: e.key_hash.clone(),
        }),
    }
}

/// The entry type a ledger key refers to.
pub fn ledger_key_type(key: &LedgerKey) -> LedgerEntryType {
    match key {
        LedgerKey::Account(_) => LedgerEntryType::Account,
        LedgerKey::Trustline(_) => LedgerEntryType::Trustline,
        LedgerKey::Offer(_) => LedgerEntryType::Offer,
        LedgerKey::Data(_) => LedgerEntryType::Data,
        LedgerKey::ClaimableBalance(_) => LedgerEntryType::ClaimableBalance,
        LedgerKey::LiquidityPool(_) => LedgerEntryType::LiquidityPool,
        LedgerKey::ContractData(_) => LedgerEntryType::ContractData,
        LedgerKey::ContractCode(_) => LedgerEntryType::ContractCode,
        LedgerKey::ConfigSetting(_) => LedgerEntryType::ConfigSetting,
        LedgerKey::Ttl(_) => LedgerEntryType::Ttl,
    }
}

/// Returns `true` for Soroban state payloads (contract data and code).
pub fn is_soroban_entry(data: &LedgerEntryData) -> bool {
    matches!(
        data,
        LedgerEntryData::ContractData(_) | LedgerEntryData::ContractCode(_)
    )
}

/// Returns `true` for keys referring to Soroban state.
pub fn is_soroban_key(key: &LedgerKey) -> bool {
    matches!(
        key,
        LedgerKey::ContractData(_) | LedgerKey::ContractCode(_)
    )
}

/// Rejects live entries that are not legal at the given protocol version.
///
/// `Init` and `Metadata` records require protocol 11.
pub fn check_protocol_legality(entry: &BucketEntry, ledger_version: u32) -> Result<()> {
    if !protocol_version_starts_from(ledger_version, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY)
        && matches!(entry, BucketEntry::Init(_) | BucketEntry::Metadata(_))
    {
        return Err(BucketError::Protocol(format!(
            "init or metadata entry is not legal before protocol {}, bucket is at protocol {}",
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY.as_u32(),
            ledger_version
        )));
    }
    Ok(())
}

/// Capability trait distinguishing the two cascade flavors.
///
/// The output iterator is instantiated once per kind; everything that
/// differs between live and archive buckets funnels through here.
pub trait BucketKind {
    /// The entry type stored in this kind of bucket.
    type Entry: Clone + fmt::Debug;

    /// Entries that only exist to mask a key at deeper levels, and are
    /// therefore dropped at the bottom level.
    fn is_tombstone(entry: &Self::Entry) -> bool;

    fn is_metadata(entry: &Self::Entry) -> bool;

    /// Wraps bucket metadata in this kind's entry type.
    fn make_meta_entry(meta: BucketMetadata) -> Self::Entry;

    /// Validates a single entry against the bucket's protocol version.
    fn check_legality(entry: &Self::Entry, ledger_version: u32) -> Result<()>;

    /// Validates the bucket metadata itself before any entry is written.
    fn check_meta_legality(meta: &BucketMetadata) -> Result<()>;

    fn entry_key(entry: &Self::Entry) -> Option<LedgerKey>;

    /// Identity order. Metadata sorts before every data entry; two
    /// metadata records compare equal.
    fn compare(a: &Self::Entry, b: &Self::Entry) -> Ordering {
        Self::entry_key(a).cmp(&Self::entry_key(b))
    }

    /// Rewrites a bottom-level entry if this kind calls for it, returning
    /// the entry to buffer and whether a rewrite happened.
    fn maybe_rewrite_live_to_init(entry: Self::Entry, _ledger_version: u32) -> (Self::Entry, bool) {
        (entry, false)
    }

    /// XDR payload bytes for one record (without the record mark).
    fn serialize(entry: &Self::Entry) -> Result<Vec<u8>>;
}

/// Live-cascade bucket kind.
#[derive(Debug, Clone, Copy)]
pub struct LiveBucket;

impl BucketKind for LiveBucket {
    type Entry = BucketEntry;

    fn is_tombstone(entry: &BucketEntry) -> bool {
        entry.is_dead()
    }

    fn is_metadata(entry: &BucketEntry) -> bool {
        entry.is_metadata()
    }

    fn make_meta_entry(meta: BucketMetadata) -> BucketEntry {
        BucketEntry::Metadata(meta)
    }

    fn check_legality(entry: &BucketEntry, ledger_version: u32) -> Result<()> {
        check_protocol_legality(entry, ledger_version)
    }

    fn check_meta_legality(_meta: &BucketMetadata) -> Result<()> {
        Ok(())
    }

    fn entry_key(entry: &BucketEntry) -> Option<LedgerKey> {
        entry.key()
    }

    fn maybe_rewrite_live_to_init(entry: BucketEntry, ledger_version: u32) -> (BucketEntry, bool) {
        // Each level holds one entry per key, so at the bottom level a
        // live entry can have no older shadow and is really an init entry.
        if protocol_version_starts_from(ledger_version, FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT)
        {
            if let BucketEntry::Live(e) = entry {
                return (BucketEntry::Init(e), true);
            }
        }
        (entry, false)
    }

    fn serialize(entry: &BucketEntry) -> Result<Vec<u8>> {
        entry.to_xdr()
    }
}

/// Hot-archive bucket kind.
#[derive(Debug, Clone, Copy)]
pub struct HotArchiveBucket;

impl BucketKind for HotArchiveBucket {
    type Entry = HotArchiveEntry;

    fn is_tombstone(entry: &HotArchiveEntry) -> bool {
        // A key that went live again masks archived versions below, the
        // same role DEADENTRY plays in the live cascade.
        matches!(entry, HotArchiveEntry::Live(_))
    }

    fn is_metadata(entry: &HotArchiveEntry) -> bool {
        entry.is_metadata()
    }

    fn make_meta_entry(meta: BucketMetadata) -> HotArchiveEntry {
        HotArchiveEntry::Metadata(meta)
    }

    fn check_legality(entry: &HotArchiveEntry, _ledger_version: u32) -> Result<()> {
        match entry {
            HotArchiveEntry::Archived(e) if !is_soroban_entry(&e.data) => Err(
                BucketError::InvalidEntry("non-Soroban entry in hot archive bucket".to_string()),
            ),
            HotArchiveEntry::Live(k) if !is_soroban_key(k) => Err(BucketError::InvalidEntry(
                "non-Soroban key in hot archive bucket".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_meta_legality(meta: &BucketMetadata) -> Result<()> {
        if !protocol_version_starts_from(
            meta.ledger_version,
            FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION,
        ) {
            return Err(BucketError::Protocol(format!(
                "hot archive buckets require protocol {}, metadata is at protocol {}",
                FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION.as_u32(),
                meta.ledger_version
            )));
        }
        Ok(())
    }

    fn entry_key(entry: &HotArchiveEntry) -> Option<LedgerKey> {
        entry.key()
    }

    fn serialize(entry: &HotArchiveEntry) -> Result<Vec<u8>> {
        entry.to_xdr()
    }
}
