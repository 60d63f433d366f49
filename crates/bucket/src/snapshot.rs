//! Immutable snapshots of the bucket cascade.
//!
//! Readers never touch the live cascade directly. The main thread
//! publishes a [`BucketListSnapshot`] to the [`BucketSnapshotManager`]
//! after every ledger close; worker threads each hold their own
//! [`SearchableBucketListSnapshot`], which re-syncs with the manager at
//! the top of every query and then runs entirely against the captured
//! state.
//!
//! # Shadowing
//!
//! A snapshot's levels are searched top-down, `curr` before `snap`. The
//! first bucket containing a key decides its fate: a live or init entry
//! is the value, a tombstone means the key is absent, and deeper levels
//! are never consulted.
//!
//! # Streams
//!
//! Each [`BucketSnapshot`] owns a lazily opened input stream over its
//! bucket file. Cloning a snapshot yields a fresh, unopened stream, so
//! equivalent snapshots on different threads never share a file handle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::RwLock;
use stellar_xdr::curr::{
    AccountId, Asset, LedgerEntry, LedgerEntryData, LedgerEntryType, LedgerKey,
    LedgerKeyTrustLine, Limits, PoolId, TrustLineAsset, WriteXdr,
};

use strata_common::XdrInputStream;

use crate::bucket::Bucket;
use crate::entry::{ledger_key_type, BucketEntry};
use crate::index::BucketIndex;
use crate::meter::LedgerKeyMeter;
use crate::Result;

/// Accounts below this balance cast no inflation vote.
const MIN_INFLATION_VOTE_BALANCE: i64 = 1_000_000_000;

fn xdr_size<T: WriteXdr>(value: &T) -> usize {
    value.to_xdr(Limits::none()).map(|b| b.len()).unwrap_or(0)
}

/// A read handle over one immutable bucket.
///
/// The handle shares the bucket itself but owns its input stream; the
/// stream opens on first read and dies with this snapshot value.
pub struct BucketSnapshot {
    bucket: Arc<Bucket>,
    stream: Option<XdrInputStream>,
}

impl Clone for BucketSnapshot {
    fn clone(&self) -> Self {
        // The copy must open its own stream: concurrent readers may hold
        // equivalent snapshots of the same bucket.
        Self {
            bucket: Arc::clone(&self.bucket),
            stream: None,
        }
    }
}

impl BucketSnapshot {
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            bucket,
            stream: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    /// The underlying bucket.
    pub fn raw_bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Resolves `key` in this bucket.
    ///
    /// A tombstone is returned as `Some(BucketEntry::Dead(..))`: callers
    /// decide what shadowing means at their level.
    pub fn get(&mut self, key: &LedgerKey) -> Result<Option<BucketEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let bucket = Arc::clone(&self.bucket);
        let index = bucket.index()?;
        let Some(offset) = index.lookup(key) else {
            return Ok(None);
        };
        self.get_entry_at_offset(index, key, offset, index.page_size())
    }

    /// Reads the entry for `key` at `offset`.
    ///
    /// With a zero page size the offset is exact and one record is
    /// decoded. Otherwise the page starting at `offset` is scanned until
    /// the key is found, a larger key proves it absent, or the page
    /// ends. An offset that fails to produce the key is a bloom-filter
    /// false positive and is reported to the index.
    fn get_entry_at_offset(
        &mut self,
        index: &BucketIndex,
        key: &LedgerKey,
        offset: u64,
        page_size: u64,
    ) -> Result<Option<BucketEntry>> {
        let stream = self.stream()?;
        stream.seek(offset)?;

        if page_size == 0 {
            if let Some(raw) = stream.read_one::<stellar_xdr::curr::BucketEntry>()? {
                return Ok(Some(BucketEntry::from_xdr_entry(raw)));
            }
        } else {
            let page_end = offset + page_size;
            while stream.position() < page_end {
                let Some(raw) = stream.read_one::<stellar_xdr::curr::BucketEntry>()? else {
                    break;
                };
                let entry = BucketEntry::from_xdr_entry(raw);
                match entry.key() {
                    Some(k) if &k == key => return Ok(Some(entry)),
                    // Entries are sorted: a larger key ends the search.
                    Some(k) if k > *key => break,
                    _ => {}
                }
            }
        }

        index.mark_bloom_miss();
        Ok(None)
    }

    /// Sweeps a sorted key set against this bucket in one linear pass.
    ///
    /// Keys resolved here — found live, found dead, or rejected by the
    /// meter — are removed from `keys` so deeper levels skip them; keys
    /// this bucket knows nothing about stay in the set.
    pub fn load_keys(
        &mut self,
        keys: &mut BTreeSet<LedgerKey>,
        result: &mut Vec<LedgerEntry>,
        mut meter: Option<&mut LedgerKeyMeter>,
    ) -> Result<()> {
        if self.is_empty() || keys.is_empty() {
            return Ok(());
        }
        let bucket = Arc::clone(&self.bucket);
        let index = bucket.index()?;
        let page_size = index.page_size();
        let mut cursor = index.begin();

        let pending: Vec<LedgerKey> = keys.iter().cloned().collect();
        for key in pending {
            if index.at_end(cursor) {
                break;
            }

            if let Some(m) = meter.as_deref_mut() {
                let key_size = xdr_size(&key);
                if !m.can_load(&key, key_size) {
                    // An entry is never smaller than its key, so these
                    // transactions cannot load it at any level. Zero
                    // their quotas and retire the key.
                    m.update_read_quotas(&key, key_size);
                    keys.remove(&key);
                    continue;
                }
            }

            let (offset, next) = index.scan(cursor, &key);
            cursor = next;
            let Some(offset) = offset else {
                continue;
            };
            let Some(entry) = self.get_entry_at_offset(index, &key, offset, page_size)? else {
                continue;
            };

            match entry {
                BucketEntry::Dead(_) => {
                    keys.remove(&key);
                }
                BucketEntry::Live(e) | BucketEntry::Init(e) => {
                    let mut add_entry = true;
                    if let Some(m) = meter.as_deref_mut() {
                        // Metered after the read: the entry's size is not
                        // known until it has been decoded.
                        let entry_size = xdr_size(&e);
                        add_entry = m.can_load(&key, entry_size);
                        m.update_read_quotas(&key, entry_size);
                    }
                    if add_entry {
                        result.push(e);
                    }
                    keys.remove(&key);
                }
                BucketEntry::Metadata(_) => {}
            }
        }
        Ok(())
    }

    /// Liquidity pools in this bucket containing `asset`.
    pub fn pool_ids_by_asset(&self, asset: &Asset) -> Result<&[PoolId]> {
        if self.is_empty() {
            return Ok(&[]);
        }
        Ok(self.bucket.index()?.pool_ids_by_asset(asset))
    }

    fn stream(&mut self) -> Result<&mut XdrInputStream> {
        if self.stream.is_none() {
            let path = self
                .bucket
                .file_path()
                .expect("non-empty bucket has a backing file");
            self.stream = Some(XdrInputStream::open(path)?);
        }
        Ok(self.stream.as_mut().expect("stream was just opened"))
    }
}

impl std::fmt::Debug for BucketSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketSnapshot")
            .field("bucket", &self.bucket)
            .field("stream_open", &self.stream.is_some())
            .finish()
    }
}

/// One level of the cascade: the filling bucket and the spilled one.
#[derive(Debug, Clone)]
pub struct BucketLevelSnapshot {
    pub curr: BucketSnapshot,
    pub snap: BucketSnapshot,
}

impl BucketLevelSnapshot {
    pub fn new(curr: Arc<Bucket>, snap: Arc<Bucket>) -> Self {
        Self {
            curr: BucketSnapshot::new(curr),
            snap: BucketSnapshot::new(snap),
        }
    }
}

/// A point-in-time view of the whole cascade, tagged with the ledger
/// sequence it was captured at.
#[derive(Debug, Clone)]
pub struct BucketListSnapshot {
    levels: Vec<BucketLevelSnapshot>,
    ledger_seq: u32,
}

impl BucketListSnapshot {
    pub fn new(levels: Vec<BucketLevelSnapshot>, ledger_seq: u32) -> Self {
        Self { levels, ledger_seq }
    }

    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    pub fn levels(&self) -> &[BucketLevelSnapshot] {
        &self.levels
    }

    /// Visits every non-empty bucket in shadowing order — `curr` then
    /// `snap` within each level, levels top-down. The visitor returns
    /// `true` to stop the traversal.
    pub fn for_each_bucket<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&mut BucketSnapshot) -> Result<bool>,
    {
        for level in &mut self.levels {
            for bucket in [&mut level.curr, &mut level.snap] {
                if bucket.is_empty() {
                    continue;
                }
                if visit(bucket)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// An account that received inflation votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflationWinner {
    pub account_id: AccountId,
    /// Sum of the balances voting for this destination.
    pub votes: i64,
}

/// Read-side facade over the snapshot a thread currently holds.
///
/// Not shared between threads: every worker gets its own via
/// [`BucketSnapshotManager::copy_searchable_snapshot`]. Each public
/// query first asks the manager for a newer snapshot, then runs wholly
/// against the snapshot captured at entry.
pub struct SearchableBucketListSnapshot {
    manager: Arc<BucketSnapshotManager>,
    snapshot: BucketListSnapshot,
}

impl SearchableBucketListSnapshot {
    /// Ledger sequence of the currently held snapshot.
    pub fn ledger_seq(&self) -> u32 {
        self.snapshot.ledger_seq()
    }

    fn refresh(&mut self) {
        self.manager.maybe_update_snapshot(&mut self.snapshot);
    }

    /// Resolves one key through the cascade.
    ///
    /// The first bucket containing the key answers: a tombstone means
    /// `None`, a live or init entry is returned as-is.
    pub fn get_ledger_entry(&mut self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.refresh();
        let _timer = self
            .manager
            .is_main_thread()
            .then(|| self.manager.point_load_timer(ledger_key_type(key)));

        let mut found: Option<LedgerEntry> = None;
        self.snapshot.for_each_bucket(|bucket| {
            let Some(entry) = bucket.get(key)? else {
                return Ok(false);
            };
            match entry {
                BucketEntry::Live(e) | BucketEntry::Init(e) => {
                    found = Some(e);
                    Ok(true)
                }
                BucketEntry::Dead(_) => Ok(true),
                BucketEntry::Metadata(_) => Ok(false),
            }
        })?;
        Ok(found)
    }

    /// Bulk point lookup over an arbitrary key set.
    ///
    /// Keys are resolved level by level; a key satisfied at one level is
    /// never searched below it. With a meter, each key is charged
    /// against its transactions' read quotas and dropped when they
    /// cannot afford it. Result order is unspecified.
    pub fn load_keys(
        &mut self,
        keys: &[LedgerKey],
        meter: Option<&mut LedgerKeyMeter>,
    ) -> Result<Vec<LedgerEntry>> {
        self.refresh();
        let _timer = self.manager.is_main_thread().then(|| {
            let label = if meter.is_some() {
                "prefetch-soroban"
            } else {
                "prefetch-classic"
            };
            self.manager.bulk_load_timer(label, keys.len())
        });
        self.load_keys_internal(keys.iter().cloned().collect(), meter)
    }

    fn load_keys_internal(
        &mut self,
        mut keys: BTreeSet<LedgerKey>,
        mut meter: Option<&mut LedgerKeyMeter>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        self.snapshot.for_each_bucket(|bucket| {
            bucket.load_keys(&mut keys, &mut entries, meter.as_deref_mut())?;
            Ok(keys.is_empty())
        })?;
        Ok(entries)
    }

    /// Loads the pool-share trustlines `account_id` holds in any
    /// liquidity pool containing `asset`.
    ///
    /// Pool ids are unioned across all buckets — the reverse index has
    /// no shadowing — and the derived trustline keys are then resolved
    /// like any bulk load. Main-thread only.
    pub fn load_pool_share_trustlines_by_account_and_asset(
        &mut self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<Vec<LedgerEntry>> {
        self.manager
            .assert_main_thread("load_pool_share_trustlines_by_account_and_asset");
        self.refresh();

        let mut pool_ids: BTreeSet<PoolId> = BTreeSet::new();
        self.snapshot.for_each_bucket(|bucket| {
            pool_ids.extend(bucket.pool_ids_by_asset(asset)?.iter().cloned());
            Ok(false)
        })?;

        let keys: BTreeSet<LedgerKey> = pool_ids
            .into_iter()
            .map(|pool_id| {
                LedgerKey::Trustline(LedgerKeyTrustLine {
                    account_id: account_id.clone(),
                    asset: TrustLineAsset::PoolShare(pool_id),
                })
            })
            .collect();

        let _timer = self.manager.bulk_load_timer("poolshare-trustlines", keys.len());
        self.load_keys_internal(keys, None)
    }

    /// Tallies inflation votes across the cascade.
    ///
    /// Streams each bucket in file order, stopping at the first
    /// non-account entry since accounts sort first. Accounts seen at a
    /// higher level — live or tombstoned — shadow deeper occurrences.
    /// Main-thread only; this is a legacy query used during catchup.
    pub fn load_inflation_winners(
        &mut self,
        max_winners: usize,
        min_balance: i64,
    ) -> Result<Vec<InflationWinner>> {
        self.manager.assert_main_thread("load_inflation_winners");
        self.refresh();
        let _timer = self.manager.bulk_load_timer("inflation-winners", 0);

        let mut vote_counts: HashMap<AccountId, i64> = HashMap::new();
        let mut seen: HashSet<AccountId> = HashSet::new();

        self.snapshot.for_each_bucket(|bucket| {
            for entry in bucket.raw_bucket().iter()? {
                match entry? {
                    BucketEntry::Dead(LedgerKey::Account(k)) => {
                        seen.insert(k.account_id);
                    }
                    BucketEntry::Dead(_) | BucketEntry::Metadata(_) => {}
                    BucketEntry::Live(e) | BucketEntry::Init(e) => {
                        let LedgerEntryData::Account(account) = &e.data else {
                            // Accounts sort first: nothing further in
                            // this bucket can be an account.
                            break;
                        };
                        if !seen.insert(account.account_id.clone()) {
                            continue;
                        }
                        if let Some(dest) = &account.inflation_dest {
                            if account.balance >= MIN_INFLATION_VOTE_BALANCE {
                                *vote_counts.entry(dest.clone()).or_insert(0) += account.balance;
                            }
                        }
                    }
                }
            }
            Ok(false)
        })?;

        let mut winners = Vec::new();
        if vote_counts.len() > max_winners {
            // Destinations with equal counts overwrite one another, so
            // ordering under ties is unspecified.
            let mut by_count: BTreeMap<i64, AccountId> = BTreeMap::new();
            for (id, votes) in &vote_counts {
                by_count.insert(*votes, id.clone());
            }
            for (votes, account_id) in by_count.into_iter().rev() {
                if winners.len() >= max_winners || votes < min_balance {
                    break;
                }
                winners.push(InflationWinner { account_id, votes });
            }
        } else {
            for (account_id, votes) in vote_counts {
                if votes >= min_balance {
                    winners.push(InflationWinner { account_id, votes });
                }
            }
        }
        Ok(winners)
    }
}

/// Publishes snapshots from the main thread to reader threads.
///
/// Readers call [`copy_searchable_snapshot`] once and then let their
/// searchable snapshot re-sync itself; the write lock is only ever held
/// for the duration of a pointer swap.
///
/// [`copy_searchable_snapshot`]: Self::copy_searchable_snapshot
pub struct BucketSnapshotManager {
    current: RwLock<BucketListSnapshot>,
    main_thread: ThreadId,
}

impl BucketSnapshotManager {
    /// Creates the manager with its initial snapshot. The calling thread
    /// becomes the main thread for assertion purposes.
    pub fn new(initial: BucketListSnapshot) -> Self {
        Self {
            current: RwLock::new(initial),
            main_thread: thread::current().id(),
        }
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Panics when called off the main thread. Wrong-thread use of the
    /// queries gated on this is a bug, not a recoverable condition.
    pub fn assert_main_thread(&self, what: &str) {
        assert!(
            self.is_main_thread(),
            "{what} must be called from the main thread"
        );
    }

    /// Ledger sequence of the published snapshot.
    pub fn current_ledger_seq(&self) -> u32 {
        self.current.read().ledger_seq()
    }

    /// Publishes a newer snapshot. Main-thread only.
    pub fn update_current_snapshot(&self, snapshot: BucketListSnapshot) {
        self.assert_main_thread("update_current_snapshot");
        let mut current = self.current.write();
        debug_assert!(
            snapshot.ledger_seq() >= current.ledger_seq(),
            "snapshots must be published in ledger order"
        );
        *current = snapshot;
    }

    /// Replaces `held` with the published snapshot when a newer one is
    /// available. Safe from any thread. Returns whether a swap happened.
    pub fn maybe_update_snapshot(&self, held: &mut BucketListSnapshot) -> bool {
        let current = self.current.read();
        if current.ledger_seq() > held.ledger_seq() {
            *held = current.clone();
            true
        } else {
            false
        }
    }

    /// Hands out a fresh searchable snapshot for the calling thread.
    pub fn copy_searchable_snapshot(self: &Arc<Self>) -> SearchableBucketListSnapshot {
        SearchableBucketListSnapshot {
            manager: Arc::clone(self),
            snapshot: self.current.read().clone(),
        }
    }

    /// Timer guard for a single point load; traced on drop.
    pub fn point_load_timer(&self, key_type: LedgerEntryType) -> QueryTimer {
        QueryTimer {
            label: "point-load",
            key_type: Some(key_type),
            count: 1,
            start: Instant::now(),
        }
    }

    /// Timer guard for a bulk query; traced on drop.
    pub fn bulk_load_timer(&self, label: &'static str, count: usize) -> QueryTimer {
        QueryTimer {
            label,
            key_type: None,
            count,
            start: Instant::now(),
        }
    }
}

/// Drop guard that records how long a query took.
pub struct QueryTimer {
    label: &'static str,
    key_type: Option<LedgerEntryType>,
    count: usize,
    start: Instant,
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        tracing::trace!(
            label = self.label,
            key_type = ?self.key_type,
            count = self.count,
            elapsed_us = self.start.elapsed().as_micros() as u64,
            "bucket query finished"
        );
    }
}
