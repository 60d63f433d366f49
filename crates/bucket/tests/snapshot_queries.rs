//! Integration tests for the snapshot read path: cross-level shadowing,
//! bulk loads with and without metering, and the domain queries.

use std::sync::Arc;

use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountId, AlphaNum4, Asset, AssetCode4, BucketMetadata,
    BucketMetadataExt, Hash, LedgerEntry, LedgerEntryData, LedgerEntryExt, LedgerKey,
    LedgerKeyAccount, LiquidityPoolConstantProductParameters,
    LiquidityPoolEntry, LiquidityPoolEntryBody, LiquidityPoolEntryConstantProduct, PoolId,
    PublicKey, SequenceNumber, String32, Thresholds, TrustLineAsset, TrustLineEntry,
    TrustLineEntryExt, Uint256,
};

use strata_bucket::entry::ledger_entry_key;
use strata_bucket::{
    Bucket, BucketEntry, BucketLevelSnapshot, BucketListSnapshot, BucketManager,
    BucketOutputIterator, BucketSnapshotManager, LedgerKeyMeter, LiveBucket, MergeCounters,
};

const PROTOCOL: u32 = 25;

fn account_id(byte: u8) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
}

fn account_key(byte: u8) -> LedgerKey {
    LedgerKey::Account(LedgerKeyAccount {
        account_id: account_id(byte),
    })
}

fn account_entry(byte: u8, balance: i64, inflation_dest: Option<u8>) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Account(AccountEntry {
            account_id: account_id(byte),
            balance,
            seq_num: SequenceNumber(1),
            num_sub_entries: 0,
            inflation_dest: inflation_dest.map(account_id),
            flags: 0,
            home_domain: String32::default(),
            thresholds: Thresholds([1, 0, 0, 0]),
            signers: vec![].try_into().unwrap(),
            ext: AccountEntryExt::V0,
        }),
        ext: LedgerEntryExt::V0,
    }
}

fn pool_id(byte: u8) -> PoolId {
    PoolId(Hash([byte; 32]))
}

fn credit_asset(code: &[u8; 4], issuer: u8) -> Asset {
    Asset::CreditAlphanum4(AlphaNum4 {
        asset_code: AssetCode4(*code),
        issuer: account_id(issuer),
    })
}

fn liquidity_pool_entry(pool: u8, asset_a: Asset, asset_b: Asset) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::LiquidityPool(LiquidityPoolEntry {
            liquidity_pool_id: pool_id(pool),
            body: LiquidityPoolEntryBody::LiquidityPoolConstantProduct(
                LiquidityPoolEntryConstantProduct {
                    params: LiquidityPoolConstantProductParameters {
                        asset_a,
                        asset_b,
                        fee: 30,
                    },
                    reserve_a: 1000,
                    reserve_b: 1000,
                    total_pool_shares: 100,
                    pool_shares_trust_line_count: 1,
                },
            ),
        }),
        ext: LedgerEntryExt::V0,
    }
}

fn pool_share_trustline(account: u8, pool: u8) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Trustline(TrustLineEntry {
            account_id: account_id(account),
            asset: TrustLineAsset::PoolShare(pool_id(pool)),
            balance: 500,
            limit: i64::MAX,
            flags: 1,
            ext: TrustLineEntryExt::V0,
        }),
        ext: LedgerEntryExt::V0,
    }
}

fn meta() -> BucketMetadata {
    BucketMetadata {
        ledger_version: PROTOCOL,
        ext: BucketMetadataExt::V0,
    }
}

/// Writes `entries` (already in identity order) through the output
/// iterator and registers the result with `manager`.
fn build_bucket(manager: &BucketManager, entries: Vec<BucketEntry>) -> Arc<Bucket> {
    let mut counters = MergeCounters::default();
    let mut out = BucketOutputIterator::<LiveBucket>::new(
        manager.bucket_dir(),
        true,
        meta(),
        &mut counters,
        false,
    )
    .unwrap();
    for entry in entries {
        out.put(entry).unwrap();
    }
    out.finalize(manager, true, None).unwrap()
}

fn empty() -> Arc<Bucket> {
    Arc::new(Bucket::empty())
}

/// Pads a list of `curr` buckets into levels with empty `snap` buckets.
fn levels_of(currs: Vec<Arc<Bucket>>) -> Vec<BucketLevelSnapshot> {
    currs
        .into_iter()
        .map(|curr| BucketLevelSnapshot::new(curr, empty()))
        .collect()
}

fn snapshot_manager(levels: Vec<BucketLevelSnapshot>, ledger_seq: u32) -> Arc<BucketSnapshotManager> {
    Arc::new(BucketSnapshotManager::new(BucketListSnapshot::new(
        levels, ledger_seq,
    )))
}

#[test]
fn tombstone_shadows_deeper_live_entry() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let top = build_bucket(&manager, vec![BucketEntry::Dead(account_key(7))]);
    let deep = build_bucket(
        &manager,
        vec![BucketEntry::Live(account_entry(7, 111, None))],
    );

    let snapshots = snapshot_manager(levels_of(vec![top, deep]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    assert_eq!(searchable.get_ledger_entry(&account_key(7)).unwrap(), None);
}

#[test]
fn lookup_falls_through_to_deeper_levels() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let top = build_bucket(&manager, vec![BucketEntry::Live(account_entry(3, 30, None))]);
    let deep = build_bucket(&manager, vec![BucketEntry::Live(account_entry(7, 70, None))]);

    let snapshots = snapshot_manager(levels_of(vec![top, deep]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let three = searchable.get_ledger_entry(&account_key(3)).unwrap().unwrap();
    assert!(matches!(three.data, LedgerEntryData::Account(ref a) if a.balance == 30));

    let seven = searchable.get_ledger_entry(&account_key(7)).unwrap().unwrap();
    assert!(matches!(seven.data, LedgerEntryData::Account(ref a) if a.balance == 70));

    assert_eq!(searchable.get_ledger_entry(&account_key(5)).unwrap(), None);
}

#[test]
fn newer_level_shadows_older_value() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let top = build_bucket(&manager, vec![BucketEntry::Live(account_entry(4, 999, None))]);
    let deep = build_bucket(&manager, vec![BucketEntry::Init(account_entry(4, 1, None))]);

    let snapshots = snapshot_manager(levels_of(vec![top, deep]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let entry = searchable.get_ledger_entry(&account_key(4)).unwrap().unwrap();
    assert!(matches!(entry.data, LedgerEntryData::Account(ref a) if a.balance == 999));
}

#[test]
fn curr_shadows_snap_within_a_level() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let curr = build_bucket(&manager, vec![BucketEntry::Live(account_entry(2, 20, None))]);
    let snap = build_bucket(&manager, vec![BucketEntry::Live(account_entry(2, 2, None))]);

    let snapshots = snapshot_manager(vec![BucketLevelSnapshot::new(curr, snap)], 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let entry = searchable.get_ledger_entry(&account_key(2)).unwrap().unwrap();
    assert!(matches!(entry.data, LedgerEntryData::Account(ref a) if a.balance == 20));
}

#[test]
fn bulk_load_matches_point_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let l0 = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(1, 10, None)),
            BucketEntry::Dead(account_key(2)),
        ],
    );
    let l1 = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(2, 200, None)),
            BucketEntry::Live(account_entry(3, 30, None)),
        ],
    );
    let l2 = build_bucket(&manager, vec![BucketEntry::Init(account_entry(4, 40, None))]);

    let snapshots = snapshot_manager(levels_of(vec![l0, l1, l2]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let keys: Vec<LedgerKey> = (1..=5).map(account_key).collect();

    let mut point_results: Vec<LedgerEntry> = Vec::new();
    for key in &keys {
        if let Some(entry) = searchable.get_ledger_entry(key).unwrap() {
            point_results.push(entry);
        }
    }

    let mut bulk = searchable.load_keys(&keys, None).unwrap();
    bulk.sort_by_key(|e| ledger_entry_key(e));
    point_results.sort_by_key(ledger_entry_key);
    assert_eq!(bulk, point_results);

    // Key 2 is tombstoned at level 0, so its deeper live entry is
    // shadowed and only keys 1, 3 and 4 resolve.
    assert_eq!(bulk.len(), 3);
}

#[test]
fn metered_bulk_load_drops_unaffordable_keys() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let bucket = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(1, 10, None)),
            BucketEntry::Live(account_entry(2, 20, None)),
            BucketEntry::Live(account_entry(3, 30, None)),
        ],
    );
    // Key 2 also lives at a deeper level; the metering rejection must
    // keep it from being loaded there either.
    let deep = build_bucket(&manager, vec![BucketEntry::Live(account_entry(2, 2, None))]);

    let snapshots = snapshot_manager(levels_of(vec![bucket, deep]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let mut meter = LedgerKeyMeter::new();
    // Quota smaller than the serialized key: rejected before the read.
    meter.add_transaction(10, [account_key(2)]);

    let keys: Vec<LedgerKey> = vec![account_key(1), account_key(2), account_key(3)];
    let entries = searchable.load_keys(&keys, Some(&mut meter)).unwrap();

    let balances: Vec<i64> = entries
        .iter()
        .map(|e| match &e.data {
            LedgerEntryData::Account(a) => a.balance,
            _ => panic!("expected account entries"),
        })
        .collect();
    assert_eq!(balances.len(), 2);
    assert!(balances.contains(&10));
    assert!(balances.contains(&30));

    // The rejecting transaction was charged down to zero.
    assert_eq!(meter.tx_read_quota(0), Some(0));
}

#[test]
fn post_read_metering_still_retires_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let bucket = build_bucket(&manager, vec![BucketEntry::Live(account_entry(1, 10, None))]);
    let deep = build_bucket(&manager, vec![BucketEntry::Live(account_entry(1, 1, None))]);

    let snapshots = snapshot_manager(levels_of(vec![bucket, deep]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    // Quota covers the key but not the decoded entry: the pre-read gate
    // passes, the post-read gate rejects, nothing is returned.
    let mut meter = LedgerKeyMeter::new();
    meter.add_transaction(60, [account_key(1)]);

    let entries = searchable
        .load_keys(&[account_key(1)], Some(&mut meter))
        .unwrap();
    assert!(entries.is_empty());
    assert_eq!(meter.tx_read_quota(0), Some(0));
}

#[test]
fn load_keys_returns_nothing_for_absent_keys() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());
    let bucket = build_bucket(&manager, vec![BucketEntry::Live(account_entry(1, 10, None))]);

    let snapshots = snapshot_manager(levels_of(vec![bucket]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let entries = searchable
        .load_keys(&[account_key(8), account_key(9)], None)
        .unwrap();
    assert!(entries.is_empty());
}

#[test]
fn pool_share_trustlines_by_account_and_asset() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let usdc = credit_asset(b"USDC", 0x40);
    let other = credit_asset(b"EURC", 0x41);

    // Pool 0x11 holds native/USDC and lives in one bucket; the account's
    // pool-share trustline lives in a deeper one, exercising the
    // no-shadowing union across levels.
    let pools = build_bucket(
        &manager,
        vec![BucketEntry::Live(liquidity_pool_entry(
            0x11,
            Asset::Native,
            usdc.clone(),
        ))],
    );
    let trustlines = build_bucket(
        &manager,
        vec![BucketEntry::Live(pool_share_trustline(0x01, 0x11))],
    );

    let snapshots = snapshot_manager(levels_of(vec![pools, trustlines]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let found = searchable
        .load_pool_share_trustlines_by_account_and_asset(&account_id(0x01), &usdc)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(matches!(
        &found[0].data,
        LedgerEntryData::Trustline(tl) if tl.asset == TrustLineAsset::PoolShare(pool_id(0x11))
    ));

    // An asset no pool contains yields nothing.
    let none = searchable
        .load_pool_share_trustlines_by_account_and_asset(&account_id(0x01), &other)
        .unwrap();
    assert!(none.is_empty());

    // A different account holds no share of the pool.
    let none = searchable
        .load_pool_share_trustlines_by_account_and_asset(&account_id(0x02), &usdc)
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn inflation_winners_respect_shadowing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    // Higher bucket: α votes for β with 2e9, γ is tombstoned, and a
    // trailing non-account entry ends the account scan.
    let alpha = 0x01;
    let gamma = 0x02;
    let beta = 0x10;
    let delta = 0x11;
    let epsilon = 0x12;

    let high = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(alpha, 2_000_000_000, Some(beta))),
            BucketEntry::Dead(account_key(gamma)),
            BucketEntry::Live(pool_share_trustline(0x20, 0x30)),
        ],
    );
    // Lower bucket: stale α and tombstoned γ, both shadowed.
    let low = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(alpha, 9_000_000_000, Some(delta))),
            BucketEntry::Live(account_entry(gamma, 3_000_000_000, Some(epsilon))),
        ],
    );

    let snapshots = snapshot_manager(levels_of(vec![high, low]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let winners = searchable
        .load_inflation_winners(10, 1_000_000_000)
        .unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].account_id, account_id(beta));
    assert_eq!(winners[0].votes, 2_000_000_000);
}

#[test]
fn inflation_winners_aggregate_and_filter() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let dest_a = 0x20;
    let dest_b = 0x21;

    let bucket = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(1, 3_000_000_000, Some(dest_a))),
            BucketEntry::Live(account_entry(2, 4_000_000_000, Some(dest_a))),
            BucketEntry::Live(account_entry(3, 2_000_000_000, Some(dest_b))),
            // Below the voting floor: contributes nothing.
            BucketEntry::Live(account_entry(4, 999_999_999, Some(dest_b))),
            // No destination: contributes nothing.
            BucketEntry::Live(account_entry(5, 8_000_000_000, None)),
        ],
    );

    let snapshots = snapshot_manager(levels_of(vec![bucket]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let winners = searchable.load_inflation_winners(10, 0).unwrap();
    assert_eq!(winners.len(), 2);
    let votes_for = |dest: u8| {
        winners
            .iter()
            .find(|w| w.account_id == account_id(dest))
            .map(|w| w.votes)
    };
    assert_eq!(votes_for(dest_a), Some(7_000_000_000));
    assert_eq!(votes_for(dest_b), Some(2_000_000_000));

    // min_balance filters destinations below the threshold.
    let winners = searchable
        .load_inflation_winners(10, 3_000_000_000)
        .unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].account_id, account_id(dest_a));

    // max_winners keeps only the largest destinations.
    let winners = searchable.load_inflation_winners(1, 0).unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].account_id, account_id(dest_a));
    assert_eq!(winners[0].votes, 7_000_000_000);
}

#[test]
fn queries_pick_up_newly_published_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let v1 = build_bucket(&manager, vec![BucketEntry::Live(account_entry(1, 10, None))]);
    let v2 = build_bucket(
        &manager,
        vec![
            BucketEntry::Live(account_entry(1, 20, None)),
            BucketEntry::Live(account_entry(2, 22, None)),
        ],
    );

    let snapshots = snapshot_manager(levels_of(vec![v1]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    let entry = searchable.get_ledger_entry(&account_key(1)).unwrap().unwrap();
    assert!(matches!(entry.data, LedgerEntryData::Account(ref a) if a.balance == 10));
    assert!(searchable.get_ledger_entry(&account_key(2)).unwrap().is_none());

    snapshots.update_current_snapshot(BucketListSnapshot::new(levels_of(vec![v2]), 2));

    let entry = searchable.get_ledger_entry(&account_key(1)).unwrap().unwrap();
    assert!(matches!(entry.data, LedgerEntryData::Account(ref a) if a.balance == 20));
    assert!(searchable.get_ledger_entry(&account_key(2)).unwrap().is_some());
    assert_eq!(searchable.ledger_seq(), 2);
}

#[test]
fn page_level_index_reads_within_pages() {
    use strata_bucket::IndexConfig;

    let dir = tempfile::tempdir().unwrap();
    let manager = BucketManager::new(dir.path());

    let entries: Vec<BucketEntry> = (1..=32)
        .map(|i| BucketEntry::Live(account_entry(i, i as i64 * 10, None)))
        .collect();
    let bucket = build_bucket(&manager, entries);

    // Rebuild the same file with a page-level index forced on.
    let path = bucket.file_path().unwrap();
    let paged = Arc::new(
        Bucket::from_file_with_config(
            path,
            IndexConfig {
                page_size: 256,
                cutoff: 0,
            },
        )
        .unwrap(),
    );
    assert!(paged.index().unwrap().page_size() > 0);

    let snapshots = snapshot_manager(levels_of(vec![paged]), 1);
    let mut searchable = snapshots.copy_searchable_snapshot();

    for i in 1..=32u8 {
        let entry = searchable.get_ledger_entry(&account_key(i)).unwrap().unwrap();
        assert!(
            matches!(entry.data, LedgerEntryData::Account(ref a) if a.balance == i as i64 * 10)
        );
    }
    assert!(searchable.get_ledger_entry(&account_key(200)).unwrap().is_none());

    // Bulk loads take the same page-aware path.
    let keys: Vec<LedgerKey> = (1..=32).map(account_key).collect();
    let loaded = searchable.load_keys(&keys, None).unwrap();
    assert_eq!(loaded.len(), 32);
}
