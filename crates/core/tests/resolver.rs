use std::path::Path;

use covdiff_core::db::{CovDb, MasterDb};
use covdiff_core::model::BinaryId;
use covdiff_core::pipeline::BlockResolver;
use rusqlite::params;
use tempfile::tempdir;

const BIN: BinaryId = BinaryId(1);

fn fixture_master(path: &Path) -> MasterDb {
    let master = MasterDb::initialize(path).expect("init master");
    master
        .connection()
        .execute(
            "INSERT INTO analyzed_binaries (binary_id, binary_name, sha256_hash) \
             VALUES (1, 'target.exe', 'aaaa')",
            [],
        )
        .expect("insert binary");
    master
        .connection()
        .execute(
            "INSERT INTO functions (binary_id, func_id, func_name, entry_rva, start_va, end_va, func_size) \
             VALUES (1, 7, 'main', 4096, 4096, 4160, 64)",
            [],
        )
        .expect("insert function");
    // Block [0x1000, 0x1020) followed by block [0x1020, 0x1040).
    for (rva, start, end) in [(0x1000, 0x1000, 0x1020), (0x1020, 0x1020, 0x1040)] {
        master
            .connection()
            .execute(
                "INSERT INTO basic_blocks (binary_id, func_id, bb_rva, bb_start_va, bb_end_va) \
                 VALUES (1, 7, ?1, ?2, ?3)",
                params![rva, start, end],
            )
            .expect("insert block");
    }
    master
}

#[test]
fn exact_block_start_resolves_to_itself() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let mut resolver = BlockResolver::new();

    let block = resolver
        .resolve(&master, &cov, BIN, 0x1000)
        .expect("resolve")
        .expect("block start must resolve");
    assert_eq!(block.bb_rva, 0x1000);
    assert_eq!(block.func_id, 7);
    assert!(!block.was_mid_block(0x1000));
}

#[test]
fn mid_block_return_address_maps_to_containing_block() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let mut resolver = BlockResolver::new();

    // A typical return address one instruction before the block end.
    let block = resolver
        .resolve(&master, &cov, BIN, 0x101c)
        .expect("resolve")
        .expect("mid-block address must resolve");
    assert_eq!(block.bb_rva, 0x1000);
    assert!(block.was_mid_block(0x101c));
}

#[test]
fn exact_match_wins_over_floor_at_block_boundaries() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let mut resolver = BlockResolver::new();

    // 0x1020 is one past the end of the first block AND the start of the
    // second; the exact match takes it.
    let block = resolver
        .resolve(&master, &cov, BIN, 0x1020)
        .expect("resolve")
        .expect("boundary address must resolve");
    assert_eq!(block.bb_rva, 0x1020);
}

#[test]
fn one_past_end_is_accepted_when_no_block_starts_there() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let mut resolver = BlockResolver::new();

    // 0x1040 is one past the end of the last block: inclusive upper bound.
    let block = resolver
        .resolve(&master, &cov, BIN, 0x1040)
        .expect("resolve")
        .expect("one-past-end return address must resolve");
    assert_eq!(block.bb_rva, 0x1020);

    // 0x1041 is beyond it: unresolvable.
    let miss = resolver.resolve(&master, &cov, BIN, 0x1041).expect("resolve");
    assert!(miss.is_none());
}

#[test]
fn addresses_below_every_block_are_unresolvable() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let mut resolver = BlockResolver::new();

    let miss = resolver.resolve(&master, &cov, BIN, 0x800).expect("resolve");
    assert!(miss.is_none());
}

#[test]
fn resolutions_are_written_through_to_the_cache_table() {
    let dir = tempdir().expect("tempdir");
    let master = fixture_master(&dir.path().join("master.db"));
    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");

    let mut resolver = BlockResolver::new();
    resolver.resolve(&master, &cov, BIN, 0x101c).expect("resolve").expect("resolves");

    let cached = cov.cached_resolution(BIN, 0x101c).expect("cache query");
    assert_eq!(cached.map(|b| b.bb_rva), Some(0x1000));

    // A fresh resolver (fresh memo) must hit the persisted cache without
    // consulting the master store again.
    let empty_master =
        MasterDb::initialize(&dir.path().join("empty_master.db")).expect("init empty master");
    let mut fresh = BlockResolver::new();
    let block = fresh
        .resolve(&empty_master, &cov, BIN, 0x101c)
        .expect("resolve")
        .expect("cache must answer");
    assert_eq!(block.bb_rva, 0x1000);
}
