use std::path::Path;

use covdiff_core::db::{CovDb, MasterDb};
use covdiff_core::model::{BinaryId, ModuleId, Sample};
use covdiff_core::pipeline::{expand_sample, join_sample, map_modules, BlockResolver};
use covdiff_core::report::MissingReason;
use rusqlite::params;
use tempfile::tempdir;

const BIN: BinaryId = BinaryId(1);

fn add_binary(master: &MasterDb, id: i64, name: &str, hash: &str) {
    master
        .connection()
        .execute(
            "INSERT INTO analyzed_binaries (binary_id, binary_name, sha256_hash) \
             VALUES (?1, ?2, ?3)",
            params![id, name, hash],
        )
        .expect("insert binary");
}

fn add_func(master: &MasterDb, binary_id: i64, func_id: i64, name: &str, entry_rva: i64) {
    master
        .connection()
        .execute(
            "INSERT INTO functions (binary_id, func_id, func_name, entry_rva, start_va, end_va, func_size) \
             VALUES (?1, ?2, ?3, ?4, ?4, ?4 + 4096, 4096)",
            params![binary_id, func_id, name, entry_rva],
        )
        .expect("insert function");
}

fn add_block(master: &MasterDb, binary_id: i64, func_id: i64, bb_rva: i64, size: i64) {
    master
        .connection()
        .execute(
            "INSERT INTO basic_blocks (binary_id, func_id, bb_rva, bb_start_va, bb_end_va) \
             VALUES (?1, ?2, ?3, ?3, ?3 + ?4)",
            params![binary_id, func_id, bb_rva, size],
        )
        .expect("insert block");
}

fn add_cfg(master: &MasterDb, binary_id: i64, src: i64, dst: i64, kind: &str) {
    master
        .connection()
        .execute(
            "INSERT INTO cfg_edges (binary_id, src_bb_rva, dst_bb_rva, edge_kind) \
             VALUES (?1, ?2, ?3, ?4)",
            params![binary_id, src, dst, kind],
        )
        .expect("insert cfg edge");
}

fn mapped_fixture(dir: &Path) -> (MasterDb, CovDb, ModuleId) {
    let master = MasterDb::initialize(&dir.join("master.db")).expect("init master");
    add_binary(&master, 1, "target.exe", "hash-1");
    add_func(&master, 1, 7, "main", 0x100);

    let cov = CovDb::open(&dir.join("cov.db")).expect("open cov");
    let module_id = cov.insert_module("target.exe", "hash-1").expect("insert module");
    let outcome = map_modules(&master, &cov).expect("map modules");
    assert_eq!(outcome.mapped.len(), 1);
    (master, cov, module_id)
}

#[test]
fn join_resolves_blocks_and_edge_endpoints_with_dedup() {
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    add_block(&master, 1, 7, 0x100, 0x10);
    add_block(&master, 1, 7, 0x200, 0x10);
    add_block(&master, 1, 7, 0x300, 0x10);

    let blocks = Sample::A.blocks_table();
    let edges = Sample::A.edges_table();
    cov.insert_raw_block(blocks, module_id, 0x100).expect("raw block");
    // 0x10c is a return address inside block 0x100.
    cov.insert_raw_block(blocks, module_id, 0x10c).expect("raw block");
    cov.insert_raw_edge(edges, module_id, 0x200, 0x300).expect("raw edge");
    // Edge endpoint repeats a block hit; the joined table stays unique.
    cov.insert_raw_edge(edges, module_id, 0x100, 0x300).expect("raw edge");

    let mut resolver = BlockResolver::new();
    let outcome =
        join_sample(&master, &cov, &mut resolver, Sample::A, blocks, edges).expect("join");

    assert_eq!(outcome.stats.input_blocks, 2);
    assert_eq!(outcome.stats.edge_sources, 2);
    assert_eq!(outcome.stats.edge_destinations, 2);
    // Unique inputs: 0x100, 0x10c, 0x200, 0x300 (0x300 repeats, 0x100 repeats).
    assert_eq!(outcome.stats.joined, 4);
    assert_eq!(outcome.stats.mid_block_resolved, 1);
    assert_eq!(outcome.stats.unresolved, 0);
    assert!(outcome.missing.is_empty());

    let mut joined = cov.joined_block_rvas(Sample::A.joined_table(), BIN).expect("joined");
    joined.sort_unstable();
    assert_eq!(joined, vec![0x100, 0x200, 0x300]);
}

#[test]
fn join_records_missing_rows_with_reasons() {
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    add_block(&master, 1, 7, 0x100, 0x10);

    // A second module with no matching binary: its rows drop with
    // module_not_mapped.
    let orphan_module = cov.insert_module("stale.dll", "no-such-hash").expect("insert module");
    map_modules(&master, &cov).expect("map modules");

    let blocks = Sample::B.blocks_table();
    let edges = Sample::B.edges_table();
    cov.insert_raw_block(blocks, module_id, 0x100).expect("raw block");
    cov.insert_raw_block(blocks, module_id, 0x9999).expect("raw block");
    cov.insert_raw_block(blocks, orphan_module, 0x100).expect("raw block");

    let mut resolver = BlockResolver::new();
    let outcome =
        join_sample(&master, &cov, &mut resolver, Sample::B, blocks, edges).expect("join");

    assert_eq!(outcome.stats.joined, 1);
    assert_eq!(outcome.stats.unresolved, 2);
    assert_eq!(outcome.missing.len(), 2);

    let unmapped = outcome
        .missing
        .iter()
        .find(|m| m.reason == MissingReason::ModuleNotMapped)
        .expect("module_not_mapped row");
    assert_eq!(unmapped.module_id, orphan_module);
    assert!(unmapped.binary_id.is_none());

    let unknown = outcome
        .missing
        .iter()
        .find(|m| m.reason == MissingReason::NotFoundInStaticAnalysis)
        .expect("not_found row");
    assert_eq!(unknown.instruction_rva, 0x9999);
    assert_eq!(unknown.binary_id, Some(BIN));
}

#[test]
fn expansion_reconstructs_deterministic_chain() {
    // CFG: 10 -> 20 (fallthrough, single succ), 20 -> 30 (unconditional,
    // single succ), 30 -> 40 / 30 -> 50 (conditional pair). Coverage records
    // only {10, 40}; expansion adds {20, 30} and stops at the branch.
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    for rva in [0x10, 0x20, 0x30, 0x40, 0x50] {
        add_block(&master, 1, 7, rva, 0x8);
    }
    add_cfg(&master, 1, 0x10, 0x20, "fallthrough");
    add_cfg(&master, 1, 0x20, 0x30, "branch_unconditional");
    add_cfg(&master, 1, 0x30, 0x40, "branch_conditional");
    add_cfg(&master, 1, 0x30, 0x50, "branch_conditional");

    let blocks = Sample::A.blocks_table();
    cov.insert_raw_block(blocks, module_id, 0x10).expect("raw block");
    cov.insert_raw_block(blocks, module_id, 0x40).expect("raw block");

    let mut resolver = BlockResolver::new();
    join_sample(&master, &cov, &mut resolver, Sample::A, blocks, Sample::A.edges_table())
        .expect("join");
    let stats = expand_sample(&master, &cov, Sample::A).expect("expand");

    assert_eq!(stats.added, 2);
    let mut joined = cov.joined_block_rvas(Sample::A.joined_table(), BIN).expect("joined");
    joined.sort_unstable();
    assert_eq!(joined, vec![0x10, 0x20, 0x30, 0x40]);
}

#[test]
fn expansion_terminates_on_cfg_back_edges() {
    // 10 -> 20 and 20 -> 10, both unconditional single successors: a loop.
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    add_block(&master, 1, 7, 0x10, 0x8);
    add_block(&master, 1, 7, 0x20, 0x8);
    add_cfg(&master, 1, 0x10, 0x20, "branch_unconditional");
    add_cfg(&master, 1, 0x20, 0x10, "branch_unconditional");

    let blocks = Sample::B.blocks_table();
    cov.insert_raw_block(blocks, module_id, 0x10).expect("raw block");

    let mut resolver = BlockResolver::new();
    join_sample(&master, &cov, &mut resolver, Sample::B, blocks, Sample::B.edges_table())
        .expect("join");
    let stats = expand_sample(&master, &cov, Sample::B).expect("expand");

    assert_eq!(stats.added, 1);
    let mut joined = cov.joined_block_rvas(Sample::B.joined_table(), BIN).expect("joined");
    joined.sort_unstable();
    assert_eq!(joined, vec![0x10, 0x20]);
}

#[test]
fn expansion_never_walks_through_conditional_branches() {
    // 10's only successor edge is conditional: the trace must have recorded
    // the destination itself, so nothing is reconstructed.
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    add_block(&master, 1, 7, 0x10, 0x8);
    add_block(&master, 1, 7, 0x20, 0x8);
    add_cfg(&master, 1, 0x10, 0x20, "branch_conditional");

    let blocks = Sample::B.blocks_table();
    cov.insert_raw_block(blocks, module_id, 0x10).expect("raw block");

    let mut resolver = BlockResolver::new();
    join_sample(&master, &cov, &mut resolver, Sample::B, blocks, Sample::B.edges_table())
        .expect("join");
    let stats = expand_sample(&master, &cov, Sample::B).expect("expand");

    assert_eq!(stats.added, 0);
}

#[test]
fn expansion_stops_at_already_covered_blocks() {
    // 10 -> 20 -> 30 all deterministic, but 20 is already covered: the walk
    // from 10 stops at 20 and 20's own walk reaches 30.
    let dir = tempdir().expect("tempdir");
    let (master, cov, module_id) = mapped_fixture(dir.path());
    for rva in [0x10, 0x20, 0x30] {
        add_block(&master, 1, 7, rva, 0x8);
    }
    add_cfg(&master, 1, 0x10, 0x20, "fallthrough");
    add_cfg(&master, 1, 0x20, 0x30, "fallthrough");

    let blocks = Sample::A.blocks_table();
    cov.insert_raw_block(blocks, module_id, 0x10).expect("raw block");
    cov.insert_raw_block(blocks, module_id, 0x20).expect("raw block");

    let mut resolver = BlockResolver::new();
    join_sample(&master, &cov, &mut resolver, Sample::A, blocks, Sample::A.edges_table())
        .expect("join");
    let stats = expand_sample(&master, &cov, Sample::A).expect("expand");

    assert_eq!(stats.added, 1);
    let mut joined = cov.joined_block_rvas(Sample::A.joined_table(), BIN).expect("joined");
    joined.sort_unstable();
    assert_eq!(joined, vec![0x10, 0x20, 0x30]);
}
