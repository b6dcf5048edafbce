use covdiff_core::db::{CovDb, MasterDb};
use covdiff_core::model::{BinaryId, Sample};
use covdiff_core::pipeline::{run_pipeline, PipelineOptions};
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

fn add_block(master: &MasterDb, binary_id: i64, func_id: i64, bb_rva: i64) {
    master
        .connection()
        .execute(
            "INSERT INTO basic_blocks (binary_id, func_id, bb_rva, bb_start_va, bb_end_va) \
             VALUES (?1, ?2, ?3, ?3, ?3 + 16)",
            params![binary_id, func_id, bb_rva],
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

fn add_call(master: &MasterDb, binary_id: i64, src_bb: i64, dst_func: i64) {
    master
        .connection()
        .execute(
            "INSERT INTO call_edges_static (binary_id, src_bb_rva, dst_func_id) \
             VALUES (?1, ?2, ?3)",
            params![binary_id, src_bb, dst_func],
        )
        .expect("insert call edge");
}

/// Unlocked callee: the whole callee body attributes to the call-site
/// frontier and rolls up to both function and callsite scores.
#[test]
fn call_unlock_rolls_up_to_function_and_callsite_scores() {
    let dir = tempdir().expect("tempdir");
    let master = MasterDb::initialize(&dir.path().join("master.db")).expect("init master");
    add_binary(&master, 1, "target.exe", "hash-1");
    add_func(&master, 1, 7, "caller", 0x100);
    add_func(&master, 1, 8, "callee", 0x900);
    add_block(&master, 1, 7, 0x100);
    add_block(&master, 1, 8, 0x900);
    add_block(&master, 1, 8, 0x910);
    add_cfg(&master, 1, 0x900, 0x910, "fallthrough");
    add_call(&master, 1, 0x100, 8);

    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let module_id = cov.insert_module("target.exe", "hash-1").expect("insert module");
    cov.insert_raw_block(Sample::A.blocks_table(), module_id, 0x100).expect("raw block");
    cov.insert_raw_block(Sample::B.blocks_table(), module_id, 0x100).expect("raw block");
    cov.insert_raw_block(Sample::B.blocks_table(), module_id, 0x900).expect("raw block");

    let report = run_pipeline(&master, &cov, &PipelineOptions::default()).expect("pipeline runs");
    // 0x910 comes from deterministic expansion.
    assert_eq!(report.labels.new_blocks, 2);

    let scores = cov.function_scores_for_binary(BIN).expect("function scores");
    assert_eq!(scores.len(), 1);
    let score = &scores[0];
    assert_eq!(score.func_id, 8);
    assert_eq!(score.func_name, "callee");
    assert_eq!(score.unique_new_bb, 2);
    assert_eq!(score.shared_new_bb, 0);
    assert_eq!(score.total_new_bb, 2);
    assert_eq!(score.frontier_count, 1);
    assert_eq!(score.strong_frontier_count, 1);
    assert_eq!(score.weak_frontier_count, 0);

    let (src_func, dst_func, unique, shared, total): (i64, i64, i64, i64, i64) = cov
        .connection()
        .query_row(
            "SELECT src_func_id, dst_func_id, unique_new_bb, shared_new_bb, total_new_bb \
             FROM callsite_unlock_scores WHERE binary_id = 1 AND src_bb_rva = 256",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .expect("callsite row");
    assert_eq!((src_func, dst_func), (7, 8));
    assert_eq!((unique, shared, total), (2, 0, 2));

    let (src_name, dst_name): (Option<String>, Option<String>) = cov
        .connection()
        .query_row(
            "SELECT src_func_name, dst_func_name \
             FROM callsite_unlock_scores WHERE binary_id = 1 AND src_bb_rva = 256",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("callsite names");
    assert_eq!(src_name.as_deref(), Some("caller"));
    assert_eq!(dst_name.as_deref(), Some("callee"));
}

/// Two frontiers of one function sharing a downstream block: the shared
/// block stays shared in attribution, and the function rollup counts it
/// once.
#[test]
fn function_rollup_never_double_counts_shared_blocks() {
    let dir = tempdir().expect("tempdir");
    let master = MasterDb::initialize(&dir.path().join("master.db")).expect("init master");
    add_binary(&master, 1, "target.exe", "hash-1");
    add_func(&master, 1, 7, "dispatch", 0x100);
    add_func(&master, 1, 8, "worker", 0x900);
    add_block(&master, 1, 7, 0x100);
    add_block(&master, 1, 8, 0x900);
    add_block(&master, 1, 8, 0x920);
    add_block(&master, 1, 8, 0x930);

    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let module_id = cov.insert_module("target.exe", "hash-1").expect("insert module");
    cov.insert_raw_block(Sample::A.blocks_table(), module_id, 0x100).expect("raw block");
    for rva in [0x100, 0x900, 0x920, 0x930] {
        cov.insert_raw_block(Sample::B.blocks_table(), module_id, rva).expect("raw block");
    }
    for (src, dst) in [(0x100, 0x900), (0x100, 0x920), (0x900, 0x930), (0x920, 0x930)] {
        cov.insert_raw_edge(Sample::B.edges_table(), module_id, src, dst).expect("raw edge");
    }

    run_pipeline(&master, &cov, &PipelineOptions::default()).expect("pipeline runs");

    let attributions = cov.block_attributions_for_binary(BIN).expect("attributions");
    let shared: Vec<i64> =
        attributions.iter().filter(|a| a.is_shared).map(|a| a.new_bb_rva).collect();
    assert_eq!(shared, vec![0x930]);

    let scores = cov.function_scores_for_binary(BIN).expect("function scores");
    assert_eq!(scores.len(), 1);
    let score = &scores[0];
    assert_eq!(score.func_id, 8);
    assert_eq!(score.unique_new_bb, 2);
    assert_eq!(score.shared_new_bb, 1);
    // 0x930 is reachable from both frontiers but counted once.
    assert_eq!(score.total_new_bb, 3);
    assert_eq!(score.frontier_count, 2);
    assert_eq!(score.strong_frontier_count, 2);
}

/// Invariants 6 and 7: attributed blocks appear exactly once, and each
/// frontier's unique + shared equals the number of new blocks it reaches.
#[test]
fn attribution_counts_are_consistent_with_reachability() {
    let dir = tempdir().expect("tempdir");
    let master = MasterDb::initialize(&dir.path().join("master.db")).expect("init master");
    add_binary(&master, 1, "target.exe", "hash-1");
    add_func(&master, 1, 7, "main", 0x100);
    for rva in [0x100, 0x200, 0x300, 0x400, 0x500] {
        add_block(&master, 1, 7, rva);
    }
    add_cfg(&master, 1, 0x300, 0x500, "fallthrough");

    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let module_id = cov.insert_module("target.exe", "hash-1").expect("insert module");
    for rva in [0x100, 0x200] {
        cov.insert_raw_block(Sample::A.blocks_table(), module_id, rva).expect("raw block");
    }
    for rva in [0x100, 0x200, 0x300, 0x400, 0x500] {
        cov.insert_raw_block(Sample::B.blocks_table(), module_id, rva).expect("raw block");
    }
    for (src, dst) in [(0x100, 0x300), (0x200, 0x400), (0x400, 0x500)] {
        cov.insert_raw_edge(Sample::B.edges_table(), module_id, src, dst).expect("raw edge");
    }

    run_pipeline(&master, &cov, &PipelineOptions::default()).expect("pipeline runs");

    // Invariant 6: one attribution row per attributed block.
    let (rows, distinct_rows): (i64, i64) = cov
        .connection()
        .query_row(
            "SELECT COUNT(*), COUNT(DISTINCT new_bb_rva) FROM bb_attributed_to \
             WHERE binary_id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("attribution counts");
    assert!(rows > 0);
    assert_eq!(rows, distinct_rows);

    // Invariant 7: per frontier, unique + shared = reached new blocks.
    let pairs = cov.reachability_pairs(BIN).expect("reachability");
    let frontier_rows: Vec<(i64, i64, i64, i64)> = {
        let conn = cov.connection();
        let mut stmt = conn
            .prepare(
                "SELECT frontier_bb_rva, attributed_new_bb_count, unique_new_bb_count, \
                        shared_new_bb_count \
                 FROM frontier_attribution WHERE binary_id = 1",
            )
            .expect("prepare");
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .expect("query");
        rows.collect::<Result<Vec<_>, _>>().expect("collect")
    };
    assert!(!frontier_rows.is_empty());
    for (frontier, total, unique, shared) in frontier_rows {
        let reached = pairs.iter().filter(|(f, _)| *f == frontier).count() as i64;
        assert_eq!(unique + shared, total);
        assert_eq!(total, reached);
    }
}

/// New blocks reachable from no frontier stay absent from `bb_attributed_to`.
///
/// A cycle of new blocks feeding each other has incoming real edges (so no
/// orphan wiring) but no A-covered predecessor, so no frontier reaches it.
#[test]
fn unreachable_new_blocks_stay_unattributed() {
    let dir = tempdir().expect("tempdir");
    let master = MasterDb::initialize(&dir.path().join("master.db")).expect("init master");
    add_binary(&master, 1, "target.exe", "hash-1");
    add_func(&master, 1, 7, "main", 0x100);
    add_block(&master, 1, 7, 0x100);
    add_block(&master, 1, 7, 0x200);
    add_block(&master, 1, 7, 0x300);
    add_cfg(&master, 1, 0x200, 0x300, "branch_unconditional");
    add_cfg(&master, 1, 0x300, 0x200, "branch_unconditional");

    let cov = CovDb::open(&dir.path().join("cov.db")).expect("open cov");
    let module_id = cov.insert_module("target.exe", "hash-1").expect("insert module");
    cov.insert_raw_block(Sample::A.blocks_table(), module_id, 0x100).expect("raw block");
    cov.insert_raw_block(Sample::B.blocks_table(), module_id, 0x100).expect("raw block");
    cov.insert_raw_block(Sample::B.blocks_table(), module_id, 0x200).expect("raw block");

    let report = run_pipeline(&master, &cov, &PipelineOptions::default()).expect("pipeline runs");

    // 0x300 reconstructed by expansion; both loop blocks are new.
    assert_eq!(report.labels.new_blocks, 2);
    // Each loop block has an incoming real edge, so neither is an orphan,
    // and no A-covered block reaches them: no frontier at all.
    assert_eq!(report.frontier.strong + report.frontier.weak, 0);

    let (total_new, attributed, unique, shared) =
        cov.attribution_totals().expect("attribution totals");
    assert_eq!(total_new, 2);
    assert_eq!(attributed, 0);
    assert_eq!(unique, 0);
    assert_eq!(shared, 0);
}
