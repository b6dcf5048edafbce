use serde::{Deserialize, Serialize};

use crate::model::{BinaryId, FrontierType, ModuleId};

/// Module row as observed by the tracer (`modules` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: ModuleId,
    /// Module name as it appears in coverage lines (e.g., "ntdll.dll").
    pub name: String,
    /// Content hash, hex-encoded. The only reliable correlator with the
    /// master store.
    pub sha256_hash: String,
}

/// Binary row from the master store (`analyzed_binaries` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzedBinary {
    pub binary_id: BinaryId,
    pub binary_name: String,
    pub sha256_hash: String,
}

/// Function row from the master store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRow {
    pub func_id: i64,
    pub func_name: Option<String>,
    pub entry_rva: i64,
    pub start_va: i64,
    pub end_va: i64,
    pub func_size: i64,
}

/// A module successfully paired with its analyzed binary via content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBinaryPair {
    pub module_id: ModuleId,
    pub binary_id: BinaryId,
    pub module_name: String,
    pub binary_name: String,
    pub sha256_hash: String,
}

/// A module whose hash matched no analyzed binary. Its coverage is dropped
/// from every downstream stage.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnmappedModule {
    pub module_id: ModuleId,
    pub name: String,
    pub sha256: String,
}

/// One edge of the executed graph G_B, as stored in `graph_B_edges`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdgeRow {
    pub src_bb_rva: i64,
    pub dst_bb_rva: i64,
    pub edge_type: String,
}

/// A classified frontier target (`frontier_targets`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontierTargetRow {
    pub bb_rva: i64,
    pub func_id: i64,
    pub frontier_type: FrontierType,
}

/// Per-new-block attribution outcome (`bb_attributed_to`).
///
/// `frontier_bb_rva` is `None` exactly when the block is shared between two
/// or more frontiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAttributionRow {
    pub new_bb_rva: i64,
    pub frontier_bb_rva: Option<i64>,
    pub is_shared: bool,
}

/// Per-frontier aggregate counts (`frontier_attribution`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontierAttributionRow {
    pub frontier_bb_rva: i64,
    pub attributed_new_bb_count: i64,
    pub unique_new_bb_count: i64,
    pub shared_new_bb_count: i64,
    pub attributed_new_func_count: i64,
}

/// Function-level rollup (`function_unlock_scores`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionScoreRow {
    pub binary_id: BinaryId,
    pub func_id: i64,
    pub func_name: String,
    pub unique_new_bb: i64,
    pub shared_new_bb: i64,
    pub total_new_bb: i64,
    pub frontier_count: i64,
    pub strong_frontier_count: i64,
    pub weak_frontier_count: i64,
}

/// Callsite-level rollup (`callsite_unlock_scores`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallsiteScoreRow {
    pub binary_id: BinaryId,
    pub src_bb_rva: i64,
    pub src_func_id: i64,
    pub src_func_name: Option<String>,
    pub dst_func_id: Option<i64>,
    pub dst_func_name: Option<String>,
    pub unique_new_bb: i64,
    pub shared_new_bb: i64,
    pub total_new_bb: i64,
}
