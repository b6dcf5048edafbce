//! Visualization export.
//!
//! Flattens the pipeline's relations into one JSON document the frontend
//! consumes: per module, identification plus derived statistics, a sorted
//! list of functions each carrying its sorted blocks (status, frontier flag,
//! attribution, hex addresses), and a flat edge list with frontier flags.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::db::{CovDb, DbResult, MasterDb};
use crate::model::{BinaryId, BlockStatus, FrontierType, FunctionStatus, ModuleId};

/// Schema version stamped at the document root.
pub const EXPORT_VERSION: &str = "1.0";

/// Root of the export document.
#[derive(Debug, Clone, Serialize)]
pub struct VizDocument {
    pub version: String,
    pub description: String,
    pub modules: Vec<ModuleExport>,
}

/// One module's worth of export data.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleExport {
    /// Coverage-side module id; absent when the binary had labels but no
    /// surviving map row.
    pub module_id: Option<ModuleId>,
    pub binary_id: BinaryId,
    pub module_name: String,
    pub binary_name: String,
    pub sha256_hash: String,
    pub status: String,
    pub statistics: ModuleStatistics,
    pub functions: Vec<FunctionExport>,
    pub edges: Vec<EdgeExport>,
}

/// Module-level totals per status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleStatistics {
    pub total_functions: usize,
    pub new_functions: usize,
    pub changed_functions: usize,
    pub old_functions: usize,
    pub total_blocks: usize,
    pub new_blocks: usize,
    #[serde(rename = "blocks_in_A")]
    pub blocks_in_a: usize,
    #[serde(rename = "blocks_in_B")]
    pub blocks_in_b: usize,
}

/// One function with its covered blocks.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionExport {
    pub func_id: i64,
    pub func_name: Option<String>,
    pub entry_rva: String,
    pub start_va: String,
    pub end_va: String,
    pub func_size: i64,
    pub status: String,
    /// True iff no static direct call targets this function; heuristic for
    /// virtual/callback entry points.
    pub is_indirectly_called: bool,
    pub blocks: Vec<BlockExport>,
    pub attribution: FunctionAttributionExport,
}

/// Function-level unlock scores.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionAttributionExport {
    pub total_new_bb: i64,
    pub unique_new_bb: i64,
    pub shared_new_bb: i64,
    pub frontier_count: i64,
    pub strong_frontier_count: i64,
    pub weak_frontier_count: i64,
}

/// One covered block.
#[derive(Debug, Clone, Serialize)]
pub struct BlockExport {
    pub bb_rva: String,
    pub bb_start_va: Option<String>,
    pub bb_end_va: Option<String>,
    pub bb_size: i64,
    pub status: String,
    pub is_frontier: bool,
    pub frontier_type: Option<String>,
    pub attribution: BlockAttributionExport,
}

/// Per-block attribution annotation.
#[derive(Debug, Clone, Serialize)]
pub struct BlockAttributionExport {
    pub is_attributed: bool,
    pub frontier_bb_rva: Option<String>,
    pub is_shared: bool,
}

impl Default for BlockAttributionExport {
    fn default() -> Self {
        Self { is_attributed: false, frontier_bb_rva: None, is_shared: false }
    }
}

/// One G_B edge (super-root edges excluded).
#[derive(Debug, Clone, Serialize)]
pub struct EdgeExport {
    pub src_bb_rva: String,
    pub dst_bb_rva: String,
    pub edge_type: String,
    pub is_frontier_edge: bool,
}

fn hex(value: i64) -> String {
    format!("{value:#x}")
}

/// Build the full export document over every binary with labeled coverage.
pub fn build_document(master: &MasterDb, cov: &CovDb) -> DbResult<VizDocument> {
    let mut modules = Vec::new();
    for binary_id in cov.label_binaries()? {
        modules.push(export_module(master, cov, binary_id)?);
    }
    Ok(VizDocument {
        version: EXPORT_VERSION.to_string(),
        description: "Coverage diff visualization data".to_string(),
        modules,
    })
}

/// Export all data for a single module/binary.
pub fn export_module(
    master: &MasterDb,
    cov: &CovDb,
    binary_id: BinaryId,
) -> DbResult<ModuleExport> {
    let (binary_name, sha256_hash) = match master.binary_info(binary_id)? {
        Some(binary) => (binary.binary_name, binary.sha256_hash),
        None => ("<unknown>".to_string(), String::new()),
    };
    let (module_id, module_name) = match cov.module_for_binary(binary_id)? {
        Some((id, name)) => (Some(id), name),
        None => (None, binary_name.clone()),
    };

    // Covered blocks with their diff status, keyed by RVA for sorted output.
    let labels = cov.labels_for_binary(binary_id)?;
    let mut block_status: BTreeMap<i64, BlockStatus> = BTreeMap::new();
    let mut func_blocks: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    let mut blocks_in_a = 0;
    let mut blocks_in_b = 0;
    for label in &labels {
        block_status.insert(label.bb_rva, label.status());
        func_blocks.entry(label.func_id).or_default().push(label.bb_rva);
        if label.in_a {
            blocks_in_a += 1;
        }
        if label.in_b {
            blocks_in_b += 1;
        }
    }

    let frontier_types: BTreeMap<i64, FrontierType> = cov
        .frontier_targets_for_binary(binary_id)?
        .into_iter()
        .map(|t| (t.bb_rva, t.frontier_type))
        .collect();

    let block_attributions: BTreeMap<i64, (Option<i64>, bool)> = cov
        .block_attributions_for_binary(binary_id)?
        .into_iter()
        .map(|row| (row.new_bb_rva, (row.frontier_bb_rva, row.is_shared)))
        .collect();

    let function_scores: BTreeMap<i64, FunctionAttributionExport> = cov
        .function_scores_for_binary(binary_id)?
        .into_iter()
        .map(|row| {
            (
                row.func_id,
                FunctionAttributionExport {
                    total_new_bb: row.total_new_bb,
                    unique_new_bb: row.unique_new_bb,
                    shared_new_bb: row.shared_new_bb,
                    frontier_count: row.frontier_count,
                    strong_frontier_count: row.strong_frontier_count,
                    weak_frontier_count: row.weak_frontier_count,
                },
            )
        })
        .collect();

    // Functions sorted by id; blocks within each function sorted by RVA.
    // Covered functions missing from the master store are dropped from the
    // function list but still counted in the block statistics.
    let mut functions = Vec::new();
    for (func_id, rvas) in &func_blocks {
        let Some(func_row) = master.function_row(binary_id, *func_id)? else {
            continue;
        };

        let mut rvas = rvas.clone();
        rvas.sort_unstable();

        let mut blocks = Vec::new();
        let mut statuses = Vec::new();
        for bb_rva in rvas {
            let status = block_status[&bb_rva];
            statuses.push(status);
            let span = master.block_span(binary_id, bb_rva)?;
            let attribution = match block_attributions.get(&bb_rva) {
                Some((frontier_bb_rva, is_shared)) => BlockAttributionExport {
                    is_attributed: true,
                    frontier_bb_rva: frontier_bb_rva.map(hex),
                    is_shared: *is_shared,
                },
                None => BlockAttributionExport::default(),
            };
            let frontier_type = frontier_types.get(&bb_rva).copied();
            blocks.push(BlockExport {
                bb_rva: hex(bb_rva),
                bb_start_va: span.map(|(start, _)| hex(start)),
                bb_end_va: span.map(|(_, end)| hex(end)),
                bb_size: span.map(|(start, end)| end - start).unwrap_or(0),
                status: status.as_str().to_string(),
                is_frontier: frontier_type.is_some(),
                frontier_type: frontier_type.map(|t| t.as_str().to_string()),
                attribution,
            });
        }

        let status = FunctionStatus::from_blocks(statuses.iter());

        functions.push(FunctionExport {
            func_id: func_row.func_id,
            func_name: func_row.func_name,
            entry_rva: hex(func_row.entry_rva),
            start_va: hex(func_row.start_va),
            end_va: hex(func_row.end_va),
            func_size: func_row.func_size,
            status: status.as_str().to_string(),
            is_indirectly_called: !master.has_direct_callers(binary_id, *func_id)?,
            blocks,
            attribution: function_scores.get(func_id).cloned().unwrap_or_default(),
        });
    }

    let frontier_edge_set: HashSet<(i64, i64)> =
        cov.frontier_edge_pairs(binary_id)?.into_iter().collect();
    let edges = cov
        .graph_edges_for_export(binary_id)?
        .into_iter()
        .map(|edge| EdgeExport {
            src_bb_rva: hex(edge.src_bb_rva),
            dst_bb_rva: hex(edge.dst_bb_rva),
            edge_type: edge.edge_type,
            is_frontier_edge: frontier_edge_set.contains(&(edge.src_bb_rva, edge.dst_bb_rva)),
        })
        .collect();

    let new_functions = functions.iter().filter(|f| f.status == "new").count();
    let changed_functions = functions.iter().filter(|f| f.status == "changed").count();
    let old_functions = functions.iter().filter(|f| f.status == "old").count();
    let statistics = ModuleStatistics {
        total_functions: functions.len(),
        new_functions,
        changed_functions,
        old_functions,
        total_blocks: block_status.len(),
        new_blocks: block_status.values().filter(|s| **s == BlockStatus::New).count(),
        blocks_in_a,
        blocks_in_b,
    };

    let status = if new_functions > 0 || changed_functions > 0 {
        if new_functions == functions.len() {
            "new"
        } else {
            "changed"
        }
    } else {
        "old"
    };

    Ok(ModuleExport {
        module_id,
        binary_id,
        module_name,
        binary_name,
        sha256_hash,
        status: status.to_string(),
        statistics,
        functions,
        edges,
    })
}
