//! Stage 5: executed-graph construction.
//!
//! G_B models what execution could have taken, restricted to what B actually
//! covered. Nodes are the B-covered blocks plus one synthetic super-root per
//! binary; edges combine the deterministic static CFG, static direct calls,
//! the transitions the tracer observed, and orphan-root edges for new blocks
//! nothing else explains.

use std::collections::HashSet;

use crate::db::{CovDb, DbResult, MasterDb};
use crate::model::{BinaryId, CfgEdgeKind, GraphEdgeType};
use crate::pipeline::BlockResolver;

/// Counters for graph construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    /// Total G_B nodes (including super-roots).
    pub nodes: i64,
    /// Total G_B edges of all types.
    pub edges: i64,
    /// Deterministic static CFG edges admitted.
    pub cfg_edges: usize,
    /// Direct call edges admitted.
    pub call_edges: usize,
    /// Observed edges admitted (conditional + return-continuation).
    pub observed_edges: usize,
    /// Observed edges dropped: endpoint unresolved or outside G_B.
    pub observed_skipped: usize,
    /// Orphan super-root edges added.
    pub orphan_edges: usize,
}

/// Build G_B for every binary with labeled coverage.
pub fn build_executed_graph(
    master: &MasterDb,
    cov: &CovDb,
    resolver: &mut BlockResolver,
    edges_b_table: &str,
) -> DbResult<GraphStats> {
    let mut stats = GraphStats::default();

    cov.insert_graph_nodes()?;
    // Super-root edges seed reachability from "wherever A could reach".
    cov.insert_super_root_edges()?;

    let b_nodes: HashSet<(BinaryId, i64)> = cov.graph_node_keys()?.into_iter().collect();

    for binary_id in cov.label_binaries()? {
        // Deterministic static CFG edges with both endpoints B-covered.
        for (src, dst, kind) in master.deterministic_cfg_edges(binary_id)? {
            if !b_nodes.contains(&(binary_id, src)) || !b_nodes.contains(&(binary_id, dst)) {
                continue;
            }
            let edge_type = match kind {
                CfgEdgeKind::Fallthrough => GraphEdgeType::CfgFallthrough,
                CfgEdgeKind::BranchUnconditional => GraphEdgeType::CfgBranchUnconditional,
                _ => continue,
            };
            cov.insert_graph_edge(binary_id, src, dst, edge_type)?;
            stats.cfg_edges += 1;
        }

        // Static direct calls: call-site block to callee entry block.
        for (src_rva, dst_func_id) in master.static_call_edges(binary_id)? {
            let Some(entry_rva) = master.function_entry_rva(binary_id, dst_func_id)? else {
                // Callee function row is gone from the master store; skip.
                continue;
            };
            if b_nodes.contains(&(binary_id, src_rva)) && b_nodes.contains(&(binary_id, entry_rva))
            {
                cov.insert_graph_edge(binary_id, src_rva, entry_rva, GraphEdgeType::CallDirect)?;
                stats.call_edges += 1;
            }
        }
    }

    // Observed edges from sample B. Both endpoints are mapped to their
    // containing blocks; a source that resolved mid-block is a return
    // address, making the edge a return continuation rather than a branch.
    for (module_id, src_rva, dst_rva) in cov.raw_edges(edges_b_table)? {
        let Some(binary_id) = cov.binary_for_module(module_id)? else {
            stats.observed_skipped += 1;
            continue;
        };
        let src = resolver.resolve(master, cov, binary_id, src_rva)?;
        let dst = resolver.resolve(master, cov, binary_id, dst_rva)?;
        let (Some(src_block), Some(dst_block)) = (src, dst) else {
            stats.observed_skipped += 1;
            continue;
        };
        if !b_nodes.contains(&(binary_id, src_block.bb_rva))
            || !b_nodes.contains(&(binary_id, dst_block.bb_rva))
        {
            stats.observed_skipped += 1;
            continue;
        }
        let edge_type = if src_block.was_mid_block(src_rva) {
            GraphEdgeType::ObservedReturnContinuation
        } else {
            GraphEdgeType::ObservedConditional
        };
        cov.insert_graph_edge(binary_id, src_block.bb_rva, dst_block.bb_rva, edge_type)?;
        stats.observed_edges += 1;
    }

    // New blocks with no incoming edge of any real type were entered through
    // a mechanism static analysis cannot see (indirect call, callback,
    // virtual dispatch). Wire them to the super-root so they keep frontier
    // status.
    stats.orphan_edges = cov.insert_orphan_edges()?;

    let (nodes, edges) = cov.graph_totals()?;
    stats.nodes = nodes;
    stats.edges = edges;

    Ok(stats)
}
