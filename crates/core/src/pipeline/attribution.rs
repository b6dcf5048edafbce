//! Stage 8a: attribution of new blocks to frontier targets.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::db::{BlockAttributionRow, CovDb, FrontierAttributionRow};
use crate::pipeline::{PipelineError, PipelineResult};

/// Counters for the attribution stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributionStats {
    /// New blocks that received an attribution row.
    pub attributed_blocks: usize,
    /// Frontier targets with at least one attributed block.
    pub frontiers: usize,
}

#[derive(Default)]
struct FrontierTally {
    unique: HashSet<i64>,
    shared: HashSet<i64>,
    funcs: HashSet<i64>,
}

/// Assign each new block to the frontier(s) it is reachable from.
///
/// A block reachable from exactly one frontier is uniquely attributed to it;
/// a block reachable from several is shared among all of them (and carries no
/// single frontier RVA). Blocks reachable from no frontier stay absent from
/// `bb_attributed_to`.
pub fn compute_attribution(cov: &CovDb) -> PipelineResult<AttributionStats> {
    let mut stats = AttributionStats::default();

    for binary_id in cov.graph_binaries()? {
        let new_block_funcs: HashMap<i64, i64> =
            cov.new_blocks_for_binary(binary_id)?.into_iter().collect();

        // Materialize "new block -> frontier set" once; |F(n)| decides
        // unique vs. shared in a single pass.
        let mut frontiers_by_block: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (frontier_bb, new_bb) in cov.reachability_pairs(binary_id)? {
            frontiers_by_block.entry(new_bb).or_default().push(frontier_bb);
        }

        let mut tallies: BTreeMap<i64, FrontierTally> = BTreeMap::new();

        for (new_bb, frontiers) in &frontiers_by_block {
            let func_id = *new_block_funcs.get(new_bb).ok_or_else(|| {
                PipelineError::InvariantViolation(format!(
                    "reachability row names block {new_bb:#x} in binary {binary_id} \
                     that bb_labels does not list as new"
                ))
            })?;

            if let [frontier] = frontiers.as_slice() {
                let tally = tallies.entry(*frontier).or_default();
                tally.unique.insert(*new_bb);
                tally.funcs.insert(func_id);
                cov.insert_block_attribution(
                    binary_id,
                    &BlockAttributionRow {
                        new_bb_rva: *new_bb,
                        frontier_bb_rva: Some(*frontier),
                        is_shared: false,
                    },
                )?;
            } else {
                for frontier in frontiers {
                    let tally = tallies.entry(*frontier).or_default();
                    tally.shared.insert(*new_bb);
                    tally.funcs.insert(func_id);
                }
                cov.insert_block_attribution(
                    binary_id,
                    &BlockAttributionRow {
                        new_bb_rva: *new_bb,
                        frontier_bb_rva: None,
                        is_shared: true,
                    },
                )?;
            }
        }

        for (frontier_bb, tally) in &tallies {
            let unique = tally.unique.len() as i64;
            let shared = tally.shared.len() as i64;
            cov.insert_frontier_attribution(
                binary_id,
                &FrontierAttributionRow {
                    frontier_bb_rva: *frontier_bb,
                    attributed_new_bb_count: unique + shared,
                    unique_new_bb_count: unique,
                    shared_new_bb_count: shared,
                    attributed_new_func_count: tally.funcs.len() as i64,
                },
            )?;
        }

        stats.attributed_blocks += frontiers_by_block.len();
        stats.frontiers += tallies.len();
    }

    Ok(stats)
}
