//! Stage 6: frontier identification and classification.

use crate::db::{CovDb, DbResult, FrontierTargetRow};
use crate::model::FrontierType;

/// Counters for frontier classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontierStats {
    pub strong: usize,
    pub weak: usize,
}

impl FrontierStats {
    pub fn total(&self) -> usize {
        self.strong + self.weak
    }
}

/// Find frontier edges and classify their targets.
///
/// A frontier edge is any non-super-root G_B edge from an A-covered source to
/// a new destination, plus every orphan edge. A target is strong when all of
/// its real predecessors are A-covered and none is new; orphan-entered
/// targets are always weak.
pub fn identify_frontier(cov: &CovDb) -> DbResult<FrontierStats> {
    cov.insert_frontier_edges()?;

    let mut stats = FrontierStats::default();

    for (binary_id, bb_rva, func_id) in cov.frontier_candidates()? {
        let frontier_type = if cov.is_orphan_entered(binary_id, bb_rva)? {
            FrontierType::Weak
        } else {
            let mut has_a_edge = false;
            let mut has_new_edge = false;
            for (in_a, is_new) in cov.incoming_source_flags(binary_id, bb_rva)? {
                if in_a {
                    has_a_edge = true;
                }
                if is_new {
                    has_new_edge = true;
                }
            }
            if has_a_edge && !has_new_edge {
                FrontierType::Strong
            } else {
                FrontierType::Weak
            }
        };

        cov.insert_frontier_target(
            binary_id,
            &FrontierTargetRow { bb_rva, func_id, frontier_type },
        )?;
        match frontier_type {
            FrontierType::Strong => stats.strong += 1,
            FrontierType::Weak => stats.weak += 1,
        }
    }

    Ok(stats)
}
