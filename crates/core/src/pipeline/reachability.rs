//! Stage 7: reachability from frontier targets.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::db::{CovDb, DbResult};

/// Counters for the reachability stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReachabilityStats {
    /// `(frontier, new block)` pairs stored.
    pub pairs: usize,
}

/// For each frontier target, BFS over G_B and record every reachable new
/// block.
///
/// Traversal is not restricted to new blocks: reaching a shared-coverage
/// block and passing through it to a new descendant is valid. The adjacency
/// list and each BFS visited set are scoped to the binary being processed,
/// so loops in G_B terminate and memory is bounded by one binary's node
/// count.
pub fn compute_reachability(cov: &CovDb) -> DbResult<ReachabilityStats> {
    let mut stats = ReachabilityStats::default();

    for binary_id in cov.graph_binaries()? {
        let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
        for (src, dst) in cov.graph_edge_pairs(binary_id)? {
            adjacency.entry(src).or_default().push(dst);
        }

        let new_blocks: HashSet<i64> =
            cov.new_blocks_for_binary(binary_id)?.into_iter().map(|(rva, _)| rva).collect();

        for target in cov.frontier_targets_for_binary(binary_id)? {
            let mut visited: HashSet<i64> = HashSet::new();
            visited.insert(target.bb_rva);
            let mut queue: VecDeque<i64> = VecDeque::new();
            queue.push_back(target.bb_rva);

            while let Some(current) = queue.pop_front() {
                if new_blocks.contains(&current) {
                    cov.insert_reachability(binary_id, target.bb_rva, current)?;
                    stats.pairs += 1;
                }
                if let Some(successors) = adjacency.get(&current) {
                    for &next in successors {
                        if visited.insert(next) {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }
    }

    Ok(stats)
}
