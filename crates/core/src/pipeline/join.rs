//! Stages 2 and 3: coverage join and deterministic path expansion.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::db::{CovDb, DbResult, MasterDb};
use crate::model::{CfgEdgeKind, ModuleId, Sample};
use crate::pipeline::BlockResolver;
use crate::report::{MissingBlock, MissingReason};

/// Counters for one sample's join stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinStats {
    /// Rows read from the raw blocks table.
    pub input_blocks: usize,
    /// Source endpoints contributed by the raw edges table.
    pub edge_sources: usize,
    /// Destination endpoints contributed by the raw edges table.
    pub edge_destinations: usize,
    /// Unique `(module, rva)` entries resolved to a block.
    pub joined: usize,
    /// Of those, entries that were mid-block addresses (return addresses).
    pub mid_block_resolved: usize,
    /// Entries dropped: module unmapped or RVA unknown to static analysis.
    pub unresolved: usize,
}

impl JoinStats {
    pub fn total_inputs(&self) -> usize {
        self.input_blocks + self.edge_sources + self.edge_destinations
    }
}

/// Join outcome: counters plus the rows for the missing-blocks report.
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    pub stats: JoinStats,
    pub missing: Vec<MissingBlock>,
}

/// Resolve one sample's raw coverage to blocks and fill its joined table.
///
/// Both endpoints of observed edges are joined too: an edge endpoint proves
/// execution reached its containing block, whether or not the tracer emitted
/// a separate block hit for it. The edges themselves are consumed later by
/// graph construction.
pub fn join_sample(
    master: &MasterDb,
    cov: &CovDb,
    resolver: &mut BlockResolver,
    sample: Sample,
    blocks_table: &str,
    edges_table: &str,
) -> DbResult<JoinOutcome> {
    let mut outcome = JoinOutcome::default();

    let mut entries: Vec<(ModuleId, i64)> = cov.raw_blocks(blocks_table)?;
    outcome.stats.input_blocks = entries.len();

    for (module_id, src_rva, dst_rva) in cov.raw_edges(edges_table)? {
        entries.push((module_id, src_rva));
        entries.push((module_id, dst_rva));
        outcome.stats.edge_sources += 1;
        outcome.stats.edge_destinations += 1;
    }

    let joined_table = sample.joined_table();
    let mut processed: HashSet<(ModuleId, i64)> = HashSet::new();

    for (module_id, instruction_rva) in entries {
        if !processed.insert((module_id, instruction_rva)) {
            continue;
        }

        let Some(binary_id) = cov.binary_for_module(module_id)? else {
            outcome.missing.push(MissingBlock {
                module_id,
                binary_id: None,
                instruction_rva,
                reason: MissingReason::ModuleNotMapped,
            });
            outcome.stats.unresolved += 1;
            continue;
        };

        match resolver.resolve(master, cov, binary_id, instruction_rva)? {
            Some(block) => {
                cov.insert_joined_block(joined_table, binary_id, block.func_id, block.bb_rva)?;
                outcome.stats.joined += 1;
                if block.was_mid_block(instruction_rva) {
                    outcome.stats.mid_block_resolved += 1;
                }
            }
            None => {
                outcome.missing.push(MissingBlock {
                    module_id,
                    binary_id: Some(binary_id),
                    instruction_rva,
                    reason: MissingReason::NotFoundInStaticAnalysis,
                });
                outcome.stats.unresolved += 1;
            }
        }
    }

    Ok(outcome)
}

/// Counters for one sample's deterministic expansion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionStats {
    /// Intermediate blocks reconstructed and added to the joined table.
    pub added: usize,
}

/// Reconstruct blocks the tracer never records.
///
/// Instrumentation only records non-deterministic transitions: a chain
/// X -> Y -> Z where X -> Y is a fallthrough or unconditional branch appears
/// in the trace only at X and Z. Forward-walk the static CFG from every
/// covered block along edges whose source has exactly one successor of a
/// deterministic kind, adding each block found, and stop when:
/// - the successor is already covered (its own expansion owns the downstream),
/// - the current block has more than one successor (the trace must have
///   recorded the actual destination),
/// - no outgoing deterministic edge exists.
///
/// CFGs may contain back-edges; the per-start visited set guarantees
/// termination.
pub fn expand_sample(master: &MasterDb, cov: &CovDb, sample: Sample) -> DbResult<ExpansionStats> {
    let table = sample.joined_table();
    let mut stats = ExpansionStats::default();

    for binary_id in cov.joined_binaries(table)? {
        let covered: HashSet<i64> = cov.joined_block_rvas(table, binary_id)?.into_iter().collect();

        let mut cfg: HashMap<i64, Vec<(i64, CfgEdgeKind)>> = HashMap::new();
        for (src, dst, kind) in master.cfg_edges(binary_id)? {
            cfg.entry(src).or_default().push((dst, kind));
        }

        // BTreeSet so insertion order below is stable across runs.
        let mut discovered: BTreeSet<i64> = BTreeSet::new();

        for &start in &covered {
            let mut visited: HashSet<i64> = HashSet::new();
            visited.insert(start);
            let mut queue: VecDeque<i64> = VecDeque::new();
            queue.push_back(start);

            while let Some(current) = queue.pop_front() {
                let Some(successors) = cfg.get(&current) else { continue };
                if successors.len() != 1 {
                    continue;
                }
                let (dst, kind) = successors[0];
                if !kind.is_deterministic() {
                    continue;
                }
                if !visited.insert(dst) {
                    continue;
                }
                if !covered.contains(&dst) {
                    discovered.insert(dst);
                    queue.push_back(dst);
                }
            }
        }

        for bb_rva in discovered {
            // Successors referenced by cfg_edges but absent from basic_blocks
            // are master-store corruption; skip the row.
            if let Some(block) = master.block_exact(binary_id, bb_rva)? {
                cov.insert_joined_block(table, binary_id, block.func_id, block.bb_rva)?;
                stats.added += 1;
            }
        }
    }

    Ok(stats)
}
