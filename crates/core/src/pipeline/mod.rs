//! The eight-stage attribution pipeline.
//!
//! Stages run to completion in order, each reading the persisted outputs of
//! earlier stages:
//!
//! 1. Module mapping: correlate coverage modules with analyzed binaries.
//! 2. Coverage join: resolve raw instruction RVAs to containing blocks.
//! 3. Deterministic expansion: extend coverage along single-successor chains.
//! 4. Diff labeling: per-block `in_A` / `in_B` / `is_new` flags.
//! 5. Executed-graph construction: build G_B.
//! 6. Frontier identification: find and classify A-to-new crossing points.
//! 7. Reachability: BFS from each frontier target over G_B.
//! 8. Attribution and scoring: per-block attribution, function and callsite
//!    rollups.
//!
//! Each stage runs inside one coverage-store transaction committed at stage
//! end. Re-running the pipeline on the same inputs produces identical output:
//! derived tables are cleared up front and every write uses a stable key.

pub mod attribution;
pub mod frontier;
pub mod graph;
pub mod join;
pub mod labels;
pub mod mapping;
pub mod reachability;
pub mod resolver;
pub mod scores;

pub use attribution::*;
pub use frontier::*;
pub use graph::*;
pub use join::*;
pub use labels::*;
pub use mapping::*;
pub use reachability::*;
pub use resolver::*;
pub use scores::*;

use thiserror::Error;

use crate::db::{CovDb, DbError, DbResult, FunctionScoreRow, MasterDb};
use crate::model::{FrontierType, Sample};
use crate::report::MissingReport;

/// Share of unresolved coverage input above which the analyzer should warn
/// the operator that the static analysis and the traced build may not match.
const UNRESOLVED_WARN_SHARE: f64 = 0.10;

/// Error type for pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Underlying store error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Not a single coverage module matched an analyzed binary; nothing
    /// downstream could possibly resolve.
    #[error("No coverage module could be mapped to an analyzed binary")]
    NoModulesMapped,

    /// A configured raw coverage table does not exist.
    #[error("Missing input table `{0}` in coverage store")]
    MissingInputTable(String),

    /// The pipeline's own outputs contradict each other; aborting is the only
    /// safe option.
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),
}

/// Convenience result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Raw coverage table names consumed by the pipeline. Overridable so a store
/// can hold more than one pair of samples.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub blocks_a: String,
    pub blocks_b: String,
    pub edges_a: String,
    pub edges_b: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            blocks_a: Sample::A.blocks_table().to_string(),
            blocks_b: Sample::B.blocks_table().to_string(),
            edges_a: Sample::A.edges_table().to_string(),
            edges_b: Sample::B.edges_table().to_string(),
        }
    }
}

/// Per-stage counters collected over one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub mapped_modules: usize,
    pub unmapped_modules: usize,
    pub join_a: JoinStats,
    pub expansion_a: ExpansionStats,
    pub join_b: JoinStats,
    pub expansion_b: ExpansionStats,
    pub labels: LabelStats,
    pub graph: GraphStats,
    pub frontier: FrontierStats,
    pub reachability: ReachabilityStats,
    pub attribution: AttributionStats,
    pub scores: ScoreStats,
    /// Unresolvable rows, for the missing-blocks JSON.
    pub missing: MissingReport,
    /// Set when more than 10% of coverage input failed to resolve.
    pub high_unresolved_share: bool,
}

/// Run the full pipeline against an opened master and coverage store.
///
/// Fails before any derived write when a configured input table is absent;
/// fails after stage 1 when zero modules mapped.
pub fn run_pipeline(
    master: &MasterDb,
    cov: &CovDb,
    options: &PipelineOptions,
) -> PipelineResult<PipelineReport> {
    for table in [&options.blocks_a, &options.blocks_b, &options.edges_a, &options.edges_b] {
        if !cov.table_exists(table)? {
            return Err(PipelineError::MissingInputTable(table.clone()));
        }
    }

    cov.clear_derived()?;

    // Stage 1: module mapping.
    let tx = cov.begin()?;
    let mapping = map_modules(master, cov)?;
    tx.commit().map_err(DbError::from)?;
    if mapping.mapped.is_empty() {
        return Err(PipelineError::NoModulesMapped);
    }

    let mut resolver = BlockResolver::new();

    // Stages 2+3 for sample A, then B.
    let tx = cov.begin()?;
    let join_a = join_sample(master, cov, &mut resolver, Sample::A, &options.blocks_a, &options.edges_a)?;
    let expansion_a = expand_sample(master, cov, Sample::A)?;
    tx.commit().map_err(DbError::from)?;

    let tx = cov.begin()?;
    let join_b = join_sample(master, cov, &mut resolver, Sample::B, &options.blocks_b, &options.edges_b)?;
    let expansion_b = expand_sample(master, cov, Sample::B)?;
    tx.commit().map_err(DbError::from)?;

    // Stage 4: diff labels.
    let tx = cov.begin()?;
    let labels = compute_diff_labels(cov)?;
    tx.commit().map_err(DbError::from)?;

    // Stage 5: executed graph G_B.
    let tx = cov.begin()?;
    let graph = build_executed_graph(master, cov, &mut resolver, &options.edges_b)?;
    tx.commit().map_err(DbError::from)?;

    // Stage 6: frontier identification.
    let tx = cov.begin()?;
    let frontier = identify_frontier(cov)?;
    tx.commit().map_err(DbError::from)?;

    // Stage 7: reachability.
    let tx = cov.begin()?;
    let reachability = compute_reachability(cov)?;
    tx.commit().map_err(DbError::from)?;

    // Stage 8: attribution and scoring.
    let tx = cov.begin()?;
    let attribution = compute_attribution(cov)?;
    let scores = aggregate_scores(master, cov)?;
    tx.commit().map_err(DbError::from)?;

    let total_inputs = join_a.stats.total_inputs() + join_b.stats.total_inputs();
    let total_unresolved = join_a.stats.unresolved + join_b.stats.unresolved;
    let high_unresolved_share = total_inputs > 0
        && (total_unresolved as f64 / total_inputs as f64) > UNRESOLVED_WARN_SHARE;

    let missing = MissingReport::new(mapping.unmapped.clone(), join_a.missing, join_b.missing);

    Ok(PipelineReport {
        mapped_modules: mapping.mapped.len(),
        unmapped_modules: mapping.unmapped.len(),
        join_a: join_a.stats,
        expansion_a,
        join_b: join_b.stats,
        expansion_b,
        labels,
        graph,
        frontier,
        reachability,
        attribution,
        scores,
        missing,
        high_unresolved_share,
    })
}

/// Post-run summary queried back from the store, for operator-facing output.
#[derive(Debug, Clone)]
pub struct AnalysisSummary {
    pub strong_frontiers: i64,
    pub weak_frontiers: i64,
    pub top_functions: Vec<FunctionScoreRow>,
    pub total_new: i64,
    pub attributed: i64,
    pub unique_attributed: i64,
    pub shared_attributed: i64,
}

impl AnalysisSummary {
    pub fn unattributed(&self) -> i64 {
        self.total_new - self.attributed
    }
}

/// Collect the summary the analyzer prints after a successful run.
pub fn summarize(cov: &CovDb) -> DbResult<AnalysisSummary> {
    let strong_frontiers = cov.count_frontier_targets(FrontierType::Strong)?;
    let weak_frontiers = cov.count_frontier_targets(FrontierType::Weak)?;
    let top_functions = cov.top_function_scores(10)?;
    let (total_new, attributed, unique_attributed, shared_attributed) =
        cov.attribution_totals()?;
    Ok(AnalysisSummary {
        strong_frontiers,
        weak_frontiers,
        top_functions,
        total_new,
        attributed,
        unique_attributed,
        shared_attributed,
    })
}
