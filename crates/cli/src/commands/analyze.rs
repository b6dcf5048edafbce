use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use covdiff_core::db::{CovDb, MasterDb};
use covdiff_core::pipeline::{
    run_pipeline, summarize, AnalysisSummary, PipelineOptions, PipelineReport,
};

use crate::require_file;

/// Run the full attribution pipeline and print per-stage stats plus the
/// analysis summary.
pub fn analyze_command(
    master_db: &str,
    cov_db: &str,
    blocks_a: String,
    blocks_b: String,
    edges_a: String,
    edges_b: String,
    missing_output: &str,
) -> Result<()> {
    let master_path = Path::new(master_db);
    let cov_path = Path::new(cov_db);

    require_file(master_path, "Master DB")?;
    require_file(cov_path, "Coverage DB")?;

    println!("Coverage Diff Analysis");
    println!("{}", "=".repeat(60));

    let master = MasterDb::open(master_path)
        .with_context(|| format!("Failed to open master store at {}", master_path.display()))?;
    let cov = CovDb::open(cov_path)
        .with_context(|| format!("Failed to open coverage store at {}", cov_path.display()))?;

    let run_id = cov.record_run_start(master_db).context("Failed to record analysis run")?;

    let options = PipelineOptions { blocks_a, blocks_b, edges_a, edges_b };
    let report = match run_pipeline(&master, &cov, &options) {
        Ok(report) => report,
        Err(err) => {
            let _ = cov.finish_run(run_id, "failed");
            return Err(err).context("Analysis pipeline failed");
        }
    };

    let missing_json =
        report.missing.to_json_string().context("Failed to serialize missing-blocks report")?;
    fs::write(missing_output, missing_json)
        .with_context(|| format!("Failed to write missing-blocks report to {}", missing_output))?;

    print_report(&report);
    println!("Wrote missing blocks report to {}", missing_output);

    let summary = summarize(&cov).context("Failed to collect analysis summary")?;
    print_summary(&summary);

    cov.finish_run(run_id, "succeeded").context("Failed to finalize analysis run")?;
    println!("\nAnalysis complete! Results stored in {}", cov_db);
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("\nStep 1: Module mapping");
    println!("  Mapped modules: {}", report.mapped_modules);
    if report.unmapped_modules > 0 {
        println!("  WARNING: {} module(s) could not be mapped", report.unmapped_modules);
        for module in &report.missing.unmapped_modules {
            println!("    {} ({}, {})", module.module_id, module.name, module.sha256);
        }
    }

    for (sample, join, expansion) in [
        ("A", &report.join_a, &report.expansion_a),
        ("B", &report.join_b, &report.expansion_b),
    ] {
        println!("\nStep 2+3: Sample {} join and expansion", sample);
        println!("  Direct blocks: {}", join.input_blocks);
        println!("  Edge sources: {}", join.edge_sources);
        println!("  Edge destinations: {}", join.edge_destinations);
        println!("  Joined unique blocks: {}", join.joined);
        println!("  Return addresses mapped to BBs: {}", join.mid_block_resolved);
        println!("  Missing/unmapped: {}", join.unresolved);
        println!("  Intermediate blocks reconstructed: {}", expansion.added);
    }

    println!("\nStep 4: Diff labels");
    println!("  New blocks in B: {}", report.labels.new_blocks);

    println!("\nStep 5: Executed graph G_B");
    println!("  Nodes: {} / Edges: {}", report.graph.nodes, report.graph.edges);
    println!("  Deterministic CFG edges: {}", report.graph.cfg_edges);
    println!("  Direct call edges: {}", report.graph.call_edges);
    println!("  Observed edges: {}", report.graph.observed_edges);
    println!("  Observed edges skipped: {}", report.graph.observed_skipped);
    println!("  Orphan entries wired to super-root: {}", report.graph.orphan_edges);

    println!("\nStep 6: Frontier");
    println!("  Strong frontier targets: {}", report.frontier.strong);
    println!("  Weak frontier targets: {}", report.frontier.weak);

    println!("\nStep 7: Reachability");
    println!("  Frontier-to-new-block pairs: {}", report.reachability.pairs);

    println!("\nStep 8: Attribution & scores");
    println!("  Attributed blocks: {}", report.attribution.attributed_blocks);
    println!("  Frontiers with attribution: {}", report.attribution.frontiers);
    println!("  Function score rows: {}", report.scores.function_rows);
    println!("  Callsite score rows: {}", report.scores.callsite_rows);

    if report.high_unresolved_share {
        println!(
            "\nWARNING: more than 10% of coverage input failed to resolve; \
             the traced build and the analyzed binaries may not match."
        );
    }
}

fn print_summary(summary: &AnalysisSummary) {
    println!("\n{}", "=".repeat(70));
    println!("ANALYSIS SUMMARY");
    println!("{}", "=".repeat(70));

    println!("\nFrontier Classification:");
    println!("  Strong frontier blocks (reachable only from A): {}", summary.strong_frontiers);
    println!("  Weak frontier blocks (reachable from A or B): {}", summary.weak_frontiers);
    println!("  Total frontier blocks: {}", summary.strong_frontiers + summary.weak_frontiers);

    println!("\nTop 10 Functions by New Coverage Unlocked:");
    println!(
        "{:<6} {:<35} {:<8} {:<8} {:<8} {:<8}",
        "Rank", "Function", "Total", "Unique", "Strong", "Weak"
    );
    println!("{}", "-".repeat(75));
    for (rank, score) in summary.top_functions.iter().enumerate() {
        let name = if score.func_name.is_empty() { "<unknown>" } else { score.func_name.as_str() };
        let display: String = name.chars().take(35).collect();
        println!(
            "{:<6} {:<35} {:<8} {:<8} {:<8} {:<8}",
            rank + 1,
            display,
            score.total_new_bb,
            score.unique_new_bb,
            score.strong_frontier_count,
            score.weak_frontier_count
        );
    }

    println!("\nOverall Statistics:");
    println!("  Total new blocks: {}", summary.total_new);
    println!("  Attributed blocks: {}", summary.attributed);
    println!("  Uniquely attributed: {}", summary.unique_attributed);
    println!("  Shared attribution: {}", summary.shared_attributed);
    println!("  Unattributed: {}", summary.unattributed());
    println!("{}", "=".repeat(70));
}
