use anyhow::Result;
use clap::{Parser, Subcommand};
use covdiff::commands;

/// Coverage-diff attribution CLI.
///
/// The binary is intentionally thin: it parses args, dispatches to command
/// helpers, and lets `covdiff-core` + `commands` own the real work for
/// testability and reuse.
#[derive(Parser, Debug)]
#[command(
    name = "covdiff",
    version,
    about = "Coverage-diff attribution for binary fuzzing campaigns",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse two coverage text files into a coverage store.
    ParseCoverage {
        /// Path to coverage file A (baseline corpus).
        #[arg(short = 'a', long)]
        coverage_a: String,

        /// Path to coverage file B (new corpus).
        #[arg(short = 'b', long)]
        coverage_b: String,

        /// Path to a JSON file mapping module names to SHA-256 hashes.
        #[arg(short = 'm', long)]
        modules: String,

        /// Output coverage store path.
        #[arg(short = 'o', long, default_value = "coverage.db")]
        output: String,
    },

    /// Run the attribution pipeline against a master store and a coverage store.
    Analyze {
        /// Path to the master store (static analysis).
        master_db: String,

        /// Path to the coverage store (samples + derived tables).
        cov_db: String,

        /// Coverage A blocks table name.
        #[arg(long, default_value = "cov_A_blocks")]
        blocks_a: String,

        /// Coverage B blocks table name.
        #[arg(long, default_value = "cov_B_blocks")]
        blocks_b: String,

        /// Coverage A edges table name.
        #[arg(long, default_value = "cov_A_edges")]
        edges_a: String,

        /// Coverage B edges table name.
        #[arg(long, default_value = "cov_B_edges")]
        edges_b: String,

        /// Output file for the missing-blocks report.
        #[arg(long, default_value = "missing_blocks.json")]
        missing_output: String,
    },

    /// Export the visualization JSON document.
    ExportViz {
        /// Path to the master store (static analysis).
        master_db: String,

        /// Path to the coverage store (analysis results).
        cov_db: String,

        /// Output JSON file.
        #[arg(short = 'o', long, default_value = "coverage_viz_data.json")]
        output: String,

        /// Pretty-print the JSON output.
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Hash every file in a directory into a modules JSON map for parse-coverage.
    HashModules {
        /// Directory containing the module files to hash.
        #[arg(long)]
        dir: String,

        /// Output JSON path.
        #[arg(short = 'o', long, default_value = "modules.json")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::ParseCoverage { coverage_a, coverage_b, modules, output } => {
            commands::parse_coverage_command(&coverage_a, &coverage_b, &modules, &output)?
        }
        Command::Analyze {
            master_db,
            cov_db,
            blocks_a,
            blocks_b,
            edges_a,
            edges_b,
            missing_output,
        } => commands::analyze_command(
            &master_db,
            &cov_db,
            blocks_a,
            blocks_b,
            edges_a,
            edges_b,
            &missing_output,
        )?,
        Command::ExportViz { master_db, cov_db, output, pretty } => {
            commands::export_viz_command(&master_db, &cov_db, &output, pretty)?
        }
        Command::HashModules { dir, output } => commands::hash_modules_command(&dir, &output)?,
    }

    Ok(())
}
