use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use covdiff_core::db::{CovDb, MasterDb};
use covdiff_core::export;

use crate::require_file;

/// Export the visualization JSON document from an analyzed coverage store.
pub fn export_viz_command(master_db: &str, cov_db: &str, output: &str, pretty: bool) -> Result<()> {
    let master_path = Path::new(master_db);
    let cov_path = Path::new(cov_db);

    require_file(master_path, "Master DB")?;
    require_file(cov_path, "Coverage DB")?;

    println!("Coverage Visualization Data Export");
    println!("{}", "=".repeat(60));

    let master = MasterDb::open(master_path)
        .with_context(|| format!("Failed to open master store at {}", master_path.display()))?;
    let cov = CovDb::open(cov_path)
        .with_context(|| format!("Failed to open coverage store at {}", cov_path.display()))?;

    let document =
        export::build_document(&master, &cov).context("Failed to build export document")?;

    let json = if pretty {
        serde_json::to_string_pretty(&document)
    } else {
        serde_json::to_string(&document)
    }
    .context("Failed to serialize export document")?;
    fs::write(output, json)
        .with_context(|| format!("Failed to write export document to {}", output))?;

    let total_functions: usize =
        document.modules.iter().map(|m| m.statistics.total_functions).sum();
    let total_blocks: usize = document.modules.iter().map(|m| m.statistics.total_blocks).sum();

    println!("\nExport complete!");
    println!("Output written to: {}", output);
    println!("Total modules: {}", document.modules.len());
    println!("Total functions: {}", total_functions);
    println!("Total blocks: {}", total_blocks);
    Ok(())
}
