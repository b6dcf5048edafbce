use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use covdiff_core::db::CovDb;
use covdiff_core::model::Sample;
use covdiff_core::parser;

use crate::require_file;

/// Parse coverage files A and B into the coverage store.
pub fn parse_coverage_command(
    coverage_a: &str,
    coverage_b: &str,
    modules: &str,
    output: &str,
) -> Result<()> {
    let coverage_a = Path::new(coverage_a);
    let coverage_b = Path::new(coverage_b);
    let modules_path = Path::new(modules);

    require_file(coverage_a, "Coverage file A")?;
    require_file(coverage_b, "Coverage file B")?;
    require_file(modules_path, "Modules JSON file")?;

    println!("Processing coverage files into {}...", output);

    let modules_json = fs::read_to_string(modules_path)
        .with_context(|| format!("Failed to read modules JSON at {}", modules_path.display()))?;
    let modules_map: BTreeMap<String, String> =
        serde_json::from_str(&modules_json).context("Failed to parse modules JSON")?;

    let cov = CovDb::open(Path::new(output))
        .with_context(|| format!("Failed to open coverage store at {}", output))?;

    println!("\nLoading modules...");
    let name_to_id =
        parser::register_modules(&cov, &modules_map).context("Failed to register modules")?;
    println!("Loaded {} modules from {}", name_to_id.len(), modules_path.display());

    for (sample, path) in [(Sample::A, coverage_a), (Sample::B, coverage_b)] {
        println!("\nParsing {}...", path.display());
        let stats = parser::import_coverage_file(&cov, sample, path, &name_to_id)
            .with_context(|| format!("Failed to import coverage from {}", path.display()))?;

        println!("Sample {} imported:", sample.as_str());
        println!("  - {} basic blocks", stats.blocks);
        println!("  - {} indirect edges", stats.edges);
        if stats.malformed_lines > 0 {
            println!("  - Warning: {} unparseable line(s) skipped", stats.malformed_lines);
        }
        if !stats.unknown_modules.is_empty() {
            println!("  - Warning: {} unknown module(s) skipped:", stats.unknown_modules.len());
            for name in &stats.unknown_modules {
                println!("      {}", name);
            }
        }
    }

    println!("\nDatabase ready: {}", output);
    Ok(())
}
