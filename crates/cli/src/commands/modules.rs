use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::sha256_file;

/// Hash every regular file in a directory and write the
/// `{module_name: sha256}` JSON map the parser consumes.
pub fn hash_modules_command(dir: &str, output: &str) -> Result<()> {
    let dir = Path::new(dir);
    if !dir.is_dir() {
        bail!("Module directory not found: {}", dir.display());
    }

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read module directory {}", dir.display()))?
        .collect::<Result<_, _>>()
        .with_context(|| format!("Failed to list module directory {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for entry in entries {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let hash = sha256_file(&path)?;
        println!("  {}  {}", hash, name);
        map.insert(name, hash);
    }

    if map.is_empty() {
        bail!("No module files found in {}", dir.display());
    }

    let json = serde_json::to_string_pretty(&map).context("Failed to serialize modules map")?;
    fs::write(output, json).with_context(|| format!("Failed to write modules map to {}", output))?;
    println!("Wrote {} module hash(es) to {}", map.len(), output);
    Ok(())
}
