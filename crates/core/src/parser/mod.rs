//! Raw coverage text parsing and import.
//!
//! Each line of a coverage file is `<module_name>+<hex>`. The 64-bit value
//! packs either a block hit (upper 32 bits zero, block RVA in the lower half)
//! or an indirect edge (source RVA in the upper 32 bits, destination in the
//! lower 32). The split must be preserved exactly; RVAs are 32-bit unsigned
//! offsets from the module's image base.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::db::{CovDb, DbError};
use crate::model::{ModuleId, Sample};

/// Error type for coverage import.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Reading the coverage file failed.
    #[error("Failed to read coverage file: {0}")]
    Io(#[from] std::io::Error),

    /// Writing to the coverage store failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// One decoded coverage record, before module-name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageEntry {
    /// The tracer saw execution at this RVA (a block start or a mid-block
    /// instruction such as a return address).
    BlockHit { bb_rva: u32 },
    /// Observed non-deterministic transition (conditional branch or
    /// return-address edge).
    IndirectEdge { src_rva: u32, dst_rva: u32 },
}

/// Outcome of parsing one line of coverage text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedLine<'a> {
    /// Blank line, skipped silently.
    Blank,
    /// Line did not match `<module>+<hex>`.
    Malformed,
    /// A decoded record for the named module.
    Entry { module: &'a str, entry: CoverageEntry },
}

/// Parse one line of coverage text.
///
/// The module name may itself contain `+`; the value starts after the last
/// `+` and must be pure hex, so splitting at the last `+` is unambiguous.
pub fn parse_line(line: &str) -> ParsedLine<'_> {
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Blank;
    }
    let Some((module, hex)) = line.rsplit_once('+') else {
        return ParsedLine::Malformed;
    };
    if module.is_empty() || hex.is_empty() {
        return ParsedLine::Malformed;
    }
    let Ok(value) = u64::from_str_radix(hex, 16) else {
        return ParsedLine::Malformed;
    };
    ParsedLine::Entry { module, entry: split_packed(value) }
}

/// Split the packed 64-bit coverage value.
///
/// Nonzero upper 32 bits mean an indirect edge `(src = high, dst = low)`;
/// zero upper bits mean a block hit at the low 32 bits.
pub fn split_packed(value: u64) -> CoverageEntry {
    let upper = (value >> 32) as u32;
    let lower = value as u32;
    if upper != 0 {
        CoverageEntry::IndirectEdge { src_rva: upper, dst_rva: lower }
    } else {
        CoverageEntry::BlockHit { bb_rva: lower }
    }
}

/// Counters describing one coverage file import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Block hit rows decoded (pre-dedup).
    pub blocks: usize,
    /// Indirect edge rows decoded (pre-dedup).
    pub edges: usize,
    /// Lines that did not match the grammar.
    pub malformed_lines: usize,
    /// Module names with no entry in the modules map; their rows were
    /// skipped.
    pub unknown_modules: BTreeSet<String>,
}

/// Register the modules-map entries in the coverage store and return the
/// name-to-id mapping the importer needs.
pub fn register_modules(
    cov: &CovDb,
    modules: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ModuleId>, DbError> {
    let mut name_to_id = BTreeMap::new();
    for (name, sha256) in modules {
        let id = cov.insert_module(name, sha256)?;
        name_to_id.insert(name.clone(), id);
    }
    Ok(name_to_id)
}

/// Import one coverage text file into the given sample's raw tables.
///
/// Rows for unknown modules are skipped and their names reported in the
/// returned stats; malformed lines are counted, never fatal.
pub fn import_coverage_file(
    cov: &CovDb,
    sample: Sample,
    path: &Path,
    name_to_id: &BTreeMap<String, ModuleId>,
) -> Result<ImportStats, ParseError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut stats = ImportStats::default();

    let tx = cov.begin()?;
    {
        let conn = cov.connection();
        let mut insert_block = conn
            .prepare(&format!(
                "INSERT OR IGNORE INTO {} (module_id, bb_rva) VALUES (?1, ?2)",
                sample.blocks_table()
            ))
            .map_err(DbError::from)?;
        let mut insert_edge = conn
            .prepare(&format!(
                "INSERT OR IGNORE INTO {} (module_id, src_bb_rva, dst_bb_rva) VALUES (?1, ?2, ?3)",
                sample.edges_table()
            ))
            .map_err(DbError::from)?;

        for line in reader.lines() {
            let line = line?;
            match parse_line(&line) {
                ParsedLine::Blank => {}
                ParsedLine::Malformed => stats.malformed_lines += 1,
                ParsedLine::Entry { module, entry } => {
                    let Some(module_id) = name_to_id.get(module) else {
                        stats.unknown_modules.insert(module.to_string());
                        continue;
                    };
                    match entry {
                        CoverageEntry::BlockHit { bb_rva } => {
                            insert_block
                                .execute(rusqlite::params![module_id, i64::from(bb_rva)])
                                .map_err(DbError::from)?;
                            stats.blocks += 1;
                        }
                        CoverageEntry::IndirectEdge { src_rva, dst_rva } => {
                            insert_edge
                                .execute(rusqlite::params![
                                    module_id,
                                    i64::from(src_rva),
                                    i64::from(dst_rva)
                                ])
                                .map_err(DbError::from)?;
                            stats.edges += 1;
                        }
                    }
                }
            }
        }
    }
    tx.commit().map_err(DbError::from)?;

    Ok(stats)
}
