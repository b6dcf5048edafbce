//! Stage 1: module-to-binary reconciliation.
//!
//! The tracer and the static analyzer assign independent integer identifiers
//! to the same binaries; the content hash is the only reliable correlator.

use crate::db::{CovDb, DbResult, MasterDb, ModuleBinaryPair, UnmappedModule};

/// Result of the reconciliation stage.
#[derive(Debug, Clone, Default)]
pub struct MappingOutcome {
    /// Modules paired with an analyzed binary, persisted in
    /// `module_binary_map`.
    pub mapped: Vec<ModuleBinaryPair>,
    /// Modules whose hash matched nothing; their coverage is dropped from
    /// every downstream stage.
    pub unmapped: Vec<UnmappedModule>,
}

/// Pair every coverage module with its analyzed binary via SHA-256.
pub fn map_modules(master: &MasterDb, cov: &CovDb) -> DbResult<MappingOutcome> {
    let mut outcome = MappingOutcome::default();

    for module in cov.list_modules()? {
        match master.binary_by_hash(&module.sha256_hash)? {
            Some(binary) => {
                let pair = ModuleBinaryPair {
                    module_id: module.id,
                    binary_id: binary.binary_id,
                    module_name: module.name,
                    binary_name: binary.binary_name,
                    sha256_hash: module.sha256_hash,
                };
                cov.insert_module_binary_pair(&pair)?;
                outcome.mapped.push(pair);
            }
            None => {
                outcome.unmapped.push(UnmappedModule {
                    module_id: module.id,
                    name: module.name,
                    sha256: module.sha256_hash,
                });
            }
        }
    }

    Ok(outcome)
}
