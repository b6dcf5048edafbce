//! RVA-to-basic-block resolution.
//!
//! Raw coverage RVAs may be block starts or mid-block addresses, most
//! commonly return addresses pointing one instruction past a `call`. The
//! resolver maps either form to the containing block and memoizes the answer:
//! the same RVAs reappear across the blocks and edges tables, and again when
//! the executed graph maps observed edge endpoints.

use std::collections::HashMap;

use crate::db::{CovDb, DbResult, MasterDb};
use crate::model::{BinaryId, ResolvedBlock};

/// Memoizing resolver from `(binary_id, instruction_rva)` to the containing
/// basic block.
///
/// Lookups hit, in order: the in-memory memo, the persisted
/// `rva_to_bb_cache` table, then the master store. Successful master lookups
/// are written through to the cache table; failures are memoized in memory
/// only so a later run against fresh static data can retry them.
#[derive(Debug, Default)]
pub struct BlockResolver {
    memo: HashMap<(BinaryId, i64), Option<ResolvedBlock>>,
}

impl BlockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an instruction RVA to its containing block, or `None` when no
    /// block covers it.
    ///
    /// A block `[bb_rva, bb_rva + len)` accepts `rva` iff
    /// `bb_rva <= rva <= bb_rva + len`; the inclusive upper bound
    /// accommodates one-past-end return addresses.
    pub fn resolve(
        &mut self,
        master: &MasterDb,
        cov: &CovDb,
        binary_id: BinaryId,
        instruction_rva: i64,
    ) -> DbResult<Option<ResolvedBlock>> {
        let key = (binary_id, instruction_rva);
        if let Some(hit) = self.memo.get(&key) {
            return Ok(*hit);
        }

        if let Some(cached) = cov.cached_resolution(binary_id, instruction_rva)? {
            self.memo.insert(key, Some(cached));
            return Ok(Some(cached));
        }

        let resolved = self.resolve_uncached(master, binary_id, instruction_rva)?;
        if let Some(block) = resolved {
            cov.cache_resolution(binary_id, instruction_rva, block)?;
        }
        self.memo.insert(key, resolved);
        Ok(resolved)
    }

    fn resolve_uncached(
        &self,
        master: &MasterDb,
        binary_id: BinaryId,
        instruction_rva: i64,
    ) -> DbResult<Option<ResolvedBlock>> {
        // Exact match first: the RVA is a block start.
        if let Some(block) = master.block_exact(binary_id, instruction_rva)? {
            return Ok(Some(block));
        }

        // Mid-block: greatest block start at or below the RVA, accepted only
        // when the RVA falls within (or one past) the block's span.
        if let Some((block, size)) = master.block_floor(binary_id, instruction_rva)? {
            if instruction_rva <= block.bb_rva + size {
                return Ok(Some(block));
            }
        }

        Ok(None)
    }
}
