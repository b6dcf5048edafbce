//! Stage 8b: function and callsite rollups.

use crate::db::{CovDb, DbResult, MasterDb};

/// Counters for the scoring stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreStats {
    pub function_rows: usize,
    pub callsite_rows: usize,
}

/// Aggregate attribution to functions and callsites, then backfill function
/// names from the master store.
pub fn aggregate_scores(master: &MasterDb, cov: &CovDb) -> DbResult<ScoreStats> {
    let mut stats = ScoreStats::default();

    cov.insert_function_scores()?;
    let function_keys = cov.function_score_keys()?;
    for (binary_id, func_id) in &function_keys {
        if let Some(name) = master.function_name(*binary_id, *func_id)? {
            cov.set_function_score_name(*binary_id, *func_id, &name)?;
        }
    }
    stats.function_rows = function_keys.len();

    cov.insert_callsite_scores()?;
    let callsite_keys = cov.callsite_score_keys()?;
    for (binary_id, src_func_id, dst_func_id) in &callsite_keys {
        let src_name = master.function_name(*binary_id, *src_func_id)?;
        let dst_name = match dst_func_id {
            Some(func_id) => master.function_name(*binary_id, *func_id)?,
            None => None,
        };
        cov.set_callsite_score_names(
            *binary_id,
            *src_func_id,
            *dst_func_id,
            src_name.as_deref(),
            dst_name.as_deref(),
        )?;
    }
    stats.callsite_rows = callsite_keys.len();

    Ok(stats)
}
