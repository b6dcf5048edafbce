//! Stage 4: diff labeling.

use crate::db::{CovDb, DbResult};

/// Counters for the labeling stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelStats {
    /// Blocks covered by B but not by A.
    pub new_blocks: i64,
}

/// Compute per-block membership flags over the union of both joined samples.
///
/// `is_new` holds exactly when `in_B = 1` and `in_A = 0`.
pub fn compute_diff_labels(cov: &CovDb) -> DbResult<LabelStats> {
    cov.compute_labels()?;
    Ok(LabelStats { new_blocks: cov.count_new_blocks()? })
}
