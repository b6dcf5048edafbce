//! Missing-blocks report.
//!
//! Coverage rows that cannot be carried through the pipeline (module never
//! mapped, RVA absent from static analysis) are non-fatal: they are counted,
//! dropped, and surfaced to the operator through this JSON report.

use serde::Serialize;

use crate::db::UnmappedModule;
use crate::model::{BinaryId, ModuleId};

/// Why a coverage row could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// The row's module has no hash match in the master store.
    ModuleNotMapped,
    /// The module mapped, but no basic block contains this RVA.
    NotFoundInStaticAnalysis,
}

/// One unresolvable coverage row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingBlock {
    pub module_id: ModuleId,
    /// Known only when the module itself mapped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_id: Option<BinaryId>,
    pub instruction_rva: i64,
    pub reason: MissingReason,
}

/// The full report written next to the analyzer's outputs.
#[derive(Debug, Clone, Serialize)]
pub struct MissingReport {
    pub unmapped_modules: Vec<UnmappedModule>,
    #[serde(rename = "sample_A")]
    pub sample_a: Vec<MissingBlock>,
    #[serde(rename = "sample_B")]
    pub sample_b: Vec<MissingBlock>,
    pub total_missing: usize,
}

impl MissingReport {
    pub fn new(
        unmapped_modules: Vec<UnmappedModule>,
        sample_a: Vec<MissingBlock>,
        sample_b: Vec<MissingBlock>,
    ) -> Self {
        let total_missing = sample_a.len() + sample_b.len();
        Self { unmapped_modules, sample_a, sample_b, total_missing }
    }

    /// Serialize the report (pretty-printed, it is meant to be read).
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
