//! Core data model for the attribution pipeline.
//!
//! The tracer and the static analyzer assign independent integer identifiers
//! to the same binaries. Those two ID spaces are kept typed-distinct here
//! ([`ModuleId`] for the coverage side, [`BinaryId`] for the analysis side) so
//! they cannot be substituted for one another by accident; the module-binary
//! mapping stage is the only place that converts between them.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Synthetic RVA of the per-binary super-root node in the executed graph.
/// Super-root rows also carry `-1` as their function id.
pub const SUPER_ROOT_RVA: i64 = -1;

/// Identifier assigned by the tracer to a loaded module (coverage store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub i64);

/// Identifier assigned by the static analyzer to a binary (master store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinaryId(pub i64);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for BinaryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for ModuleId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for ModuleId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(ModuleId)
    }
}

impl ToSql for BinaryId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for BinaryId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(BinaryId)
    }
}

/// Which coverage sample a table or operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    A,
    B,
}

impl Sample {
    pub fn as_str(self) -> &'static str {
        match self {
            Sample::A => "A",
            Sample::B => "B",
        }
    }

    /// Default raw blocks table name for this sample.
    pub fn blocks_table(self) -> &'static str {
        match self {
            Sample::A => "cov_A_blocks",
            Sample::B => "cov_B_blocks",
        }
    }

    /// Default raw edges table name for this sample.
    pub fn edges_table(self) -> &'static str {
        match self {
            Sample::A => "cov_A_edges",
            Sample::B => "cov_B_edges",
        }
    }

    /// Joined (block-resolved) coverage table name for this sample.
    pub fn joined_table(self) -> &'static str {
        match self {
            Sample::A => "cov_A_blocks_joined",
            Sample::B => "cov_B_blocks_joined",
        }
    }
}

/// Kind of a static CFG edge as recorded by the analysis producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgEdgeKind {
    Fallthrough,
    BranchUnconditional,
    BranchConditional,
    /// Any kind this pipeline does not treat specially (indirect jumps, etc.).
    Other,
}

impl CfgEdgeKind {
    pub fn from_str(kind: &str) -> Self {
        match kind {
            "fallthrough" => CfgEdgeKind::Fallthrough,
            "branch_unconditional" => CfgEdgeKind::BranchUnconditional,
            "branch_conditional" => CfgEdgeKind::BranchConditional,
            _ => CfgEdgeKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CfgEdgeKind::Fallthrough => "fallthrough",
            CfgEdgeKind::BranchUnconditional => "branch_unconditional",
            CfgEdgeKind::BranchConditional => "branch_conditional",
            CfgEdgeKind::Other => "other",
        }
    }

    /// Deterministic edges are the ones the tracer never records: execution
    /// cannot go anywhere else from their source.
    pub fn is_deterministic(self) -> bool {
        matches!(self, CfgEdgeKind::Fallthrough | CfgEdgeKind::BranchUnconditional)
    }
}

/// Typed edge in the executed graph G_B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphEdgeType {
    CfgFallthrough,
    CfgBranchUnconditional,
    CallDirect,
    ObservedConditional,
    ObservedReturnContinuation,
    SuperRoot,
    SuperRootOrphan,
}

impl GraphEdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphEdgeType::CfgFallthrough => "cfg_fallthrough",
            GraphEdgeType::CfgBranchUnconditional => "cfg_branch_unconditional",
            GraphEdgeType::CallDirect => "call_direct",
            GraphEdgeType::ObservedConditional => "observed_conditional",
            GraphEdgeType::ObservedReturnContinuation => "observed_return_continuation",
            GraphEdgeType::SuperRoot => "super_root",
            GraphEdgeType::SuperRootOrphan => "super_root_orphan",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let ty = match s {
            "cfg_fallthrough" => GraphEdgeType::CfgFallthrough,
            "cfg_branch_unconditional" => GraphEdgeType::CfgBranchUnconditional,
            "call_direct" => GraphEdgeType::CallDirect,
            "observed_conditional" => GraphEdgeType::ObservedConditional,
            "observed_return_continuation" => GraphEdgeType::ObservedReturnContinuation,
            "super_root" => GraphEdgeType::SuperRoot,
            "super_root_orphan" => GraphEdgeType::SuperRootOrphan,
            _ => return None,
        };
        Some(ty)
    }
}

/// Classification of a frontier target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierType {
    /// Every incoming non-super-root edge comes from an A-covered block and
    /// none comes from a new block: a clean branch point A reached but never
    /// took into new territory.
    Strong,
    /// At least one incoming edge from a new block, or entered only via the
    /// orphan path (indirect call / callback static analysis cannot see).
    Weak,
}

impl FrontierType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrontierType::Strong => "strong",
            FrontierType::Weak => "weak",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "strong" => Some(FrontierType::Strong),
            "weak" => Some(FrontierType::Weak),
            _ => None,
        }
    }
}

/// UI-facing status of a covered block, derived from the diff flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// In B but not in A (new coverage).
    New,
    /// In A but not in B (lost coverage).
    InA,
    /// In both samples (maintained coverage).
    InBoth,
    /// Should not occur for rows produced by the pipeline.
    Neither,
}

impl BlockStatus {
    pub fn from_flags(in_a: bool, in_b: bool) -> Self {
        match (in_a, in_b) {
            (false, true) => BlockStatus::New,
            (true, false) => BlockStatus::InA,
            (true, true) => BlockStatus::InBoth,
            (false, false) => BlockStatus::Neither,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockStatus::New => "new",
            BlockStatus::InA => "in_A",
            BlockStatus::InBoth => "in_both",
            BlockStatus::Neither => "neither",
        }
    }
}

/// UI-facing status of a function, derived from its blocks' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionStatus {
    /// All covered blocks are new.
    New,
    /// Mix of new and previously covered blocks.
    Changed,
    /// No new blocks.
    Old,
}

impl FunctionStatus {
    /// Status from the set of block statuses within one function.
    pub fn from_blocks<'a>(statuses: impl IntoIterator<Item = &'a BlockStatus>) -> Self {
        let mut has_new = false;
        let mut has_other = false;
        for status in statuses {
            match status {
                BlockStatus::New => has_new = true,
                _ => has_other = true,
            }
        }
        if has_new {
            if has_other {
                FunctionStatus::Changed
            } else {
                FunctionStatus::New
            }
        } else {
            FunctionStatus::Old
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionStatus::New => "new",
            FunctionStatus::Changed => "changed",
            FunctionStatus::Old => "old",
        }
    }
}

/// Result of resolving a raw instruction RVA to its containing basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBlock {
    /// RVA of the containing block's start.
    pub bb_rva: i64,
    /// Function owning the block.
    pub func_id: i64,
}

impl ResolvedBlock {
    /// True when the original RVA was not the block start itself (typically a
    /// return address one instruction past a call).
    pub fn was_mid_block(&self, instruction_rva: i64) -> bool {
        self.bb_rva != instruction_rva
    }
}

/// Diff membership flags for one block, as stored in `bb_labels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLabel {
    pub binary_id: BinaryId,
    pub func_id: i64,
    pub bb_rva: i64,
    pub in_a: bool,
    pub in_b: bool,
    pub is_new: bool,
}

impl BlockLabel {
    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_flags(self.in_a, self.in_b)
    }
}
