//! covdiff-core
//!
//! Core library for coverage-diff attribution over binary fuzzing corpora.
//!
//! Given two coverage samples A (baseline) and B (new input set) over the same
//! set of binaries, this crate joins raw coverage against static-analysis data,
//! reconstructs the executed control-flow graph for sample B, locates the
//! frontier where execution first crosses into territory A never reached, and
//! attributes each newly covered block to the frontier target(s) that unlocked
//! it.
//!
//! The goal is to keep all substantive logic here so it is fully testable and
//! reusable from multiple frontends (CLI, batch jobs, etc.).

pub mod db;
pub mod export;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod report;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
