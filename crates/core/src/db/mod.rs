//! SQLite store integration.
//!
//! Two stores back the pipeline:
//! - The **master store** ([`MasterDb`]): static-analysis data (binaries,
//!   functions, basic blocks, CFG edges, direct call edges). Opened read-only;
//!   this crate never writes to it.
//! - The **coverage store** ([`CovDb`]): raw coverage samples as imported by
//!   the parser, plus every table the pipeline derives from them.

pub mod coverage;
pub mod master;
pub mod models;

pub use coverage::*;
pub use master::*;
pub use models::*;

use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite error.
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A table the pipeline requires is absent from the store.
    #[error("Missing required table `{table}` in {store} store")]
    MissingTable { store: &'static str, table: String },
}

/// Convenience result type for store operations.
pub type DbResult<T> = Result<T, DbError>;
