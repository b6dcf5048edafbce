use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::db::{AnalyzedBinary, DbError, DbResult, FunctionRow};
use crate::model::{BinaryId, CfgEdgeKind, ResolvedBlock};

/// Tables the pipeline requires from the static-analysis producer.
const REQUIRED_TABLES: &[&str] =
    &["analyzed_binaries", "functions", "basic_blocks", "cfg_edges", "call_edges_static"];

/// Read-only view over the master (static analysis) store.
///
/// This is a thin wrapper around `rusqlite::Connection` that is responsible
/// for:
/// - Opening the store read-only and verifying the expected schema exists.
/// - Providing small, testable query helpers for the pipeline stages.
#[derive(Debug)]
pub struct MasterDb {
    conn: Connection,
}

impl MasterDb {
    /// Open an existing master store read-only and verify its schema.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        for table in REQUIRED_TABLES {
            if !table_exists(&conn, table)? {
                return Err(DbError::MissingTable { store: "master", table: table.to_string() });
            }
        }
        Ok(Self { conn })
    }

    /// Create an empty master store with the expected schema.
    ///
    /// The pipeline itself never writes to the master store; this exists for
    /// analysis producers and test fixtures.
    pub fn initialize(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS analyzed_binaries (
                binary_id   INTEGER PRIMARY KEY,
                binary_name TEXT NOT NULL,
                sha256_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS functions (
                binary_id INTEGER NOT NULL,
                func_id   INTEGER NOT NULL,
                func_name TEXT,
                entry_rva INTEGER NOT NULL,
                start_va  INTEGER NOT NULL,
                end_va    INTEGER NOT NULL,
                func_size INTEGER NOT NULL,
                PRIMARY KEY (binary_id, func_id)
            );

            CREATE TABLE IF NOT EXISTS basic_blocks (
                binary_id   INTEGER NOT NULL,
                func_id     INTEGER NOT NULL,
                bb_rva      INTEGER NOT NULL,
                bb_start_va INTEGER NOT NULL,
                bb_end_va   INTEGER NOT NULL,
                PRIMARY KEY (binary_id, bb_rva)
            );
            CREATE INDEX IF NOT EXISTS idx_basic_blocks_func
                ON basic_blocks(binary_id, func_id);

            CREATE TABLE IF NOT EXISTS cfg_edges (
                binary_id  INTEGER NOT NULL,
                src_bb_rva INTEGER NOT NULL,
                dst_bb_rva INTEGER NOT NULL,
                edge_kind  TEXT,
                PRIMARY KEY (binary_id, src_bb_rva, dst_bb_rva)
            );
            CREATE INDEX IF NOT EXISTS idx_cfg_edges_src
                ON cfg_edges(binary_id, src_bb_rva);

            CREATE TABLE IF NOT EXISTS call_edges_static (
                binary_id   INTEGER NOT NULL,
                src_bb_rva  INTEGER NOT NULL,
                dst_func_id INTEGER,
                PRIMARY KEY (binary_id, src_bb_rva, dst_func_id)
            );
            COMMIT;
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Expose a reference to the underlying connection for advanced callers.
    /// For most code, prefer higher-level helpers.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Look up a binary by its content hash.
    pub fn binary_by_hash(&self, sha256_hash: &str) -> DbResult<Option<AnalyzedBinary>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT binary_id, binary_name, sha256_hash
                FROM analyzed_binaries
                WHERE sha256_hash = ?1
                "#,
                params![sha256_hash],
                |row| {
                    Ok(AnalyzedBinary {
                        binary_id: row.get(0)?,
                        binary_name: row.get(1)?,
                        sha256_hash: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Look up a binary by its analysis-side id.
    pub fn binary_info(&self, binary_id: BinaryId) -> DbResult<Option<AnalyzedBinary>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT binary_id, binary_name, sha256_hash
                FROM analyzed_binaries
                WHERE binary_id = ?1
                "#,
                params![binary_id],
                |row| {
                    Ok(AnalyzedBinary {
                        binary_id: row.get(0)?,
                        binary_name: row.get(1)?,
                        sha256_hash: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Exact-match block lookup: is `rva` a block start?
    pub fn block_exact(&self, binary_id: BinaryId, rva: i64) -> DbResult<Option<ResolvedBlock>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT bb_rva, func_id
                FROM basic_blocks
                WHERE binary_id = ?1 AND bb_rva = ?2
                "#,
                params![binary_id, rva],
                |row| Ok(ResolvedBlock { bb_rva: row.get(0)?, func_id: row.get(1)? }),
            )
            .optional()?;
        Ok(row)
    }

    /// Greatest block start at or below `rva`, together with the block's
    /// length. Candidate for containing a mid-block address.
    pub fn block_floor(
        &self,
        binary_id: BinaryId,
        rva: i64,
    ) -> DbResult<Option<(ResolvedBlock, i64)>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT bb_rva, func_id, bb_end_va - bb_start_va AS bb_size
                FROM basic_blocks
                WHERE binary_id = ?1 AND bb_rva <= ?2
                ORDER BY bb_rva DESC
                LIMIT 1
                "#,
                params![binary_id, rva],
                |row| {
                    Ok((ResolvedBlock { bb_rva: row.get(0)?, func_id: row.get(1)? }, row.get(2)?))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Virtual-address span `(bb_start_va, bb_end_va)` of a block.
    pub fn block_span(&self, binary_id: BinaryId, bb_rva: i64) -> DbResult<Option<(i64, i64)>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT bb_start_va, bb_end_va
                FROM basic_blocks
                WHERE binary_id = ?1 AND bb_rva = ?2
                "#,
                params![binary_id, bb_rva],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// All CFG edges of one binary as `(src, dst, kind)`.
    pub fn cfg_edges(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64, CfgEdgeKind)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT src_bb_rva, dst_bb_rva, COALESCE(edge_kind, 'unknown')
            FROM cfg_edges
            WHERE binary_id = ?1
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| {
            let kind: String = row.get(2)?;
            Ok((row.get(0)?, row.get(1)?, CfgEdgeKind::from_str(&kind)))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deterministic CFG edges (fallthrough / unconditional branch) of one
    /// binary.
    pub fn deterministic_cfg_edges(
        &self,
        binary_id: BinaryId,
    ) -> DbResult<Vec<(i64, i64, CfgEdgeKind)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT src_bb_rva, dst_bb_rva, edge_kind
            FROM cfg_edges
            WHERE binary_id = ?1
              AND edge_kind IN ('fallthrough', 'branch_unconditional')
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| {
            let kind: String = row.get(2)?;
            Ok((row.get(0)?, row.get(1)?, CfgEdgeKind::from_str(&kind)))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Resolved direct call sites of one binary as `(src_bb_rva, dst_func_id)`.
    pub fn static_call_edges(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT src_bb_rva, dst_func_id
            FROM call_edges_static
            WHERE binary_id = ?1 AND dst_func_id IS NOT NULL
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Entry-block RVA of a function, if the function row exists.
    pub fn function_entry_rva(&self, binary_id: BinaryId, func_id: i64) -> DbResult<Option<i64>> {
        let row = self
            .conn
            .query_row(
                "SELECT entry_rva FROM functions WHERE binary_id = ?1 AND func_id = ?2",
                params![binary_id, func_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Function name, if present.
    pub fn function_name(&self, binary_id: BinaryId, func_id: i64) -> DbResult<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT func_name FROM functions WHERE binary_id = ?1 AND func_id = ?2",
                params![binary_id, func_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// Full function row for export.
    pub fn function_row(&self, binary_id: BinaryId, func_id: i64) -> DbResult<Option<FunctionRow>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT func_id, func_name, entry_rva, start_va, end_va, func_size
                FROM functions
                WHERE binary_id = ?1 AND func_id = ?2
                "#,
                params![binary_id, func_id],
                |row| {
                    Ok(FunctionRow {
                        func_id: row.get(0)?,
                        func_name: row.get(1)?,
                        entry_rva: row.get(2)?,
                        start_va: row.get(3)?,
                        end_va: row.get(4)?,
                        func_size: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// True iff at least one static direct call targets this function.
    ///
    /// Functions with no direct callers are presumed entered indirectly
    /// (virtual dispatch, callbacks).
    pub fn has_direct_callers(&self, binary_id: BinaryId, func_id: i64) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM call_edges_static WHERE binary_id = ?1 AND dst_func_id = ?2",
            params![binary_id, func_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Does a table with this name exist in the store?
fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
