use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::db::{
    BlockAttributionRow, DbResult, FrontierAttributionRow, FrontierTargetRow, FunctionScoreRow,
    GraphEdgeRow, ModuleBinaryPair, ModuleRecord,
};
use crate::model::{
    BinaryId, BlockLabel, FrontierType, GraphEdgeType, ModuleId, ResolvedBlock, SUPER_ROOT_RVA,
};

/// SQLite-backed coverage store.
///
/// Holds the raw coverage samples imported by the parser plus every table the
/// attribution pipeline derives from them. This is a thin wrapper around
/// `rusqlite::Connection` responsible for:
/// - Opening/creating the store file and ensuring the schema exists.
/// - Applying the batch pragmas (WAL, relaxed fsync, in-memory temp).
/// - Providing small, testable helpers for the pipeline stages.
#[derive(Debug)]
pub struct CovDb {
    conn: Connection,
}

impl CovDb {
    /// Open (or create) a coverage store at the given path and ensure the
    /// schema exists.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Expose a reference to the underlying connection for advanced callers.
    /// For most code, prefer higher-level helpers.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction spanning one pipeline stage.
    ///
    /// Stages write through `&CovDb` helpers while the transaction is open and
    /// commit once at stage end to amortize fsync cost.
    pub fn begin(&self) -> DbResult<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Does a table with this name exist in the store?
    pub fn table_exists(&self, table: &str) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete every derived table's contents so the pipeline can re-run from
    /// the raw coverage. Raw samples and run history are kept.
    pub fn clear_derived(&self) -> DbResult<()> {
        self.conn.execute_batch(
            r#"
            BEGIN;
            DELETE FROM module_binary_map;
            DELETE FROM rva_to_bb_cache;
            DELETE FROM cov_A_blocks_joined;
            DELETE FROM cov_B_blocks_joined;
            DELETE FROM bb_labels;
            DELETE FROM graph_B_nodes;
            DELETE FROM graph_B_edges;
            DELETE FROM frontier_edges;
            DELETE FROM frontier_targets;
            DELETE FROM frontier_reachability;
            DELETE FROM frontier_attribution;
            DELETE FROM bb_attributed_to;
            DELETE FROM function_unlock_scores;
            DELETE FROM callsite_unlock_scores;
            COMMIT;
            "#,
        )?;
        Ok(())
    }

    // ---- modules and raw coverage -------------------------------------------------------------

    /// Register a module (tracer side) and return its id. Re-registering an
    /// existing name returns the existing id.
    pub fn insert_module(&self, name: &str, sha256_hash: &str) -> DbResult<ModuleId> {
        self.conn.execute(
            "INSERT OR IGNORE INTO modules (name, sha256_hash) VALUES (?1, ?2)",
            params![name, sha256_hash],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM modules WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// List all modules (ordered by id).
    pub fn list_modules(&self) -> DbResult<Vec<ModuleRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, sha256_hash
            FROM modules
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ModuleRecord { id: row.get(0)?, name: row.get(1)?, sha256_hash: row.get(2)? })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert one raw block hit into the given sample table.
    pub fn insert_raw_block(&self, table: &str, module_id: ModuleId, bb_rva: i64) -> DbResult<()> {
        let sql = format!("INSERT OR IGNORE INTO {table} (module_id, bb_rva) VALUES (?1, ?2)");
        self.conn.execute(&sql, params![module_id, bb_rva])?;
        Ok(())
    }

    /// Insert one raw observed edge into the given sample table.
    pub fn insert_raw_edge(
        &self,
        table: &str,
        module_id: ModuleId,
        src_bb_rva: i64,
        dst_bb_rva: i64,
    ) -> DbResult<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {table} (module_id, src_bb_rva, dst_bb_rva) VALUES (?1, ?2, ?3)"
        );
        self.conn.execute(&sql, params![module_id, src_bb_rva, dst_bb_rva])?;
        Ok(())
    }

    /// All `(module_id, bb_rva)` rows of a raw blocks table.
    pub fn raw_blocks(&self, table: &str) -> DbResult<Vec<(ModuleId, i64)>> {
        let sql = format!("SELECT module_id, bb_rva FROM {table}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All `(module_id, src, dst)` rows of a raw edges table.
    pub fn raw_edges(&self, table: &str) -> DbResult<Vec<(ModuleId, i64, i64)>> {
        let sql = format!("SELECT module_id, src_bb_rva, dst_bb_rva FROM {table}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- module-binary reconciliation ---------------------------------------------------------

    /// Record one module-binary pairing.
    pub fn insert_module_binary_pair(&self, pair: &ModuleBinaryPair) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO module_binary_map
                (module_id, binary_id, module_name, binary_name, sha256_hash)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                pair.module_id,
                pair.binary_id,
                pair.module_name,
                pair.binary_name,
                pair.sha256_hash
            ],
        )?;
        Ok(())
    }

    /// Analysis-side binary id for a coverage-side module id, if mapped.
    pub fn binary_for_module(&self, module_id: ModuleId) -> DbResult<Option<BinaryId>> {
        let row = self
            .conn
            .query_row(
                "SELECT binary_id FROM module_binary_map WHERE module_id = ?1",
                params![module_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Module id and name paired with a binary, if any.
    pub fn module_for_binary(&self, binary_id: BinaryId) -> DbResult<Option<(ModuleId, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT module_id, module_name FROM module_binary_map WHERE binary_id = ?1",
                params![binary_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    // ---- RVA resolution cache -----------------------------------------------------------------

    /// Previously memoized resolution for `(binary_id, instruction_rva)`.
    pub fn cached_resolution(
        &self,
        binary_id: BinaryId,
        instruction_rva: i64,
    ) -> DbResult<Option<ResolvedBlock>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT bb_rva, func_id
                FROM rva_to_bb_cache
                WHERE binary_id = ?1 AND instruction_rva = ?2
                "#,
                params![binary_id, instruction_rva],
                |row| Ok(ResolvedBlock { bb_rva: row.get(0)?, func_id: row.get(1)? }),
            )
            .optional()?;
        Ok(row)
    }

    /// Memoize a successful resolution.
    pub fn cache_resolution(
        &self,
        binary_id: BinaryId,
        instruction_rva: i64,
        resolved: ResolvedBlock,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO rva_to_bb_cache
                (binary_id, instruction_rva, bb_rva, func_id)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![binary_id, instruction_rva, resolved.bb_rva, resolved.func_id],
        )?;
        Ok(())
    }

    // ---- joined coverage ----------------------------------------------------------------------

    /// Insert one resolved block into a sample's joined table.
    pub fn insert_joined_block(
        &self,
        table: &str,
        binary_id: BinaryId,
        func_id: i64,
        bb_rva: i64,
    ) -> DbResult<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {table} (binary_id, func_id, bb_rva) VALUES (?1, ?2, ?3)"
        );
        self.conn.execute(&sql, params![binary_id, func_id, bb_rva])?;
        Ok(())
    }

    /// Distinct binaries present in a joined table.
    pub fn joined_binaries(&self, table: &str) -> DbResult<Vec<BinaryId>> {
        let sql = format!("SELECT DISTINCT binary_id FROM {table} ORDER BY binary_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Block RVAs of one binary in a joined table.
    pub fn joined_block_rvas(&self, table: &str, binary_id: BinaryId) -> DbResult<Vec<i64>> {
        let sql = format!("SELECT bb_rva FROM {table} WHERE binary_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![binary_id], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- diff labels --------------------------------------------------------------------------

    /// Compute `bb_labels` from the two joined tables. `is_new` is defined as
    /// `in_B AND NOT in_A`.
    pub fn compute_labels(&self) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO bb_labels (binary_id, func_id, bb_rva, in_A, in_B, is_new)
            SELECT
                binary_id,
                func_id,
                bb_rva,
                MAX(in_A) AS in_A,
                MAX(in_B) AS in_B,
                CASE WHEN MAX(in_B) = 1 AND MAX(in_A) = 0 THEN 1 ELSE 0 END AS is_new
            FROM (
                SELECT binary_id, func_id, bb_rva, 1 AS in_A, 0 AS in_B
                FROM cov_A_blocks_joined
                UNION ALL
                SELECT binary_id, func_id, bb_rva, 0 AS in_A, 1 AS in_B
                FROM cov_B_blocks_joined
            )
            GROUP BY binary_id, bb_rva
            "#,
            [],
        )?;
        Ok(())
    }

    /// Distinct binaries present in `bb_labels`.
    pub fn label_binaries(&self) -> DbResult<Vec<BinaryId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT binary_id FROM bb_labels ORDER BY binary_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All label rows of one binary, ordered by block RVA.
    pub fn labels_for_binary(&self, binary_id: BinaryId) -> DbResult<Vec<BlockLabel>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT binary_id, func_id, bb_rva, in_A, in_B, is_new
            FROM bb_labels
            WHERE binary_id = ?1
            ORDER BY bb_rva
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| {
            Ok(BlockLabel {
                binary_id: row.get(0)?,
                func_id: row.get(1)?,
                bb_rva: row.get(2)?,
                in_a: row.get::<_, i64>(3)? != 0,
                in_b: row.get::<_, i64>(4)? != 0,
                is_new: row.get::<_, i64>(5)? != 0,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `(bb_rva, func_id)` of every new block in one binary.
    pub fn new_blocks_for_binary(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT bb_rva, func_id FROM bb_labels WHERE binary_id = ?1 AND is_new = 1",
        )?;
        let rows = stmt.query_map(params![binary_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count of label rows with `is_new = 1`.
    pub fn count_new_blocks(&self) -> DbResult<i64> {
        let count =
            self.conn
                .query_row("SELECT COUNT(*) FROM bb_labels WHERE is_new = 1", [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }

    // ---- executed graph G_B -------------------------------------------------------------------

    /// Insert G_B nodes: every B-covered block, then one super-root per
    /// binary appearing in the labels.
    pub fn insert_graph_nodes(&self) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO graph_B_nodes (binary_id, bb_rva, func_id, is_new, in_A)
            SELECT binary_id, bb_rva, func_id, is_new, in_A
            FROM bb_labels
            WHERE in_B = 1
            "#,
            [],
        )?;
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO graph_B_nodes (binary_id, bb_rva, func_id, is_new, in_A)
            SELECT DISTINCT binary_id, -1, -1, 0, 1
            FROM bb_labels
            "#,
            [],
        )?;
        Ok(())
    }

    /// Seed `super_root` edges to every A-covered block.
    pub fn insert_super_root_edges(&self) -> DbResult<usize> {
        let added = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO graph_B_edges (binary_id, src_bb_rva, dst_bb_rva, edge_type)
            SELECT binary_id, -1, bb_rva, 'super_root'
            FROM bb_labels
            WHERE in_A = 1
            "#,
            [],
        )?;
        Ok(added)
    }

    /// All non-super-root node keys of G_B.
    pub fn graph_node_keys(&self) -> DbResult<Vec<(BinaryId, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT binary_id, bb_rva FROM graph_B_nodes WHERE bb_rva != ?1")?;
        let rows = stmt.query_map(params![SUPER_ROOT_RVA], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert one typed edge of G_B.
    pub fn insert_graph_edge(
        &self,
        binary_id: BinaryId,
        src_bb_rva: i64,
        dst_bb_rva: i64,
        edge_type: GraphEdgeType,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO graph_B_edges (binary_id, src_bb_rva, dst_bb_rva, edge_type)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![binary_id, src_bb_rva, dst_bb_rva, edge_type.as_str()],
        )?;
        Ok(())
    }

    /// Add `super_root_orphan` edges for new blocks with no incoming
    /// non-super-root edge. Returns how many were added.
    pub fn insert_orphan_edges(&self) -> DbResult<usize> {
        let added = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO graph_B_edges (binary_id, src_bb_rva, dst_bb_rva, edge_type)
            SELECT DISTINCT bb.binary_id, -1, bb.bb_rva, 'super_root_orphan'
            FROM bb_labels bb
            WHERE bb.is_new = 1
              AND bb.bb_rva NOT IN (
                  SELECT DISTINCT dst_bb_rva
                  FROM graph_B_edges e
                  WHERE e.binary_id = bb.binary_id
                    AND e.edge_type != 'super_root'
                    AND e.edge_type != 'super_root_orphan'
              )
            "#,
            [],
        )?;
        Ok(added)
    }

    /// Distinct binaries present in `graph_B_nodes`.
    pub fn graph_binaries(&self) -> DbResult<Vec<BinaryId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT binary_id FROM graph_B_nodes ORDER BY binary_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `(src, dst)` pairs of every G_B edge of one binary (all types).
    pub fn graph_edge_pairs(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT src_bb_rva, dst_bb_rva FROM graph_B_edges WHERE binary_id = ?1",
        )?;
        let rows = stmt.query_map(params![binary_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Typed G_B edges of one binary with both endpoints real (no super-root
    /// sentinel), ordered for stable export.
    pub fn graph_edges_for_export(&self, binary_id: BinaryId) -> DbResult<Vec<GraphEdgeRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT src_bb_rva, dst_bb_rva, edge_type
            FROM graph_B_edges
            WHERE binary_id = ?1 AND src_bb_rva != ?2 AND dst_bb_rva != ?2
            ORDER BY src_bb_rva, dst_bb_rva, edge_type
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id, SUPER_ROOT_RVA], |row| {
            Ok(GraphEdgeRow {
                src_bb_rva: row.get(0)?,
                dst_bb_rva: row.get(1)?,
                edge_type: row.get(2)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count G_B edges of one type.
    pub fn count_graph_edges_of_type(&self, edge_type: GraphEdgeType) -> DbResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM graph_B_edges WHERE edge_type = ?1",
            params![edge_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total node and edge counts of G_B.
    pub fn graph_totals(&self) -> DbResult<(i64, i64)> {
        let nodes =
            self.conn.query_row("SELECT COUNT(*) FROM graph_B_nodes", [], |row| row.get(0))?;
        let edges =
            self.conn.query_row("SELECT COUNT(*) FROM graph_B_edges", [], |row| row.get(0))?;
        Ok((nodes, edges))
    }

    // ---- frontier -----------------------------------------------------------------------------

    /// Insert frontier edges: every non-super-root G_B edge from an A-covered
    /// source to a new destination, plus every orphan edge.
    pub fn insert_frontier_edges(&self) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO frontier_edges (binary_id, src_bb_rva, dst_bb_rva, edge_type)
            SELECT e.binary_id, e.src_bb_rva, e.dst_bb_rva, e.edge_type
            FROM graph_B_edges e
            JOIN bb_labels lbl_src
              ON e.binary_id = lbl_src.binary_id AND e.src_bb_rva = lbl_src.bb_rva
            JOIN bb_labels lbl_dst
              ON e.binary_id = lbl_dst.binary_id AND e.dst_bb_rva = lbl_dst.bb_rva
            WHERE lbl_src.in_A = 1 AND lbl_dst.is_new = 1
              AND e.edge_type != 'super_root'
            "#,
            [],
        )?;
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO frontier_edges (binary_id, src_bb_rva, dst_bb_rva, edge_type)
            SELECT binary_id, src_bb_rva, dst_bb_rva, edge_type
            FROM graph_B_edges
            WHERE edge_type = 'super_root_orphan'
            "#,
            [],
        )?;
        Ok(())
    }

    /// Distinct frontier-target candidates as `(binary_id, bb_rva, func_id)`.
    pub fn frontier_candidates(&self) -> DbResult<Vec<(BinaryId, i64, i64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT e.binary_id, e.dst_bb_rva, lbl.func_id
            FROM frontier_edges e
            JOIN bb_labels lbl
              ON e.binary_id = lbl.binary_id AND e.dst_bb_rva = lbl.bb_rva
            ORDER BY e.binary_id, e.dst_bb_rva
            "#,
        )?;
        let rows =
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// True iff this block is entered via an orphan super-root edge.
    pub fn is_orphan_entered(&self, binary_id: BinaryId, bb_rva: i64) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM graph_B_edges
            WHERE binary_id = ?1 AND dst_bb_rva = ?2
              AND edge_type = 'super_root_orphan'
            "#,
            params![binary_id, bb_rva],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Diff flags `(in_A, is_new)` of every non-super-root predecessor of a
    /// block in G_B.
    pub fn incoming_source_flags(
        &self,
        binary_id: BinaryId,
        bb_rva: i64,
    ) -> DbResult<Vec<(bool, bool)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT lbl.in_A, lbl.is_new
            FROM graph_B_edges e
            JOIN bb_labels lbl
              ON e.binary_id = lbl.binary_id AND e.src_bb_rva = lbl.bb_rva
            WHERE e.binary_id = ?1 AND e.dst_bb_rva = ?2
              AND e.edge_type NOT LIKE 'super_root%'
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id, bb_rva], |row| {
            Ok((row.get::<_, i64>(0)? != 0, row.get::<_, i64>(1)? != 0))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Record one classified frontier target.
    pub fn insert_frontier_target(
        &self,
        binary_id: BinaryId,
        target: &FrontierTargetRow,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO frontier_targets (binary_id, bb_rva, func_id, frontier_type)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![binary_id, target.bb_rva, target.func_id, target.frontier_type.as_str()],
        )?;
        Ok(())
    }

    /// All frontier targets of one binary, ordered by block RVA.
    pub fn frontier_targets_for_binary(
        &self,
        binary_id: BinaryId,
    ) -> DbResult<Vec<FrontierTargetRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT bb_rva, func_id, frontier_type
            FROM frontier_targets
            WHERE binary_id = ?1
            ORDER BY bb_rva
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| {
            let ty: String = row.get(2)?;
            Ok(FrontierTargetRow {
                bb_rva: row.get(0)?,
                func_id: row.get(1)?,
                frontier_type: FrontierType::from_str(&ty).unwrap_or(FrontierType::Weak),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count frontier targets of one classification.
    pub fn count_frontier_targets(&self, frontier_type: FrontierType) -> DbResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM frontier_targets WHERE frontier_type = ?1",
            params![frontier_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Frontier edge endpoint pairs of one binary (for export flagging).
    pub fn frontier_edge_pairs(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT src_bb_rva, dst_bb_rva FROM frontier_edges WHERE binary_id = ?1",
        )?;
        let rows = stmt.query_map(params![binary_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- reachability -------------------------------------------------------------------------

    /// Record that `new_bb_rva` is reachable from frontier `frontier_bb_rva`.
    pub fn insert_reachability(
        &self,
        binary_id: BinaryId,
        frontier_bb_rva: i64,
        new_bb_rva: i64,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO frontier_reachability
                (binary_id, frontier_bb_rva, new_bb_rva)
            VALUES (?1, ?2, ?3)
            "#,
            params![binary_id, frontier_bb_rva, new_bb_rva],
        )?;
        Ok(())
    }

    /// All `(frontier_bb_rva, new_bb_rva)` pairs of one binary.
    pub fn reachability_pairs(&self, binary_id: BinaryId) -> DbResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT frontier_bb_rva, new_bb_rva
            FROM frontier_reachability
            WHERE binary_id = ?1
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- attribution --------------------------------------------------------------------------

    /// Store per-frontier aggregate counts.
    pub fn insert_frontier_attribution(
        &self,
        binary_id: BinaryId,
        row: &FrontierAttributionRow,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO frontier_attribution
                (binary_id, frontier_bb_rva, attributed_new_bb_count,
                 unique_new_bb_count, shared_new_bb_count, attributed_new_func_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                binary_id,
                row.frontier_bb_rva,
                row.attributed_new_bb_count,
                row.unique_new_bb_count,
                row.shared_new_bb_count,
                row.attributed_new_func_count
            ],
        )?;
        Ok(())
    }

    /// Store one new block's attribution outcome.
    pub fn insert_block_attribution(
        &self,
        binary_id: BinaryId,
        row: &BlockAttributionRow,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO bb_attributed_to
                (binary_id, new_bb_rva, frontier_bb_rva, is_shared)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![binary_id, row.new_bb_rva, row.frontier_bb_rva, row.is_shared as i64],
        )?;
        Ok(())
    }

    /// All block attributions of one binary.
    pub fn block_attributions_for_binary(
        &self,
        binary_id: BinaryId,
    ) -> DbResult<Vec<BlockAttributionRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT new_bb_rva, frontier_bb_rva, is_shared
            FROM bb_attributed_to
            WHERE binary_id = ?1
            ORDER BY new_bb_rva
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], |row| {
            Ok(BlockAttributionRow {
                new_bb_rva: row.get(0)?,
                frontier_bb_rva: row.get(1)?,
                is_shared: row.get::<_, i64>(2)? != 0,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- scores -------------------------------------------------------------------------------

    /// Aggregate attribution to the function level. Uses distinct counts so a
    /// new block reached from several frontiers of the same function is
    /// counted once.
    pub fn insert_function_scores(&self) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO function_unlock_scores
            SELECT
                bb.binary_id,
                bb.func_id,
                '' AS func_name,
                COUNT(DISTINCT CASE WHEN ba.is_shared = 0 THEN ba.new_bb_rva END)
                    AS unique_new_bb,
                COUNT(DISTINCT CASE WHEN ba.is_shared = 1 THEN ba.new_bb_rva END)
                    AS shared_new_bb,
                COUNT(DISTINCT fr.new_bb_rva) AS total_new_bb,
                COUNT(DISTINCT fa.frontier_bb_rva) AS frontier_count,
                COUNT(DISTINCT CASE WHEN ft.frontier_type = 'strong'
                      THEN fa.frontier_bb_rva END) AS strong_frontier_count,
                COUNT(DISTINCT CASE WHEN ft.frontier_type = 'weak'
                      THEN fa.frontier_bb_rva END) AS weak_frontier_count
            FROM bb_labels bb
            JOIN frontier_attribution fa
              ON bb.binary_id = fa.binary_id AND bb.bb_rva = fa.frontier_bb_rva
            JOIN frontier_targets ft
              ON fa.binary_id = ft.binary_id AND fa.frontier_bb_rva = ft.bb_rva
            JOIN frontier_reachability fr
              ON fa.binary_id = fr.binary_id AND fa.frontier_bb_rva = fr.frontier_bb_rva
            LEFT JOIN bb_attributed_to ba
              ON fr.binary_id = ba.binary_id AND fr.new_bb_rva = ba.new_bb_rva
            WHERE bb.func_id IS NOT NULL
            GROUP BY bb.binary_id, bb.func_id
            "#,
            [],
        )?;
        Ok(())
    }

    /// Keys of all function score rows (for the name backfill pass).
    pub fn function_score_keys(&self) -> DbResult<Vec<(BinaryId, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT binary_id, func_id FROM function_unlock_scores")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Backfill a function score row's name from the master store.
    pub fn set_function_score_name(
        &self,
        binary_id: BinaryId,
        func_id: i64,
        func_name: &str,
    ) -> DbResult<()> {
        self.conn.execute(
            "UPDATE function_unlock_scores SET func_name = ?1 WHERE binary_id = ?2 AND func_id = ?3",
            params![func_name, binary_id, func_id],
        )?;
        Ok(())
    }

    /// Aggregate attribution to the callsite level: frontier edges grouped by
    /// `(src block, destination function)`.
    pub fn insert_callsite_scores(&self) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO callsite_unlock_scores
            SELECT
                fe.binary_id,
                fe.src_bb_rva,
                bb_src.func_id AS src_func_id,
                NULL AS src_func_name,
                bb_dst.func_id AS dst_func_id,
                NULL AS dst_func_name,
                SUM(fa.unique_new_bb_count) AS unique_new_bb,
                SUM(fa.shared_new_bb_count) AS shared_new_bb,
                SUM(fa.attributed_new_bb_count) AS total_new_bb
            FROM frontier_edges fe
            JOIN frontier_attribution fa
              ON fe.binary_id = fa.binary_id AND fe.dst_bb_rva = fa.frontier_bb_rva
            JOIN bb_labels bb_src
              ON fe.binary_id = bb_src.binary_id AND fe.src_bb_rva = bb_src.bb_rva
            JOIN bb_labels bb_dst
              ON fe.binary_id = bb_dst.binary_id AND fe.dst_bb_rva = bb_dst.bb_rva
            WHERE fe.edge_type NOT LIKE 'super_root%'
            GROUP BY fe.binary_id, fe.src_bb_rva, bb_dst.func_id, bb_src.func_id
            "#,
            [],
        )?;
        Ok(())
    }

    /// Keys of all callsite score rows (for the name backfill pass).
    pub fn callsite_score_keys(&self) -> DbResult<Vec<(BinaryId, i64, Option<i64>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT binary_id, src_func_id, dst_func_id FROM callsite_unlock_scores",
        )?;
        let rows =
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Backfill callsite score rows' function names from the master store.
    pub fn set_callsite_score_names(
        &self,
        binary_id: BinaryId,
        src_func_id: i64,
        dst_func_id: Option<i64>,
        src_func_name: Option<&str>,
        dst_func_name: Option<&str>,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            UPDATE callsite_unlock_scores
            SET src_func_name = ?1, dst_func_name = ?2
            WHERE binary_id = ?3 AND src_func_id = ?4
              AND (dst_func_id IS ?5)
            "#,
            params![src_func_name, dst_func_name, binary_id, src_func_id, dst_func_id],
        )?;
        Ok(())
    }

    /// Function score rows of one binary (for export), ordered by func id.
    pub fn function_scores_for_binary(
        &self,
        binary_id: BinaryId,
    ) -> DbResult<Vec<FunctionScoreRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT binary_id, func_id, func_name, unique_new_bb, shared_new_bb, total_new_bb,
                   frontier_count, strong_frontier_count, weak_frontier_count
            FROM function_unlock_scores
            WHERE binary_id = ?1
            ORDER BY func_id
            "#,
        )?;
        let rows = stmt.query_map(params![binary_id], map_function_score)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Top function score rows across all binaries by total new coverage.
    pub fn top_function_scores(&self, limit: i64) -> DbResult<Vec<FunctionScoreRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT binary_id, func_id, func_name, unique_new_bb, shared_new_bb, total_new_bb,
                   frontier_count, strong_frontier_count, weak_frontier_count
            FROM function_unlock_scores
            ORDER BY total_new_bb DESC, binary_id, func_id
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], map_function_score)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Overall attribution counts: `(total_new, attributed, unique, shared)`.
    pub fn attribution_totals(&self) -> DbResult<(i64, i64, i64, i64)> {
        let total_new = self.count_new_blocks()?;
        let attributed: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM bb_attributed_to", [], |row| row.get(0))?;
        let unique: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bb_attributed_to WHERE is_shared = 0",
            [],
            |row| row.get(0),
        )?;
        let shared: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bb_attributed_to WHERE is_shared = 1",
            [],
            |row| row.get(0),
        )?;
        Ok((total_new, attributed, unique, shared))
    }

    // ---- run history --------------------------------------------------------------------------

    /// Record the start of an analyzer invocation. Returns the run row id.
    pub fn record_run_start(&self, master_path: &str) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO analysis_runs (master_path, status, started_at)
            VALUES (?1, 'running', ?2)
            "#,
            params![master_path, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark a run finished with the given status ("succeeded" or "failed").
    pub fn finish_run(&self, run_id: i64, status: &str) -> DbResult<()> {
        self.conn.execute(
            "UPDATE analysis_runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status, Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }
}

fn map_function_score(row: &rusqlite::Row<'_>) -> rusqlite::Result<FunctionScoreRow> {
    Ok(FunctionScoreRow {
        binary_id: row.get(0)?,
        func_id: row.get(1)?,
        func_name: row.get(2)?,
        unique_new_bb: row.get(3)?,
        shared_new_bb: row.get(4)?,
        total_new_bb: row.get(5)?,
        frontier_count: row.get(6)?,
        strong_frontier_count: row.get(7)?,
        weak_frontier_count: row.get(8)?,
    })
}

/// Batch pragmas: WAL journaling, relaxed fsync, in-memory temp store, and a
/// generous page cache. The pipeline is a single writer doing bulk inserts.
fn apply_pragmas(conn: &Connection) -> DbResult<()> {
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA cache_size=10000;
        PRAGMA temp_store=MEMORY;
        "#,
    )?;
    Ok(())
}

/// Create the raw and derived schema if absent.
///
/// Raw tables mirror what the tracer emits; derived tables are keyed so every
/// pipeline write is idempotent (`INSERT OR IGNORE` / `INSERT OR REPLACE` on
/// stable keys).
fn ensure_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE IF NOT EXISTS modules (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            sha256_hash TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_modules_name ON modules(name);

        CREATE TABLE IF NOT EXISTS cov_A_blocks (
            module_id INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            PRIMARY KEY (module_id, bb_rva),
            FOREIGN KEY (module_id) REFERENCES modules(id)
        );
        CREATE INDEX IF NOT EXISTS idx_cov_A_blocks_module ON cov_A_blocks(module_id);

        CREATE TABLE IF NOT EXISTS cov_B_blocks (
            module_id INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            PRIMARY KEY (module_id, bb_rva),
            FOREIGN KEY (module_id) REFERENCES modules(id)
        );
        CREATE INDEX IF NOT EXISTS idx_cov_B_blocks_module ON cov_B_blocks(module_id);

        CREATE TABLE IF NOT EXISTS cov_A_edges (
            module_id  INTEGER NOT NULL,
            src_bb_rva INTEGER NOT NULL,
            dst_bb_rva INTEGER NOT NULL,
            PRIMARY KEY (module_id, src_bb_rva, dst_bb_rva),
            FOREIGN KEY (module_id) REFERENCES modules(id)
        );
        CREATE INDEX IF NOT EXISTS idx_cov_A_edges_module ON cov_A_edges(module_id);

        CREATE TABLE IF NOT EXISTS cov_B_edges (
            module_id  INTEGER NOT NULL,
            src_bb_rva INTEGER NOT NULL,
            dst_bb_rva INTEGER NOT NULL,
            PRIMARY KEY (module_id, src_bb_rva, dst_bb_rva),
            FOREIGN KEY (module_id) REFERENCES modules(id)
        );
        CREATE INDEX IF NOT EXISTS idx_cov_B_edges_module ON cov_B_edges(module_id);

        CREATE TABLE IF NOT EXISTS module_binary_map (
            module_id   INTEGER PRIMARY KEY,
            binary_id   INTEGER NOT NULL,
            module_name TEXT,
            binary_name TEXT,
            sha256_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS rva_to_bb_cache (
            binary_id       INTEGER NOT NULL,
            instruction_rva INTEGER NOT NULL,
            bb_rva          INTEGER NOT NULL,
            func_id         INTEGER NOT NULL,
            PRIMARY KEY (binary_id, instruction_rva)
        );
        CREATE INDEX IF NOT EXISTS idx_rva_to_bb_binary ON rva_to_bb_cache(binary_id);

        CREATE TABLE IF NOT EXISTS cov_A_blocks_joined (
            binary_id INTEGER NOT NULL,
            func_id   INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            PRIMARY KEY (binary_id, bb_rva)
        );

        CREATE TABLE IF NOT EXISTS cov_B_blocks_joined (
            binary_id INTEGER NOT NULL,
            func_id   INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            PRIMARY KEY (binary_id, bb_rva)
        );

        CREATE TABLE IF NOT EXISTS bb_labels (
            binary_id INTEGER NOT NULL,
            func_id   INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            in_A      INTEGER NOT NULL,
            in_B      INTEGER NOT NULL,
            is_new    INTEGER NOT NULL,
            PRIMARY KEY (binary_id, bb_rva)
        );
        CREATE INDEX IF NOT EXISTS idx_bb_labels_new ON bb_labels(binary_id, is_new);
        CREATE INDEX IF NOT EXISTS idx_bb_labels_binary ON bb_labels(binary_id);

        CREATE TABLE IF NOT EXISTS graph_B_nodes (
            binary_id INTEGER NOT NULL,
            bb_rva    INTEGER NOT NULL,
            func_id   INTEGER,
            is_new    INTEGER NOT NULL,
            in_A      INTEGER NOT NULL,
            PRIMARY KEY (binary_id, bb_rva)
        );

        CREATE TABLE IF NOT EXISTS graph_B_edges (
            binary_id  INTEGER NOT NULL,
            src_bb_rva INTEGER NOT NULL,
            dst_bb_rva INTEGER NOT NULL,
            edge_type  TEXT NOT NULL,
            PRIMARY KEY (binary_id, src_bb_rva, dst_bb_rva, edge_type)
        );
        CREATE INDEX IF NOT EXISTS idx_graph_B_edges_src
            ON graph_B_edges(binary_id, src_bb_rva);
        CREATE INDEX IF NOT EXISTS idx_graph_B_edges_dst
            ON graph_B_edges(binary_id, dst_bb_rva);
        CREATE INDEX IF NOT EXISTS idx_graph_B_edges_binary ON graph_B_edges(binary_id);

        CREATE TABLE IF NOT EXISTS frontier_edges (
            binary_id  INTEGER NOT NULL,
            src_bb_rva INTEGER NOT NULL,
            dst_bb_rva INTEGER NOT NULL,
            edge_type  TEXT NOT NULL,
            PRIMARY KEY (binary_id, src_bb_rva, dst_bb_rva, edge_type)
        );

        CREATE TABLE IF NOT EXISTS frontier_targets (
            binary_id     INTEGER NOT NULL,
            bb_rva        INTEGER NOT NULL,
            func_id       INTEGER NOT NULL,
            frontier_type TEXT NOT NULL,
            PRIMARY KEY (binary_id, bb_rva)
        );

        CREATE TABLE IF NOT EXISTS frontier_reachability (
            binary_id       INTEGER NOT NULL,
            frontier_bb_rva INTEGER NOT NULL,
            new_bb_rva      INTEGER NOT NULL,
            PRIMARY KEY (binary_id, frontier_bb_rva, new_bb_rva)
        );
        CREATE INDEX IF NOT EXISTS idx_frontier_reachability_frontier
            ON frontier_reachability(binary_id, frontier_bb_rva);
        CREATE INDEX IF NOT EXISTS idx_frontier_reachability_new
            ON frontier_reachability(binary_id, new_bb_rva);

        CREATE TABLE IF NOT EXISTS frontier_attribution (
            binary_id                 INTEGER NOT NULL,
            frontier_bb_rva           INTEGER NOT NULL,
            attributed_new_bb_count   INTEGER NOT NULL,
            unique_new_bb_count       INTEGER NOT NULL,
            shared_new_bb_count       INTEGER NOT NULL,
            attributed_new_func_count INTEGER NOT NULL,
            PRIMARY KEY (binary_id, frontier_bb_rva)
        );

        CREATE TABLE IF NOT EXISTS bb_attributed_to (
            binary_id       INTEGER NOT NULL,
            new_bb_rva      INTEGER NOT NULL,
            frontier_bb_rva INTEGER,
            is_shared       INTEGER NOT NULL,
            PRIMARY KEY (binary_id, new_bb_rva)
        );

        CREATE TABLE IF NOT EXISTS function_unlock_scores (
            binary_id             INTEGER NOT NULL,
            func_id               INTEGER NOT NULL,
            func_name             TEXT NOT NULL,
            unique_new_bb         INTEGER NOT NULL,
            shared_new_bb         INTEGER NOT NULL,
            total_new_bb          INTEGER NOT NULL,
            frontier_count        INTEGER NOT NULL,
            strong_frontier_count INTEGER NOT NULL,
            weak_frontier_count   INTEGER NOT NULL,
            PRIMARY KEY (binary_id, func_id)
        );

        CREATE TABLE IF NOT EXISTS callsite_unlock_scores (
            binary_id     INTEGER NOT NULL,
            src_bb_rva    INTEGER NOT NULL,
            src_func_id   INTEGER NOT NULL,
            src_func_name TEXT,
            dst_func_id   INTEGER,
            dst_func_name TEXT,
            unique_new_bb INTEGER NOT NULL,
            shared_new_bb INTEGER NOT NULL,
            total_new_bb  INTEGER NOT NULL,
            PRIMARY KEY (binary_id, src_bb_rva, dst_func_id)
        );

        CREATE TABLE IF NOT EXISTS analysis_runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            master_path TEXT NOT NULL,
            status      TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            finished_at TEXT
        );
        COMMIT;
        "#,
    )?;
    Ok(())
}
