//! Per-fork cumulative work ledger.
//!
//! One `chains` row per distinct leaf column of space 0, keyed by the
//! leaf's `span_left`. `work` accumulates the difficulty of every `valid`
//! block from genesis down to that leaf, so best-chain selection is a
//! single `MAX(work)` scan. Forks are created by [`ChainLedger::split`]
//! when the organizer reserves new leaf columns, and collapsed by
//! [`ChainLedger::renumber`] when a branch is deleted.

use rusqlite::{params, Connection, OptionalExtension};

use karst_core::compact;
use karst_core::error::ChainError;

use crate::store::sql_err;

/// One row of the `chains` relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainRecord {
    pub chain_id: u64,
    /// Cumulative difficulty of all valid blocks on this fork.
    pub work: u64,
    /// Highest depth of any validated block on this fork.
    pub depth: u64,
}

/// Operations on the `chains` table. Restricted to space 0 by construction:
/// the organizer only invokes the ledger for space-0 parents.
pub struct ChainLedger<'conn> {
    conn: &'conn Connection,
}

impl<'conn> ChainLedger<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Record a fork: `width` new leaf columns opened immediately after
    /// column `parent_left + start - 1`, the parent's old rightmost
    /// column. Chain ids above it shift up, then each new column inherits
    /// a copy of chain `parent_left` (a fork starts with the cumulative
    /// work of the shared prefix).
    ///
    /// `start` is at least 1: a pure chain extension opens no new columns
    /// and never reaches the ledger (`width == 0` is a no-op).
    pub fn split(&self, parent_left: u64, start: u64, width: u64) -> Result<(), ChainError> {
        if width == 0 {
            return Ok(());
        }

        let threshold = parent_left + start.saturating_sub(1);

        // Shift in two steps so the primary key never collides mid-update.
        self.conn
            .prepare_cached(
                "UPDATE chains SET chain_id = -(chain_id + ?1) WHERE chain_id > ?2",
            )
            .map_err(sql_err)?
            .execute(params![width, threshold])
            .map_err(sql_err)?;
        self.conn
            .prepare_cached("UPDATE chains SET chain_id = -chain_id WHERE chain_id < 0")
            .map_err(sql_err)?
            .execute([])
            .map_err(sql_err)?;

        let mut copy = self
            .conn
            .prepare_cached(
                "INSERT INTO chains (chain_id, work, depth) \
                 SELECT chain_id + ?1, work, depth FROM chains WHERE chain_id = ?2",
            )
            .map_err(sql_err)?;
        for sub_chain in start..start + width {
            copy.execute(params![sub_chain, parent_left]).map_err(sql_err)?;
        }
        Ok(())
    }

    /// Add `work` to every chain in the column range and raise their depth
    /// watermark. Invoked when a block covering `[left, right]` validates.
    pub fn credit(&self, left: u64, right: u64, work: u64, depth: u64) -> Result<(), ChainError> {
        self.conn
            .prepare_cached(
                "UPDATE chains SET work = work + ?1, depth = MAX(depth, ?2) \
                 WHERE chain_id >= ?3 AND chain_id <= ?4",
            )
            .map_err(sql_err)?
            .execute(params![work, depth, left, right])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Subtract from chain `column` the summed difficulty of every valid
    /// space-0 block at `depth >= depth_floor` whose bracket encloses the
    /// column. Used while the doomed branch rows still exist.
    pub fn debit(&self, column: u64, depth_floor: u64) -> Result<(), ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT bits_head, bits_body FROM blocks \
                 WHERE space = 0 AND depth >= ?1 \
                   AND span_left <= ?2 AND span_right >= ?2 \
                   AND status = 'valid'",
            )
            .map_err(sql_err)?;
        let mut rows = stmt.query(params![depth_floor, column]).map_err(sql_err)?;
        let mut lost: u64 = 0;
        while let Some(row) = rows.next().map_err(sql_err)? {
            let head: u32 = row.get(0).map_err(sql_err)?;
            let body: u32 = row.get(1).map_err(sql_err)?;
            lost = lost.saturating_add(compact::work(head, body));
        }
        if lost == 0 {
            return Ok(());
        }
        self.conn
            .prepare_cached("UPDATE chains SET work = work - ?1 WHERE chain_id = ?2")
            .map_err(sql_err)?
            .execute(params![lost, column])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Delete the chain rows for columns `[left, right]` and close the gap
    /// by shifting higher chain ids down. A reversed range is a no-op.
    pub fn renumber(&self, left: u64, right: u64) -> Result<(), ChainError> {
        if left > right {
            return Ok(());
        }
        self.conn
            .prepare_cached("DELETE FROM chains WHERE chain_id BETWEEN ?1 AND ?2")
            .map_err(sql_err)?
            .execute(params![left, right])
            .map_err(sql_err)?;
        let offset = right - left + 1;
        self.conn
            .prepare_cached("UPDATE chains SET chain_id = chain_id - ?1 WHERE chain_id > ?2")
            .map_err(sql_err)?
            .execute(params![offset, right])
            .map_err(sql_err)?;
        Ok(())
    }

    /// The fork with the most cumulative work.
    pub fn best(&self) -> Result<Option<ChainRecord>, ChainError> {
        self.conn
            .prepare_cached(
                "SELECT chain_id, work, depth FROM chains ORDER BY work DESC LIMIT 1",
            )
            .map_err(sql_err)?
            .query_row([], |row| {
                Ok(ChainRecord {
                    chain_id: row.get(0)?,
                    work: row.get(1)?,
                    depth: row.get(2)?,
                })
            })
            .optional()
            .map_err(sql_err)
    }

    /// All chain rows ordered by id.
    pub fn rows(&self) -> Result<Vec<ChainRecord>, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT chain_id, work, depth FROM chains ORDER BY chain_id ASC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChainRecord {
                    chain_id: row.get(0)?,
                    work: row.get(1)?,
                    depth: row.get(2)?,
                })
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(store::SCHEMA).unwrap();
        conn
    }

    fn seed_chains(conn: &Connection, rows: &[(u64, u64, u64)]) {
        for (chain_id, work, depth) in rows {
            conn.execute(
                "INSERT INTO chains (chain_id, work, depth) VALUES (?1, ?2, ?3)",
                params![chain_id, work, depth],
            )
            .unwrap();
        }
    }

    fn ids(conn: &Connection) -> Vec<u64> {
        ChainLedger::new(conn)
            .rows()
            .unwrap()
            .iter()
            .map(|r| r.chain_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // split
    // ------------------------------------------------------------------

    #[test]
    fn split_zero_width_is_noop() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 3)]);
        ChainLedger::new(&conn).split(0, 1, 0).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(rows, vec![ChainRecord { chain_id: 0, work: 10, depth: 3 }]);
    }

    #[test]
    fn split_from_leaf_parent_column() {
        // A leaf parent donates its column; the single new fork column
        // starts immediately after it (start = 1).
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 3), (1, 4, 2)]);
        ChainLedger::new(&conn).split(0, 1, 1).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(ids(&conn), vec![0, 1, 2]);
        assert_eq!(rows[1], ChainRecord { chain_id: 1, work: 10, depth: 3 });
        assert_eq!(rows[2], ChainRecord { chain_id: 2, work: 4, depth: 2 });
    }

    #[test]
    fn split_leaf_parent_copies_prefix_work() {
        // Parent is a leaf on column 0 with one descendant column
        // (start = parent_width = 1): one new fork column.
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 3)]);
        ChainLedger::new(&conn).split(0, 1, 1).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(
            rows,
            vec![
                ChainRecord { chain_id: 0, work: 10, depth: 3 },
                ChainRecord { chain_id: 1, work: 10, depth: 3 },
            ]
        );
    }

    #[test]
    fn split_shifts_unrelated_chains_up() {
        // Parent covers columns [0, 1]; chains 2 and 3 belong to other
        // forks and must shift to make room for one new column.
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 5), (1, 8, 5), (2, 7, 4), (3, 6, 4)]);
        ChainLedger::new(&conn).split(0, 2, 1).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(ids(&conn), vec![0, 1, 2, 3, 4]);
        // New chain 2 copies chain 0's work.
        assert_eq!(rows[2], ChainRecord { chain_id: 2, work: 10, depth: 5 });
        // Former chains 2, 3 moved to 3, 4.
        assert_eq!(rows[3], ChainRecord { chain_id: 3, work: 7, depth: 4 });
        assert_eq!(rows[4], ChainRecord { chain_id: 4, work: 6, depth: 4 });
    }

    #[test]
    fn split_multiple_new_columns() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 5), (1, 9, 5)]);
        ChainLedger::new(&conn).split(0, 1, 2).unwrap();
        assert_eq!(ids(&conn), vec![0, 1, 2, 3]);
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(rows[1].work, 10);
        assert_eq!(rows[2].work, 10);
        // The unrelated chain moved from 1 to 3.
        assert_eq!(rows[3].work, 9);
    }

    // ------------------------------------------------------------------
    // credit
    // ------------------------------------------------------------------

    #[test]
    fn credit_updates_range_only() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 2), (1, 10, 2), (2, 10, 2)]);
        ChainLedger::new(&conn).credit(0, 1, 5, 3).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(rows[0], ChainRecord { chain_id: 0, work: 15, depth: 3 });
        assert_eq!(rows[1], ChainRecord { chain_id: 1, work: 15, depth: 3 });
        assert_eq!(rows[2], ChainRecord { chain_id: 2, work: 10, depth: 2 });
    }

    #[test]
    fn credit_keeps_higher_depth_watermark() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 9)]);
        ChainLedger::new(&conn).credit(0, 0, 1, 4).unwrap();
        assert_eq!(ChainLedger::new(&conn).rows().unwrap()[0].depth, 9);
    }

    // ------------------------------------------------------------------
    // debit
    // ------------------------------------------------------------------

    #[test]
    fn debit_subtracts_valid_branch_work() {
        let conn = test_conn();
        // Two valid blocks on column 0 at depths 3 and 4, one orphan at 5.
        for (depth, status) in [(3u64, "valid"), (4, "valid"), (5, "orphan")] {
            conn.execute(
                "INSERT INTO blocks (space, depth, span_left, span_right, prev_block_id, \
                 prev_block_hash, block_hash, version, bits_head, bits_body, nonce, merkle, \
                 when_created, status) \
                 VALUES (0, ?1, 0, 0, NULL, ?2, ?3, 1, 29, 65535, 0, ?2, 0, ?4)",
                params![depth, [0u8; 32].as_slice(), [depth as u8; 32].as_slice(), status],
            )
            .unwrap();
        }
        let per_block = compact::work(29, 65535);
        seed_chains(&conn, &[(0, 10 * per_block, 5)]);

        // Depth floor 4: only the depth-4 valid block is debited.
        ChainLedger::new(&conn).debit(0, 4).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(rows[0].work, 9 * per_block);
    }

    // ------------------------------------------------------------------
    // renumber
    // ------------------------------------------------------------------

    #[test]
    fn renumber_closes_gap() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 1), (1, 9, 1), (2, 8, 1), (3, 7, 1)]);
        ChainLedger::new(&conn).renumber(1, 2).unwrap();
        let rows = ChainLedger::new(&conn).rows().unwrap();
        assert_eq!(ids(&conn), vec![0, 1]);
        assert_eq!(rows[0].work, 10);
        assert_eq!(rows[1].work, 7);
    }

    #[test]
    fn renumber_reversed_range_is_noop() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 1), (1, 9, 1)]);
        ChainLedger::new(&conn).renumber(1, 0).unwrap();
        assert_eq!(ids(&conn), vec![0, 1]);
    }

    // ------------------------------------------------------------------
    // best
    // ------------------------------------------------------------------

    #[test]
    fn best_selects_max_work() {
        let conn = test_conn();
        seed_chains(&conn, &[(0, 10, 4), (1, 30, 3), (2, 20, 5)]);
        let best = ChainLedger::new(&conn).best().unwrap().unwrap();
        assert_eq!(best, ChainRecord { chain_id: 1, work: 30, depth: 3 });
    }

    #[test]
    fn best_empty_is_none() {
        let conn = test_conn();
        assert!(ChainLedger::new(&conn).best().unwrap().is_none());
    }
}
