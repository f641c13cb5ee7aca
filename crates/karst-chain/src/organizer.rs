//! Orphan re-parenting.
//!
//! The organizer finds orphan roots whose parent hash is now present in
//! the tree and splices each one under its parent: reserve new leaf
//! columns next to the parent, fork the chain ledger when the parent sits
//! in space 0, then lift the whole orphan space into the parent's space.
//!
//! Each re-parent step runs in its own transaction. The parent position
//! is re-read inside every step because earlier splices in the same pass
//! may have moved it; a failed lookup aborts the pass.

use rusqlite::{params, Connection};
use tracing::{debug, error};

use karst_core::error::ChainError;

use crate::ledger::ChainLedger;
use crate::store::{sql_err, Store};
use crate::tree::{Span, Tree};

/// One orphan root and the parent it can be attached to.
struct Reunion {
    child_id: u64,
    child_space: u64,
    parent_id: u64,
}

/// Re-parent every orphan root whose parent hash exists in the tree.
///
/// The orphan query is issued once; the loop tolerates the tree mutating
/// underneath it because each step re-reads the parent's position.
pub fn organize(store: &mut Store) -> Result<(), ChainError> {
    let reunions = find_orphan_roots(store.conn())?;
    for reunion in reunions {
        let tx = store.conn_mut().transaction().map_err(sql_err)?;
        reparent(&tx, &reunion)?;
        tx.commit().map_err(sql_err)?;
    }
    Ok(())
}

fn find_orphan_roots(conn: &Connection) -> Result<Vec<Reunion>, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT block.block_id, block.space, parent.block_id \
             FROM blocks AS block \
             JOIN blocks AS parent ON block.prev_block_hash = parent.block_hash \
             WHERE block.space > 0 AND block.depth = 0",
        )
        .map_err(sql_err)?;
    let reunions = stmt
        .query_map([], |row| {
            Ok(Reunion {
                child_id: row.get(0)?,
                child_space: row.get(1)?,
                parent_id: row.get(2)?,
            })
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(reunions)
}

fn reparent(conn: &Connection, reunion: &Reunion) -> Result<(), ChainError> {
    conn.prepare_cached("UPDATE blocks SET prev_block_id = ?1 WHERE block_id = ?2")
        .map_err(sql_err)?
        .execute(params![reunion.parent_id, reunion.child_id])
        .map_err(sql_err)?;

    let tree = Tree::new(conn);

    // The parent may have moved if an earlier step joined it to another
    // branch; the child's span may have widened the same way.
    let parent = tree.load_position(reunion.parent_id)?;
    let child_span = tree.load_span(reunion.child_id)?;
    if child_span.left != 0 {
        error!(
            block_id = reunion.child_id,
            span_left = child_span.left,
            "orphan root is not left-aligned in its space"
        );
        return Err(ChainError::Inconsistent(format!(
            "orphan root {} has span_left {}",
            reunion.child_id, child_span.left
        )));
    }

    let parent_width = tree.block_width(&parent)?;
    let child_width = child_span.width();
    let new_depth = parent.depth + 1;
    let mut new_span_left = parent.span.right;
    if parent_width > 0 {
        new_span_left += 1;
    }

    tree.reserve(parent.space, parent_width, parent.span, new_depth, child_width)?;
    if parent.space == 0 {
        // A leaf parent donates its own column to the child's first leaf,
        // so that column keeps its chain and one fewer fork is recorded.
        let (start, new_columns) = if parent_width == 0 {
            (1, child_width - 1)
        } else {
            (parent_width, child_width)
        };
        ChainLedger::new(conn).split(parent.span.left, start, new_columns)?;
    }
    tree.splice(reunion.child_space, parent.space, new_depth, new_span_left)?;

    debug!(
        block_id = reunion.child_id,
        parent_id = reunion.parent_id,
        space = parent.space,
        depth = new_depth,
        span_left = new_span_left,
        width = child_width,
        "re-parented orphan branch"
    );
    Ok(())
}

/// Delete the subtree rooted at `(depth, span)` in `space` and keep the
/// chain ledger consistent. Used when a block fails validation.
///
/// If the subtree was its parent's only child, the parent keeps the
/// leftmost column as its own leaf: that chain survives, debited by the
/// work of the deleted valid blocks. Otherwise every covered column and
/// its chain row disappears. Runs in a single transaction.
pub fn purge_branch(
    store: &mut Store,
    space: u64,
    depth: u64,
    span: Span,
) -> Result<(), ChainError> {
    let tx = store.conn_mut().transaction().map_err(sql_err)?;
    {
        let tree = Tree::new(&tx);
        let ledger = ChainLedger::new(&tx);

        let sole_child = tree.parent_matches_span(space, depth, span)?;
        let removed_width = if sole_child {
            if space == 0 {
                ledger.renumber(span.left + 1, span.right)?;
                ledger.debit(span.left, depth)?;
            }
            span.right - span.left
        } else {
            if space == 0 {
                ledger.renumber(span.left, span.right)?;
            }
            span.width()
        };
        tree.delete_branch(space, depth, span, removed_width)?;
    }
    tx.commit().map_err(sql_err)?;
    Ok(())
}
