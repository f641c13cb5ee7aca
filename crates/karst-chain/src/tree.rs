//! Nested-set tree encoding.
//!
//! Every block row carries a position tuple `(space, depth, span_left,
//! span_right)`. Within a space, A is an ancestor of B iff A's bracket
//! encloses B's and A is shallower, so any "unique ancestor at depth D"
//! question is a single range predicate. The price is paid here: splicing
//! a new branch in renumbers the span columns with a handful of range
//! updates.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::error;

use karst_core::error::ChainError;

use crate::store::sql_err;

/// Nested-set bracket of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub left: u64,
    pub right: u64,
}

impl Span {
    /// Number of leaf columns covered by the bracket.
    pub fn width(&self) -> u64 {
        self.right - self.left + 1
    }
}

/// Full tree position of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub space: u64,
    pub depth: u64,
    pub span: Span,
}

/// Pure nested-set operations over the `blocks` relation.
pub struct Tree<'conn> {
    conn: &'conn Connection,
}

impl<'conn> Tree<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Load a block's span. A missing row is a store inconsistency.
    pub fn load_span(&self, block_id: u64) -> Result<Span, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT span_left, span_right FROM blocks WHERE block_id = ?1")
            .map_err(sql_err)?;
        let span = stmt
            .query_row(params![block_id], |row| {
                Ok(Span { left: row.get(0)?, right: row.get(1)? })
            })
            .optional()
            .map_err(sql_err)?;
        span.ok_or_else(|| {
            error!(block_id, "span lookup failed");
            ChainError::Inconsistent(format!("no span for block {block_id}"))
        })
    }

    /// Load a block's full position. A missing row is a store inconsistency.
    pub fn load_position(&self, block_id: u64) -> Result<Position, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT space, depth, span_left, span_right FROM blocks WHERE block_id = ?1",
            )
            .map_err(sql_err)?;
        let position = stmt
            .query_row(params![block_id], |row| {
                Ok(Position {
                    space: row.get(0)?,
                    depth: row.get(1)?,
                    span: Span { left: row.get(2)?, right: row.get(3)? },
                })
            })
            .optional()
            .map_err(sql_err)?;
        position.ok_or_else(|| {
            error!(block_id, "position lookup failed");
            ChainError::Inconsistent(format!("no position for block {block_id}"))
        })
    }

    /// Subtree column count of a block.
    ///
    /// An internal node's bracket already spans its columns. A block with a
    /// point bracket needs a descendant probe: one descendant means one
    /// column, none means the block is a true leaf (width 0).
    pub fn block_width(&self, position: &Position) -> Result<u64, ChainError> {
        if position.span.left < position.span.right {
            return Ok(position.span.width());
        }
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM blocks \
                 WHERE space = ?1 AND depth > ?2 \
                   AND span_left >= ?3 AND span_right <= ?4 \
                 LIMIT 1",
            )
            .map_err(sql_err)?;
        let has_descendant = stmt
            .query_row(
                params![
                    position.space,
                    position.depth,
                    position.span.left,
                    position.span.right
                ],
                |_| Ok(()),
            )
            .optional()
            .map_err(sql_err)?
            .is_some();
        Ok(u64::from(has_descendant))
    }

    /// Make room for a `child_width`-column subtree immediately to the
    /// right of `parent_span.right`, widening the brackets of the parent
    /// and its ancestors.
    ///
    /// A parent without descendants donates its own column to the child's
    /// leftmost leaf, so one fewer new column is opened; in particular a
    /// leaf parent gaining a single-column child needs no room at all.
    pub fn reserve(
        &self,
        parent_space: u64,
        parent_width: u64,
        parent_span: Span,
        new_child_depth: u64,
        child_width: u64,
    ) -> Result<(), ChainError> {
        let new_columns = if parent_width == 0 { child_width - 1 } else { child_width };
        if new_columns == 0 {
            return Ok(());
        }

        // Shift everything to the right of the parent's bracket.
        self.conn
            .prepare_cached(
                "UPDATE blocks SET span_right = span_right + ?1 \
                 WHERE space = ?2 AND span_right > ?3",
            )
            .map_err(sql_err)?
            .execute(params![new_columns, parent_space, parent_span.right])
            .map_err(sql_err)?;
        self.conn
            .prepare_cached(
                "UPDATE blocks SET span_left = span_left + ?1 \
                 WHERE space = ?2 AND span_left > ?3",
            )
            .map_err(sql_err)?
            .execute(params![new_columns, parent_space, parent_span.right])
            .map_err(sql_err)?;

        // Expand the right bracket of the parent and the ancestors stacked
        // on its rightmost column.
        self.conn
            .prepare_cached(
                "UPDATE blocks SET span_right = span_right + ?1 \
                 WHERE space = ?2 AND depth < ?3 AND span_right = ?4",
            )
            .map_err(sql_err)?
            .execute(params![
                new_columns,
                parent_space,
                new_child_depth,
                parent_span.right
            ])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Move every row of `old_space` into `new_space`, lifting depths by
    /// `new_depth` and shifting both span endpoints by `new_span_left`.
    /// Afterwards `old_space` contains no rows.
    pub fn splice(
        &self,
        old_space: u64,
        new_space: u64,
        new_depth: u64,
        new_span_left: u64,
    ) -> Result<(), ChainError> {
        self.conn
            .prepare_cached(
                "UPDATE blocks SET \
                     space = ?1, \
                     depth = depth + ?2, \
                     span_left = span_left + ?3, \
                     span_right = span_right + ?3 \
                 WHERE space = ?4",
            )
            .map_err(sql_err)?
            .execute(params![new_space, new_depth, new_span_left, old_space])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Whether the row at `depth - 1` carries exactly the given span, i.e.
    /// the subtree rooted at `(depth, span)` is its parent's only child.
    pub fn parent_matches_span(
        &self,
        space: u64,
        depth: u64,
        span: Span,
    ) -> Result<bool, ChainError> {
        if depth == 0 {
            return Ok(false);
        }
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM blocks \
                 WHERE space = ?1 AND depth = ?2 \
                   AND span_left = ?3 AND span_right = ?4 \
                 LIMIT 1",
            )
            .map_err(sql_err)?;
        let matched = stmt
            .query_row(params![space, depth - 1, span.left, span.right], |_| Ok(()))
            .optional()
            .map_err(sql_err)?
            .is_some();
        Ok(matched)
    }

    /// Remove the subtree rooted at `(depth, span)` and collapse the gap:
    /// span coordinates past `span.right` shift left by `removed_width`.
    ///
    /// The caller determines `removed_width` from the lonely-child probe
    /// ([`parent_matches_span`](Self::parent_matches_span)): the full span
    /// width when the parent keeps other children, one column less when the
    /// parent becomes a leaf and inherits the leftmost column.
    pub fn delete_branch(
        &self,
        space: u64,
        depth: u64,
        span: Span,
        removed_width: u64,
    ) -> Result<(), ChainError> {
        self.conn
            .prepare_cached(
                "DELETE FROM blocks \
                 WHERE space = ?1 AND depth >= ?2 \
                   AND span_left >= ?3 AND span_right <= ?4",
            )
            .map_err(sql_err)?
            .execute(params![space, depth, span.left, span.right])
            .map_err(sql_err)?;

        if removed_width == 0 {
            return Ok(());
        }
        self.conn
            .prepare_cached(
                "UPDATE blocks SET span_left = span_left - ?1 \
                 WHERE space = ?2 AND span_left > ?3",
            )
            .map_err(sql_err)?
            .execute(params![removed_width, space, span.right])
            .map_err(sql_err)?;
        self.conn
            .prepare_cached(
                "UPDATE blocks SET span_right = span_right - ?1 \
                 WHERE space = ?2 AND span_right >= ?3",
            )
            .map_err(sql_err)?
            .execute(params![removed_width, space, span.right])
            .map_err(sql_err)?;
        Ok(())
    }
}
