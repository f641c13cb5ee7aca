//! Block validation against the ancestor chain.
//!
//! The validator walks every `space = 0, status = 'orphan'` block in
//! ascending depth and answers each ancestor-dependent question (previous
//! bits, actual timespan, median time past, coinbase maturity, double
//! spends) with the nested-set range predicate:
//!
//! ```sql
//! space = 0 AND depth = D AND span_left <= block.span_left
//!                         AND span_right >= block.span_right
//! ```
//!
//! which matches at most one row per depth. A validated block is finalized
//! atomically: chain credit plus status flip in one transaction. A
//! rejected block has its branch purged and ends the pass; descendants of
//! a rejected block cannot become valid, and unrelated branches are picked
//! up by the next pass.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use karst_core::compact;
use karst_core::constants::{
    COINBASE_MATURITY, MAX_MONEY, MEDIAN_TIME_SPAN, RETARGET_INTERVAL, TARGET_TIMESPAN_SECS,
};
use karst_core::error::{ChainError, ValidationError};
use karst_core::script::ScriptRunner;
use karst_core::types::{Block, Hash256, Transaction, TxInput};

use crate::ledger::ChainLedger;
use crate::organizer;
use crate::reader::{self, BlockPosition};
use crate::store::{sql_err, Store};
use crate::tree::Span;

/// Validate every pending space-0 block in ascending depth order.
///
/// Consensus rejections are localized: the offending branch is deleted
/// and the pass ends without surfacing an error. Store-level failures
/// abort the pass.
pub fn validate(store: &mut Store, runner: &dyn ScriptRunner) -> Result<(), ChainError> {
    let pending = pending_blocks(store.conn())?;
    for info in pending {
        let block = reader::read_block(store.conn(), info.block_id)?;
        let outcome = BlockValidator::new(store.conn(), runner, &info, &block).validates();
        match outcome {
            Ok(()) => {
                finalize(store, &info, &block)?;
                debug!(block_id = info.block_id, depth = info.depth, "block validated");
            }
            Err(ChainError::Rejected { block_id, reason }) => {
                error!(block_id, %reason, "block failed validation; deleting branch");
                organizer::purge_branch(store, 0, info.depth, info.span)?;
                break;
            }
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

fn pending_blocks(conn: &Connection) -> Result<Vec<BlockPosition>, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT block_id, depth, span_left, span_right, prev_block_id \
             FROM blocks \
             WHERE status = 'orphan' AND space = 0 \
             ORDER BY depth ASC",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map([], |row| {
            let prev_block_id: Option<u64> = row.get(4)?;
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                Span { left: row.get(2)?, right: row.get(3)? },
                prev_block_id,
            ))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;

    rows.into_iter()
        .map(|(block_id, depth, span, prev_block_id)| {
            let prev_block_id = prev_block_id.ok_or_else(|| {
                ChainError::Inconsistent(format!("pending block {block_id} has no parent"))
            })?;
            Ok(BlockPosition { block_id, depth, span, prev_block_id })
        })
        .collect()
}

/// Chain credit and status flip, atomically.
fn finalize(store: &mut Store, info: &BlockPosition, block: &Block) -> Result<(), ChainError> {
    let (head, body) = compact::split(block.header.bits);
    let work = compact::work(head, body);
    let tx = store.conn_mut().transaction().map_err(sql_err)?;
    ChainLedger::new(&tx).credit(info.span.left, info.span.right, work, info.depth)?;
    tx.prepare_cached("UPDATE blocks SET status = 'valid' WHERE block_id = ?1")
        .map_err(sql_err)?
        .execute(params![info.block_id])
        .map_err(sql_err)?;
    tx.commit().map_err(sql_err)
}

/// Consensus checks for one block at a known tree position.
pub struct BlockValidator<'a> {
    conn: &'a Connection,
    runner: &'a dyn ScriptRunner,
    info: &'a BlockPosition,
    block: &'a Block,
}

impl<'a> BlockValidator<'a> {
    pub fn new(
        conn: &'a Connection,
        runner: &'a dyn ScriptRunner,
        info: &'a BlockPosition,
        block: &'a Block,
    ) -> Self {
        Self { conn, runner, info, block }
    }

    /// Run every ancestor-dependent consensus check.
    pub fn validates(&self) -> Result<(), ChainError> {
        self.check_bits()?;
        self.check_timestamp()?;
        for (index_in_block, transaction) in
            self.block.transactions.iter().enumerate().skip(1)
        {
            self.validate_transaction(transaction, index_in_block)?;
        }
        Ok(())
    }

    fn reject(&self, reason: ValidationError) -> ChainError {
        ChainError::Rejected { block_id: self.info.block_id, reason }
    }

    // --- Header checks ---

    fn check_bits(&self) -> Result<(), ChainError> {
        let expected = self.work_required()?;
        if self.block.header.bits != expected {
            return Err(self.reject(ValidationError::BitsMismatch {
                got: self.block.header.bits,
                expected,
            }));
        }
        Ok(())
    }

    /// Expected compact bits at this depth: the parent's bits off retarget
    /// boundaries, otherwise the parent's target scaled by the clamped
    /// actual timespan of the previous interval.
    fn work_required(&self) -> Result<u32, ChainError> {
        let previous = self.previous_block_bits()?;
        if self.info.depth % RETARGET_INTERVAL != 0 {
            return Ok(previous);
        }
        let actual = self.actual_timespan(RETARGET_INTERVAL)?;
        let clamped = actual.clamp(TARGET_TIMESPAN_SECS / 4, TARGET_TIMESPAN_SECS * 4);
        Ok(compact::retarget(previous, clamped, TARGET_TIMESPAN_SECS))
    }

    fn check_timestamp(&self) -> Result<(), ChainError> {
        let median = self.median_time_past()?;
        if self.block.header.timestamp <= median {
            return Err(self.reject(ValidationError::TimestampNotAfterMedian {
                timestamp: self.block.header.timestamp,
                median,
            }));
        }
        Ok(())
    }

    // --- Ancestor-scoped queries ---

    /// Compact bits of the unique ancestor at `depth - 1`.
    fn previous_block_bits(&self) -> Result<u32, ChainError> {
        let parent_depth = self.info.depth.checked_sub(1).ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} at depth 0 reached the validator",
                self.info.block_id
            ))
        })?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT bits_head, bits_body FROM blocks \
                 WHERE space = 0 AND depth = ?1 \
                   AND span_left <= ?2 AND span_right >= ?3",
            )
            .map_err(sql_err)?;
        let bits = stmt
            .query_row(
                params![parent_depth, self.info.span.left, self.info.span.right],
                |row| Ok(compact::join(row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;
        bits.ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} has no ancestor at depth {parent_depth}",
                self.info.block_id
            ))
        })
    }

    /// Seconds elapsed between the ancestors at `depth - interval` and
    /// `depth - 1`.
    fn actual_timespan(&self, interval: u64) -> Result<u64, ChainError> {
        let begin_depth = self.info.depth.checked_sub(interval).ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} too shallow for a {interval}-block timespan",
                self.info.block_id
            ))
        })?;
        let end_depth = self.info.depth - 1;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT end_block.when_created - begin_block.when_created \
                 FROM blocks AS begin_block, blocks AS end_block \
                 WHERE begin_block.space = 0 \
                   AND begin_block.depth = ?1 \
                   AND begin_block.span_left <= ?2 \
                   AND begin_block.span_right >= ?3 \
                   AND end_block.space = 0 \
                   AND end_block.depth = ?4 \
                   AND end_block.span_left <= ?2 \
                   AND end_block.span_right >= ?3",
            )
            .map_err(sql_err)?;
        let elapsed: Option<i64> = stmt
            .query_row(
                params![begin_depth, self.info.span.left, self.info.span.right, end_depth],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let elapsed = elapsed.ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} is missing timespan ancestors",
                self.info.block_id
            ))
        })?;
        Ok(elapsed.max(0) as u64)
    }

    /// Truncated median of the up-to-11 nearest ancestor timestamps.
    ///
    /// For shallow blocks the offset shrinks to the midpoint of the
    /// available window; at depth 1 this is the single ancestor's
    /// timestamp.
    fn median_time_past(&self) -> Result<u64, ChainError> {
        let depth = self.info.depth;
        if depth == 0 {
            return Err(ChainError::Inconsistent(format!(
                "block {} at depth 0 has no time-past window",
                self.info.block_id
            )));
        }
        let offset = (depth / 2).min(5);
        let window_floor = depth.saturating_sub(MEDIAN_TIME_SPAN);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT when_created FROM blocks \
                 WHERE space = 0 AND depth < ?1 AND depth >= ?2 \
                   AND span_left <= ?3 AND span_right >= ?4 \
                 ORDER BY when_created ASC \
                 LIMIT 1 OFFSET ?5",
            )
            .map_err(sql_err)?;
        let median: Option<u64> = stmt
            .query_row(
                params![depth, window_floor, self.info.span.left, self.info.span.right, offset],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        median.ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} has an empty median window",
                self.info.block_id
            ))
        })
    }

    // --- Transaction checks ---

    fn validate_transaction(
        &self,
        transaction: &Transaction,
        index_in_block: usize,
    ) -> Result<(), ChainError> {
        let transaction_id = self.transaction_id_at(index_in_block)?;
        let mut value_in: u64 = 0;
        for input_index in 0..transaction.inputs.len() {
            self.connect_input(transaction_id, transaction, input_index, &mut value_in)?;
        }
        let value_out = transaction
            .total_output_value()
            .filter(|v| *v <= MAX_MONEY)
            .ok_or_else(|| self.reject(ValidationError::ValueOutOfRange(u64::MAX)))?;
        if value_in < value_out {
            return Err(self.reject(ValidationError::InputsBelowOutputs { value_in, value_out }));
        }
        Ok(())
    }

    fn connect_input(
        &self,
        transaction_id: u64,
        transaction: &Transaction,
        input_index: usize,
        value_in: &mut u64,
    ) -> Result<(), ChainError> {
        let input = &transaction.inputs[input_index];

        let previous_tx_id = self
            .find_transaction_by_hash(&input.previous_output.hash)?
            .ok_or_else(|| {
                self.reject(ValidationError::UnknownPreviousTransaction(
                    input.previous_output.hash.to_string(),
                ))
            })?;

        let (output_value, output_script_id) = self
            .find_previous_output(previous_tx_id, input.previous_output.index)?
            .ok_or_else(|| {
                self.reject(ValidationError::UnknownPreviousOutput {
                    hash: input.previous_output.hash.to_string(),
                    index: input.previous_output.index,
                })
            })?;
        if output_value > MAX_MONEY {
            return Err(self.reject(ValidationError::ValueOutOfRange(output_value)));
        }

        if self.is_coinbase_transaction(previous_tx_id)? {
            let previous_depth = self
                .previous_block_depth(previous_tx_id)?
                .ok_or_else(|| {
                    self.reject(ValidationError::CoinbaseOutsideBranch { input: input_index })
                })?;
            let confirmations = self.info.depth.saturating_sub(previous_depth);
            if confirmations < COINBASE_MATURITY {
                return Err(self.reject(ValidationError::ImmatureCoinbase { input: input_index }));
            }
        }

        let output_script = reader::select_script(self.conn, output_script_id)?;
        if !self.runner.run(&input.script, &output_script, transaction, input_index) {
            return Err(self.reject(ValidationError::ScriptRejected { input: input_index }));
        }

        if self.search_double_spends(transaction_id, input, input_index)? {
            return Err(self.reject(ValidationError::DoubleSpend {
                hash: input.previous_output.hash.to_string(),
                index: input.previous_output.index,
            }));
        }

        *value_in = value_in
            .checked_add(output_value)
            .filter(|v| *v <= MAX_MONEY)
            .ok_or_else(|| self.reject(ValidationError::ValueOutOfRange(output_value)))?;
        Ok(())
    }

    fn transaction_id_at(&self, index_in_block: usize) -> Result<u64, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT transaction_id FROM transactions_parents \
                 WHERE block_id = ?1 AND index_in_block = ?2",
            )
            .map_err(sql_err)?;
        let id: Option<u64> = stmt
            .query_row(params![self.info.block_id, index_in_block as u64], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        id.ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "block {} has no transaction at index {index_in_block}",
                self.info.block_id
            ))
        })
    }

    fn find_transaction_by_hash(&self, hash: &Hash256) -> Result<Option<u64>, ChainError> {
        self.conn
            .prepare_cached(
                "SELECT transaction_id FROM transactions WHERE transaction_hash = ?1",
            )
            .map_err(sql_err)?
            .query_row(params![hash.as_bytes().as_slice()], |row| row.get(0))
            .optional()
            .map_err(sql_err)
    }

    fn find_previous_output(
        &self,
        previous_tx_id: u64,
        output_index: u32,
    ) -> Result<Option<(u64, u64)>, ChainError> {
        self.conn
            .prepare_cached(
                "SELECT value, script_id FROM outputs \
                 WHERE transaction_id = ?1 AND index_in_parent = ?2",
            )
            .map_err(sql_err)?
            .query_row(params![previous_tx_id, output_index], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(sql_err)
    }

    /// Whether the stored transaction is a coinbase: a single input
    /// carrying the null-outpoint marker.
    fn is_coinbase_transaction(&self, transaction_id: u64) -> Result<bool, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT previous_output_hash, previous_output_index FROM inputs \
                 WHERE transaction_id = ?1",
            )
            .map_err(sql_err)?;
        let inputs = stmt
            .query_map(params![transaction_id], |row| {
                Ok((crate::store::hash_column(row, 0)?, row.get::<_, u32>(1)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(inputs.len() == 1 && inputs[0].0.is_zero() && inputs[0].1 == u32::MAX)
    }

    /// Depth of the block on this branch containing the previous
    /// transaction, if any.
    fn previous_block_depth(&self, previous_tx_id: u64) -> Result<Option<u64>, ChainError> {
        self.conn
            .prepare_cached(
                "SELECT depth FROM transactions_parents \
                 JOIN blocks ON blocks.block_id = transactions_parents.block_id \
                 WHERE transaction_id = ?1 \
                   AND space = 0 \
                   AND span_left <= ?2 AND span_right >= ?3",
            )
            .map_err(sql_err)?
            .query_row(
                params![previous_tx_id, self.info.span.left, self.info.span.right],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)
    }

    /// Whether any other input on this block's branch spends the same
    /// previous output. The conflicting input's containing block must
    /// satisfy the ancestor-range predicate, so spends on disjoint forks
    /// do not collide.
    fn search_double_spends(
        &self,
        transaction_id: u64,
        input: &TxInput,
        input_index: usize,
    ) -> Result<bool, ChainError> {
        let conflict: Option<u64> = self
            .conn
            .prepare_cached(
                "SELECT input_id FROM inputs \
                 JOIN transactions_parents \
                   ON transactions_parents.transaction_id = inputs.transaction_id \
                 JOIN blocks ON blocks.block_id = transactions_parents.block_id \
                 WHERE inputs.previous_output_hash = ?1 \
                   AND inputs.previous_output_index = ?2 \
                   AND (inputs.transaction_id != ?3 OR inputs.index_in_parent != ?4) \
                   AND blocks.space = 0 \
                   AND blocks.span_left <= ?5 \
                   AND blocks.span_right >= ?6 \
                 LIMIT 1",
            )
            .map_err(sql_err)?
            .query_row(
                params![
                    input.previous_output.hash.as_bytes().as_slice(),
                    input.previous_output.index,
                    transaction_id,
                    input_index as u64,
                    self.info.span.left,
                    self.info.span.right
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(conflict.is_some())
    }
}
