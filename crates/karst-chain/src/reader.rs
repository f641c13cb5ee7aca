//! Block materialization from the relational snapshot.
//!
//! Pure reads: a block is rebuilt from its `blocks` row, its transactions
//! joined through `transactions_parents` in block order, inputs and
//! outputs in parent order, and scripts from `operations` in operation
//! order. Nothing here mutates the store.

use rusqlite::{params, Connection, OptionalExtension};

use karst_core::compact;
use karst_core::error::ChainError;
use karst_core::script::{Operation, Script};
use karst_core::types::{Block, BlockHeader, OutPoint, Transaction, TxInput, TxOutput};

use crate::store::{hash_column, sql_err};
use crate::tree::Span;

/// Position record consumed by the validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPosition {
    pub block_id: u64,
    pub depth: u64,
    pub span: Span,
    pub prev_block_id: u64,
}

/// Materialize a block (header plus transactions) by id.
pub fn read_block(conn: &Connection, block_id: u64) -> Result<Block, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT version, bits_head, bits_body, nonce, prev_block_hash, merkle, \
             when_created \
             FROM blocks WHERE block_id = ?1",
        )
        .map_err(sql_err)?;
    let header = stmt
        .query_row(params![block_id], |row| {
            let bits_head: u32 = row.get(1)?;
            let bits_body: u32 = row.get(2)?;
            Ok(BlockHeader {
                version: row.get(0)?,
                prev_hash: hash_column(row, 4)?,
                merkle_root: hash_column(row, 5)?,
                timestamp: row.get(6)?,
                bits: compact::join(bits_head, bits_body),
                nonce: row.get(3)?,
            })
        })
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| ChainError::Inconsistent(format!("no block row for {block_id}")))?;

    let transactions = read_transactions(conn, block_id)?;
    Ok(Block { header, transactions })
}

/// Materialize a block's position record. `prev_block_id` must be set:
/// the validator only sees blocks already organized under a parent.
pub fn read_block_info(conn: &Connection, block_id: u64) -> Result<BlockPosition, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT depth, span_left, span_right, prev_block_id \
             FROM blocks WHERE block_id = ?1",
        )
        .map_err(sql_err)?;
    let info = stmt
        .query_row(params![block_id], |row| {
            let prev_block_id: Option<u64> = row.get(3)?;
            Ok((
                row.get::<_, u64>(0)?,
                Span { left: row.get(1)?, right: row.get(2)? },
                prev_block_id,
            ))
        })
        .optional()
        .map_err(sql_err)?;
    let (depth, span, prev_block_id) = info
        .ok_or_else(|| ChainError::Inconsistent(format!("no block row for {block_id}")))?;
    let prev_block_id = prev_block_id.ok_or_else(|| {
        ChainError::Inconsistent(format!("block {block_id} has no previous block id"))
    })?;
    Ok(BlockPosition { block_id, depth, span, prev_block_id })
}

fn read_transactions(conn: &Connection, block_id: u64) -> Result<Vec<Transaction>, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT transactions.transaction_id, transactions.version, transactions.locktime \
             FROM transactions_parents \
             JOIN transactions \
               ON transactions.transaction_id = transactions_parents.transaction_id \
             WHERE block_id = ?1 \
             ORDER BY index_in_block ASC",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(params![block_id], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;

    let mut transactions = Vec::with_capacity(rows.len());
    for (transaction_id, version, lock_time) in rows {
        transactions.push(Transaction {
            version,
            lock_time,
            inputs: select_inputs(conn, transaction_id)?,
            outputs: select_outputs(conn, transaction_id)?,
        });
    }
    Ok(transactions)
}

fn select_inputs(conn: &Connection, transaction_id: u64) -> Result<Vec<TxInput>, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT previous_output_hash, previous_output_index, script_id, sequence \
             FROM inputs WHERE transaction_id = ?1 \
             ORDER BY index_in_parent ASC",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(params![transaction_id], |row| {
            Ok((
                hash_column(row, 0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;

    let mut inputs = Vec::with_capacity(rows.len());
    for (hash, index, script_id, sequence) in rows {
        inputs.push(TxInput {
            previous_output: OutPoint { hash, index },
            script: select_script(conn, script_id)?,
            sequence,
        });
    }
    Ok(inputs)
}

fn select_outputs(conn: &Connection, transaction_id: u64) -> Result<Vec<TxOutput>, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT value, script_id FROM outputs WHERE transaction_id = ?1 \
             ORDER BY index_in_parent ASC",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(params![transaction_id], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;

    let mut outputs = Vec::with_capacity(rows.len());
    for (value, script_id) in rows {
        outputs.push(TxOutput { value, script: select_script(conn, script_id)? });
    }
    Ok(outputs)
}

/// Materialize a script from `operations` in operation order.
pub(crate) fn select_script(conn: &Connection, script_id: u64) -> Result<Script, ChainError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT opcode, data FROM operations WHERE script_id = ?1 \
             ORDER BY operation_id ASC",
        )
        .map_err(sql_err)?;
    let operations = stmt
        .query_map(params![script_id], |row| {
            Ok(Operation { opcode: row.get(0)?, data: row.get(1)? })
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(Script(operations))
}
