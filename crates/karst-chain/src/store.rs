//! SQLite-backed store for the block tree.
//!
//! Seven relations: `blocks` (with the nested-set position columns),
//! `chains`, `transactions`, `transactions_parents`, `inputs`, `outputs`,
//! and `operations`. Block creation time is an integer unix-seconds column
//! and output values are plain satoshi integers, so no store-side
//! conversion functions are needed. All statements go through the
//! per-connection prepared-statement cache.
//!
//! On first open, automatically seeds the genesis block into space 0 as
//! `valid` with chain row 0.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use karst_core::compact;
use karst_core::error::ChainError;
use karst_core::genesis;
use karst_core::script::Script;
use karst_core::types::{Block, Hash256, Transaction};

use crate::ledger::{ChainLedger, ChainRecord};
use crate::tree::{Position, Span, Tree};

pub(crate) const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS blocks (
    block_id        INTEGER PRIMARY KEY,
    space           INTEGER NOT NULL,
    depth           INTEGER NOT NULL,
    span_left       INTEGER NOT NULL,
    span_right      INTEGER NOT NULL,
    prev_block_id   INTEGER,
    prev_block_hash BLOB    NOT NULL,
    block_hash      BLOB    NOT NULL UNIQUE,
    version         INTEGER NOT NULL,
    bits_head       INTEGER NOT NULL,
    bits_body       INTEGER NOT NULL,
    nonce           INTEGER NOT NULL,
    merkle          BLOB    NOT NULL,
    when_created    INTEGER NOT NULL,
    status          TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocks_position
    ON blocks (space, depth, span_left, span_right);
CREATE INDEX IF NOT EXISTS idx_blocks_prev_hash ON blocks (prev_block_hash);

CREATE TABLE IF NOT EXISTS chains (
    chain_id INTEGER PRIMARY KEY,
    work     INTEGER NOT NULL,
    depth    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id   INTEGER PRIMARY KEY,
    transaction_hash BLOB    NOT NULL UNIQUE,
    version          INTEGER NOT NULL,
    locktime         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions_parents (
    block_id       INTEGER NOT NULL,
    transaction_id INTEGER NOT NULL,
    index_in_block INTEGER NOT NULL,
    PRIMARY KEY (block_id, index_in_block)
);

CREATE TABLE IF NOT EXISTS inputs (
    input_id              INTEGER PRIMARY KEY,
    transaction_id        INTEGER NOT NULL,
    index_in_parent       INTEGER NOT NULL,
    previous_output_hash  BLOB    NOT NULL,
    previous_output_index INTEGER NOT NULL,
    script_id             INTEGER NOT NULL,
    sequence              INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inputs_previous_output
    ON inputs (previous_output_hash, previous_output_index);
CREATE INDEX IF NOT EXISTS idx_inputs_transaction ON inputs (transaction_id);

CREATE TABLE IF NOT EXISTS outputs (
    output_id       INTEGER PRIMARY KEY,
    transaction_id  INTEGER NOT NULL,
    index_in_parent INTEGER NOT NULL,
    value           INTEGER NOT NULL,
    script_id       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outputs_transaction ON outputs (transaction_id);

CREATE TABLE IF NOT EXISTS operations (
    operation_id INTEGER PRIMARY KEY,
    script_id    INTEGER NOT NULL,
    opcode       INTEGER NOT NULL,
    data         BLOB
);
CREATE INDEX IF NOT EXISTS idx_operations_script ON operations (script_id);
";

/// Lifecycle state of a block row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Awaiting organization and validation.
    Orphan,
    /// Consensus-validated against its ancestor chain.
    Valid,
    /// Rejected by validation.
    Invalid,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orphan => "orphan",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ChainError> {
        match s {
            "orphan" => Ok(Self::Orphan),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            other => Err(ChainError::Inconsistent(format!("unknown block status {other:?}"))),
        }
    }
}

/// One row of `blocks` with its tree coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRow {
    pub block_id: u64,
    pub prev_block_id: Option<u64>,
    pub position: Position,
    pub status: BlockStatus,
}

pub(crate) fn sql_err(e: rusqlite::Error) -> ChainError {
    ChainError::Storage(e.to_string())
}

/// Read a 32-byte hash column.
pub(crate) fn hash_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Hash256> {
    let bytes: Vec<u8> = row.get(index)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Blob,
            "hash column is not 32 bytes".into(),
        )
    })?;
    Ok(Hash256(arr))
}

/// SQLite-backed block tree store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path.
    ///
    /// Creates the schema if missing and seeds the genesis block into
    /// space 0 when the store is empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let conn = Connection::open(path.as_ref()).map_err(sql_err)?;
        Self::initialize(conn)
    }

    /// Open an in-memory store (for testing and benches).
    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, ChainError> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        let mut store = Self { conn };
        if store.block_count()? == 0 {
            store.seed_genesis()?;
        }
        Ok(store)
    }

    fn seed_genesis(&mut self) -> Result<(), ChainError> {
        let block = genesis::genesis_block();
        let hash = block.header.hash();
        let tx = self.conn.transaction().map_err(sql_err)?;
        let block_id = insert_block_row(&tx, &block, 0, BlockStatus::Valid)?;
        insert_block_transactions(&tx, block_id, &block)?;
        let (head, body) = compact::split(block.header.bits);
        tx.prepare_cached("INSERT INTO chains (chain_id, work, depth) VALUES (0, ?1, 0)")
            .map_err(sql_err)?
            .execute(params![compact::work(head, body)])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        info!(block_hash = %hash, "seeded genesis block");
        Ok(())
    }

    /// Insert a new block into a fresh orphan space.
    ///
    /// The block lands at depth 0 with a point bracket and `status =
    /// 'orphan'`; the organizer re-parents it once its parent hash is
    /// known. Transactions are shared by hash across blocks.
    pub fn insert_block(&mut self, block: &Block) -> Result<u64, ChainError> {
        let hash = block.header.hash();
        let tx = self.conn.transaction().map_err(sql_err)?;

        let existing: Option<u64> = tx
            .prepare_cached("SELECT block_id FROM blocks WHERE block_hash = ?1")
            .map_err(sql_err)?
            .query_row(params![hash.as_bytes().as_slice()], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        if existing.is_some() {
            return Err(ChainError::DuplicateBlock(hash.to_string()));
        }

        let space: u64 = tx
            .prepare_cached("SELECT COALESCE(MAX(space), 0) + 1 FROM blocks")
            .map_err(sql_err)?
            .query_row([], |row| row.get(0))
            .map_err(sql_err)?;

        let block_id = insert_block_row(&tx, block, space, BlockStatus::Orphan)?;
        insert_block_transactions(&tx, block_id, block)?;
        tx.commit().map_err(sql_err)?;
        debug!(block_id, space, block_hash = %hash, "accepted block into orphan space");
        Ok(block_id)
    }

    // --- Read accessors ---

    pub fn block_count(&self) -> Result<u64, ChainError> {
        self.conn
            .prepare_cached("SELECT COUNT(*) FROM blocks")
            .map_err(sql_err)?
            .query_row([], |row| row.get(0))
            .map_err(sql_err)
    }

    /// Number of detached orphan spaces (distinct `space > 0`).
    pub fn orphan_space_count(&self) -> Result<u64, ChainError> {
        self.conn
            .prepare_cached("SELECT COUNT(DISTINCT space) FROM blocks WHERE space > 0")
            .map_err(sql_err)?
            .query_row([], |row| row.get(0))
            .map_err(sql_err)
    }

    pub fn block_id_by_hash(&self, hash: &Hash256) -> Result<Option<u64>, ChainError> {
        self.conn
            .prepare_cached("SELECT block_id FROM blocks WHERE block_hash = ?1")
            .map_err(sql_err)?
            .query_row(params![hash.as_bytes().as_slice()], |row| row.get(0))
            .optional()
            .map_err(sql_err)
    }

    pub fn block_position(&self, block_id: u64) -> Result<Position, ChainError> {
        Tree::new(&self.conn).load_position(block_id)
    }

    pub fn block_status(&self, block_id: u64) -> Result<BlockStatus, ChainError> {
        let status: Option<String> = self
            .conn
            .prepare_cached("SELECT status FROM blocks WHERE block_id = ?1")
            .map_err(sql_err)?
            .query_row(params![block_id], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        match status {
            Some(s) => BlockStatus::parse(&s),
            None => Err(ChainError::Inconsistent(format!("no status for block {block_id}"))),
        }
    }

    /// Every block row with its tree coordinates, ordered by id. For
    /// diagnostics and invariant checks.
    pub fn block_rows(&self) -> Result<Vec<BlockRow>, ChainError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT block_id, prev_block_id, space, depth, span_left, span_right, status \
                 FROM blocks ORDER BY block_id ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, Option<u64>>(1)?,
                    Position {
                        space: row.get(2)?,
                        depth: row.get(3)?,
                        span: Span { left: row.get(4)?, right: row.get(5)? },
                    },
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter()
            .map(|(block_id, prev_block_id, position, status)| {
                Ok(BlockRow {
                    block_id,
                    prev_block_id,
                    position,
                    status: BlockStatus::parse(&status)?,
                })
            })
            .collect()
    }

    /// All chain rows ordered by `chain_id`.
    pub fn chain_rows(&self) -> Result<Vec<ChainRecord>, ChainError> {
        ChainLedger::new(&self.conn).rows()
    }

    /// The fork with the most cumulative work, if any chain exists.
    pub fn best_chain(&self) -> Result<Option<ChainRecord>, ChainError> {
        ChainLedger::new(&self.conn).best()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Insert the `blocks` row for a new block at depth 0 of `space`.
fn insert_block_row(
    conn: &Connection,
    block: &Block,
    space: u64,
    status: BlockStatus,
) -> Result<u64, ChainError> {
    let (head, body) = compact::split(block.header.bits);
    conn.prepare_cached(
        "INSERT INTO blocks (space, depth, span_left, span_right, prev_block_id, \
         prev_block_hash, block_hash, version, bits_head, bits_body, nonce, merkle, \
         when_created, status) \
         VALUES (?1, 0, 0, 0, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .map_err(sql_err)?
    .execute(params![
        space,
        block.header.prev_hash.as_bytes().as_slice(),
        block.header.hash().as_bytes().as_slice(),
        block.header.version,
        head,
        body,
        block.header.nonce,
        block.header.merkle_root.as_bytes().as_slice(),
        block.header.timestamp,
        status.as_str(),
    ])
    .map_err(sql_err)?;
    Ok(conn.last_insert_rowid() as u64)
}

/// Attach a block's transactions via `transactions_parents`, creating
/// transaction, input, output, and script rows for hashes not yet stored.
fn insert_block_transactions(
    conn: &Connection,
    block_id: u64,
    block: &Block,
) -> Result<(), ChainError> {
    for (index_in_block, transaction) in block.transactions.iter().enumerate() {
        let transaction_id = find_or_insert_transaction(conn, transaction)?;
        conn.prepare_cached(
            "INSERT INTO transactions_parents (block_id, transaction_id, index_in_block) \
             VALUES (?1, ?2, ?3)",
        )
        .map_err(sql_err)?
        .execute(params![block_id, transaction_id, index_in_block as u64])
        .map_err(sql_err)?;
    }
    Ok(())
}

fn find_or_insert_transaction(
    conn: &Connection,
    transaction: &Transaction,
) -> Result<u64, ChainError> {
    let hash = transaction.txid()?;
    let existing: Option<u64> = conn
        .prepare_cached("SELECT transaction_id FROM transactions WHERE transaction_hash = ?1")
        .map_err(sql_err)?
        .query_row(params![hash.as_bytes().as_slice()], |row| row.get(0))
        .optional()
        .map_err(sql_err)?;
    if let Some(transaction_id) = existing {
        return Ok(transaction_id);
    }

    conn.prepare_cached(
        "INSERT INTO transactions (transaction_hash, version, locktime) VALUES (?1, ?2, ?3)",
    )
    .map_err(sql_err)?
    .execute(params![
        hash.as_bytes().as_slice(),
        transaction.version,
        transaction.lock_time
    ])
    .map_err(sql_err)?;
    let transaction_id = conn.last_insert_rowid() as u64;

    for (index_in_parent, input) in transaction.inputs.iter().enumerate() {
        let script_id = insert_script(conn, &input.script)?;
        conn.prepare_cached(
            "INSERT INTO inputs (transaction_id, index_in_parent, previous_output_hash, \
             previous_output_index, script_id, sequence) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(sql_err)?
        .execute(params![
            transaction_id,
            index_in_parent as u64,
            input.previous_output.hash.as_bytes().as_slice(),
            input.previous_output.index,
            script_id,
            input.sequence
        ])
        .map_err(sql_err)?;
    }

    for (index_in_parent, output) in transaction.outputs.iter().enumerate() {
        let script_id = insert_script(conn, &output.script)?;
        conn.prepare_cached(
            "INSERT INTO outputs (transaction_id, index_in_parent, value, script_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(sql_err)?
        .execute(params![
            transaction_id,
            index_in_parent as u64,
            output.value,
            script_id
        ])
        .map_err(sql_err)?;
    }

    Ok(transaction_id)
}

/// Store a script's operations under a fresh `script_id`.
///
/// Script ids are allocated from the ids already referenced by inputs and
/// outputs; each allocated id is referenced by its owning row before the
/// next allocation happens.
fn insert_script(conn: &Connection, script: &Script) -> Result<u64, ChainError> {
    let script_id: u64 = conn
        .prepare_cached(
            "SELECT COALESCE(MAX(script_id), 0) + 1 FROM \
             (SELECT script_id FROM inputs UNION ALL SELECT script_id FROM outputs)",
        )
        .map_err(sql_err)?
        .query_row([], |row| row.get(0))
        .map_err(sql_err)?;
    for op in script.operations() {
        conn.prepare_cached(
            "INSERT INTO operations (script_id, opcode, data) VALUES (?1, ?2, ?3)",
        )
        .map_err(sql_err)?
        .execute(params![script_id, op.opcode, op.data])
        .map_err(sql_err)?;
    }
    Ok(script_id)
}
