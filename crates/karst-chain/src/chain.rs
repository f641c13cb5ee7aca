//! Blockchain composition and the batch trigger.
//!
//! [`Blockchain`] wires the store, organizer, and validator together
//! behind a two-threshold trigger: every accepted block raises a counter,
//! and a pass runs either when the counter crosses the clearance level or
//! when a deadline timer expires, whichever comes first. The store mutex
//! guarantees that exactly one organize+validate pass runs at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use karst_core::error::ChainError;
use karst_core::script::ScriptRunner;
use karst_core::types::{Block, Hash256};

use crate::config::ChainConfig;
use crate::ledger::ChainRecord;
use crate::organizer;
use crate::store::{BlockStatus, Store};
use crate::tree::Position;
use crate::validator;

/// Coalescing state for the batch trigger.
struct Trigger {
    /// Blocks accepted since the last pass.
    accepted: u64,
    /// Pending deadline timer, if one is armed.
    timer: Option<JoinHandle<()>>,
}

/// The branch-tracked block tree with its organize+validate driver.
///
/// Constructed as `Arc<Self>` so the deadline timer task can hold a
/// reference. The deadline timer is armed on the ambient tokio runtime;
/// the pass itself is synchronous.
pub struct Blockchain {
    store: Mutex<Store>,
    runner: Arc<dyn ScriptRunner>,
    config: ChainConfig,
    trigger: Mutex<Trigger>,
}

impl Blockchain {
    /// Open (or create) the on-disk store and wrap it in a blockchain.
    pub fn open(
        config: ChainConfig,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Arc<Self>, ChainError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| ChainError::Storage(e.to_string()))?;
        let store = Store::open(config.db_path())?;
        Ok(Self::with_store(store, config, runner))
    }

    /// In-memory blockchain (for testing and benches).
    pub fn in_memory(
        config: ChainConfig,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Arc<Self>, ChainError> {
        let store = Store::open_in_memory()?;
        Ok(Self::with_store(store, config, runner))
    }

    fn with_store(store: Store, config: ChainConfig, runner: Arc<dyn ScriptRunner>) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            runner,
            config,
            trigger: Mutex::new(Trigger { accepted: 0, timer: None }),
        })
    }

    /// Insert a block into a fresh orphan space and raise the trigger.
    pub fn accept_block(self: &Arc<Self>, block: &Block) -> Result<u64, ChainError> {
        let block_id = self.store.lock().insert_block(block)?;
        self.on_block_accepted();
        Ok(block_id)
    }

    /// Raise the batch trigger.
    ///
    /// Past the clearance level the pending timer is cancelled and a pass
    /// runs immediately; below it, the first acceptance arms the deadline
    /// timer. A cancelled timer task never fires, and a fired timer
    /// serializes behind any in-flight pass on the store mutex.
    ///
    /// The deadline timer needs a tokio runtime; without one, only the
    /// clearance threshold drives passes and the host is expected to call
    /// [`organize_and_validate`](Self::organize_and_validate) itself.
    pub fn on_block_accepted(self: &Arc<Self>) {
        let run_now = {
            let mut trigger = self.trigger.lock();
            trigger.accepted += 1;
            if trigger.accepted > self.config.clearance_level {
                if let Some(timer) = trigger.timer.take() {
                    timer.abort();
                }
                trigger.accepted = 0;
                true
            } else {
                if trigger.timer.is_none() {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        let chain = Arc::clone(self);
                        let timeout = self.config.batch_timeout;
                        trigger.timer = Some(handle.spawn(async move {
                            tokio::time::sleep(timeout).await;
                            chain.timer_expired();
                        }));
                    }
                }
                false
            }
        };
        if run_now {
            debug!("clearance level crossed, running pass");
            if let Err(e) = self.organize_and_validate() {
                error!(error = %e, "organize+validate pass failed");
            }
        }
    }

    fn timer_expired(&self) {
        {
            let mut trigger = self.trigger.lock();
            trigger.accepted = 0;
            trigger.timer = None;
        }
        debug!("batch timer expired, running pass");
        if let Err(e) = self.organize_and_validate() {
            error!(error = %e, "organize+validate pass failed");
        }
    }

    /// Run one organize+validate pass synchronously.
    ///
    /// The organizer completes fully before validation begins. Store
    /// inconsistencies abort the pass; consensus rejections are handled
    /// inside the validator (branch deletion) and do not surface here.
    pub fn organize_and_validate(&self) -> Result<(), ChainError> {
        let mut store = self.store.lock();
        organizer::organize(&mut store)?;
        validator::validate(&mut store, self.runner.as_ref())
    }

    // --- Read accessors ---

    pub fn block_id_by_hash(&self, hash: &Hash256) -> Result<Option<u64>, ChainError> {
        self.store.lock().block_id_by_hash(hash)
    }

    pub fn block_position(&self, block_id: u64) -> Result<Position, ChainError> {
        self.store.lock().block_position(block_id)
    }

    pub fn block_status(&self, block_id: u64) -> Result<BlockStatus, ChainError> {
        self.store.lock().block_status(block_id)
    }

    pub fn block_count(&self) -> Result<u64, ChainError> {
        self.store.lock().block_count()
    }

    pub fn orphan_space_count(&self) -> Result<u64, ChainError> {
        self.store.lock().orphan_space_count()
    }

    pub fn chain_rows(&self) -> Result<Vec<ChainRecord>, ChainError> {
        self.store.lock().chain_rows()
    }

    /// Every block row with its tree coordinates.
    pub fn block_rows(&self) -> Result<Vec<crate::store::BlockRow>, ChainError> {
        self.store.lock().block_rows()
    }

    /// The fork with the most cumulative work.
    pub fn best_chain(&self) -> Result<Option<ChainRecord>, ChainError> {
        self.store.lock().best_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_core::constants::{COIN, MAX_COMPACT_TARGET};
    use karst_core::genesis;
    use karst_core::script::{AcceptAll, Operation, Script};
    use karst_core::types::{
        BlockHeader, OutPoint, Transaction, TxInput, TxOutput,
    };
    use std::time::Duration;

    fn coinbase(height: u64) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script: Script(vec![Operation {
                    opcode: 0x08,
                    data: Some(height.to_le_bytes().to_vec()),
                }]),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script: Script(vec![Operation { opcode: 0xac, data: None }]),
            }],
        }
    }

    fn make_block(prev_hash: Hash256, timestamp: u64, height: u64) -> Block {
        let txs = vec![coinbase(height)];
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: txs[0].txid().unwrap(),
                timestamp,
                bits: MAX_COMPACT_TARGET,
                nonce: 0,
            },
            transactions: txs,
        }
    }

    fn chain_off_genesis(n: u64) -> Vec<Block> {
        let mut prev = genesis::genesis_hash();
        let mut blocks = Vec::new();
        for height in 1..=n {
            let block = make_block(prev, genesis::GENESIS_TIMESTAMP + height * 600, height);
            prev = block.header.hash();
            blocks.push(block);
        }
        blocks
    }

    fn test_chain(clearance: u64, timeout_ms: u64) -> Arc<Blockchain> {
        let config = ChainConfig {
            clearance_level: clearance,
            batch_timeout: Duration::from_millis(timeout_ms),
            ..ChainConfig::default()
        };
        Blockchain::in_memory(config, Arc::new(AcceptAll)).unwrap()
    }

    // ------------------------------------------------------------------
    // Batch trigger
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn below_clearance_no_pass_runs() {
        let chain = test_chain(10, 60_000);
        for block in chain_off_genesis(5) {
            chain.accept_block(&block).unwrap();
        }
        // Five accepted, clearance is ten, timer far away: still orphans.
        assert_eq!(chain.orphan_space_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn crossing_clearance_runs_pass_immediately() {
        let chain = test_chain(3, 60_000);
        for block in chain_off_genesis(4) {
            chain.accept_block(&block).unwrap();
        }
        // The fourth acceptance crossed the clearance level.
        assert_eq!(chain.orphan_space_count().unwrap(), 0);
        let best = chain.best_chain().unwrap().unwrap();
        assert_eq!(best.depth, 4);
    }

    #[tokio::test]
    async fn timer_runs_pass_for_small_batch() {
        let chain = test_chain(100, 50);
        for block in chain_off_genesis(3) {
            chain.accept_block(&block).unwrap();
        }
        assert_eq!(chain.orphan_space_count().unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(chain.orphan_space_count().unwrap(), 0);
        assert_eq!(chain.best_chain().unwrap().unwrap().depth, 3);
    }

    #[tokio::test]
    async fn clearance_cancels_pending_timer() {
        let chain = test_chain(2, 50);
        for block in chain_off_genesis(3) {
            chain.accept_block(&block).unwrap();
        }
        // Third acceptance crossed clearance and cancelled the timer.
        assert_eq!(chain.orphan_space_count().unwrap(), 0);
        {
            let trigger = chain.trigger.lock();
            assert_eq!(trigger.accepted, 0);
            assert!(trigger.timer.is_none());
        }
        // Nothing left for a late pass to do.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(chain.best_chain().unwrap().unwrap().depth, 3);
    }

    #[tokio::test]
    async fn manual_pass_is_available() {
        let chain = test_chain(1_000, 60_000);
        for block in chain_off_genesis(2) {
            chain.accept_block(&block).unwrap();
        }
        chain.organize_and_validate().unwrap();
        assert_eq!(chain.orphan_space_count().unwrap(), 0);
        assert_eq!(chain.best_chain().unwrap().unwrap().depth, 2);
    }

    #[tokio::test]
    async fn duplicate_accept_is_rejected() {
        let chain = test_chain(1_000, 60_000);
        let block = chain_off_genesis(1).pop().unwrap();
        chain.accept_block(&block).unwrap();
        assert!(matches!(
            chain.accept_block(&block).unwrap_err(),
            ChainError::DuplicateBlock(_)
        ));
    }
}
