//! The genesis block.
//!
//! Space 0 of the block tree is rooted here: a store seeds this block at
//! depth 0 with status `valid` and chain row 0 when first opened.

use crate::constants::{COIN, MAX_COMPACT_TARGET};
use crate::script::{Operation, Script};
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

pub const GENESIS_TIMESTAMP: u64 = 1_231_006_505;

const GENESIS_NOTE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Build the genesis block (single coinbase transaction).
pub fn genesis_block() -> Block {
    let coinbase = Transaction {
        version: 1,
        lock_time: 0,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script: Script(vec![Operation {
                opcode: 0x04,
                data: Some(GENESIS_NOTE.to_vec()),
            }]),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: 50 * COIN,
            // OP_CHECKSIG; the genesis output is unspendable in practice.
            script: Script(vec![Operation { opcode: 0xac, data: None }]),
        }],
    };
    let merkle_root = coinbase
        .txid()
        .expect("genesis coinbase has a canonical encoding");
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: GENESIS_TIMESTAMP,
            bits: MAX_COMPACT_TARGET,
            nonce: 2_083_236_893,
        },
        transactions: vec![coinbase],
    }
}

/// Header hash of the genesis block.
pub fn genesis_hash() -> Hash256 {
    genesis_block().header.hash()
}

/// Check whether a block is the genesis block.
pub fn is_genesis(block: &Block) -> bool {
    block.header.hash() == genesis_hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(genesis_block(), genesis_block());
        assert_eq!(genesis_hash(), genesis_hash());
    }

    #[test]
    fn genesis_has_single_coinbase() {
        let block = genesis_block();
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn genesis_prev_hash_is_zero() {
        assert!(genesis_block().header.prev_hash.is_zero());
    }

    #[test]
    fn genesis_merkle_commits_to_coinbase() {
        let block = genesis_block();
        assert_eq!(
            block.header.merkle_root,
            block.transactions[0].txid().unwrap()
        );
    }

    #[test]
    fn is_genesis_detects() {
        let mut other = genesis_block();
        assert!(is_genesis(&other));
        other.header.nonce += 1;
        assert!(!is_genesis(&other));
    }
}
