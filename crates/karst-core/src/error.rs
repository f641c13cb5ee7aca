//! Error types for the karst block tree.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
}

/// Consensus rejections raised while validating a block against its branch.
///
/// These are localized to the offending block: the host deletes the branch
/// and the pass moves on. Store-level failures use [`ChainError`] instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bits {got:#010x} do not match required {expected:#010x}")] BitsMismatch { got: u32, expected: u32 },
    #[error("timestamp {timestamp} not after median time past {median}")] TimestampNotAfterMedian { timestamp: u64, median: u64 },
    #[error("unknown previous transaction {0}")] UnknownPreviousTransaction(String),
    #[error("unknown previous output {hash}:{index}")] UnknownPreviousOutput { hash: String, index: u32 },
    #[error("value {0} out of range")] ValueOutOfRange(u64),
    #[error("immature coinbase spend at input {input}")] ImmatureCoinbase { input: usize },
    #[error("coinbase spend outside this branch at input {input}")] CoinbaseOutsideBranch { input: usize },
    #[error("script rejected input {input}")] ScriptRejected { input: usize },
    #[error("double spend of {hash}:{index}")] DoubleSpend { hash: String, index: u32 },
    #[error("inputs {value_in} below outputs {value_out}")] InputsBelowOutputs { value_in: u64, value_out: u64 },
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error("block {block_id} rejected: {reason}")] Rejected { block_id: u64, reason: ValidationError },
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("store inconsistency: {0}")] Inconsistent(String),
    #[error("storage: {0}")] Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let errors: Vec<ValidationError> = vec![
            ValidationError::BitsMismatch { got: 0x1d00_ffff, expected: 0x1c00_ffff },
            ValidationError::TimestampNotAfterMedian { timestamp: 5, median: 9 },
            ValidationError::UnknownPreviousTransaction("ab".into()),
            ValidationError::UnknownPreviousOutput { hash: "ab".into(), index: 1 },
            ValidationError::ValueOutOfRange(u64::MAX),
            ValidationError::ImmatureCoinbase { input: 0 },
            ValidationError::CoinbaseOutsideBranch { input: 2 },
            ValidationError::ScriptRejected { input: 1 },
            ValidationError::DoubleSpend { hash: "cd".into(), index: 0 },
            ValidationError::InputsBelowOutputs { value_in: 1, value_out: 2 },
        ];
        for e in &errors {
            assert!(!format!("{e}").is_empty());
        }
    }

    #[test]
    fn rejected_carries_block_id() {
        let e = ChainError::Rejected {
            block_id: 42,
            reason: ValidationError::ImmatureCoinbase { input: 0 },
        };
        let msg = format!("{e}");
        assert!(msg.contains("42"));
        assert!(msg.contains("immature"));
    }

    #[test]
    fn transaction_error_converts() {
        let e: ChainError = TransactionError::Serialization("boom".into()).into();
        assert!(matches!(e, ChainError::Transaction(_)));
    }
}
