//! Scripts and the execution-engine seam.
//!
//! A script is an ordered list of operations (opcode plus optional inline
//! data), exactly as persisted in the `operations` relation. Script
//! *execution* is not implemented here: the validator consumes it through
//! the [`ScriptRunner`] trait so hosts can plug in a real interpreter.

use serde::{Deserialize, Serialize};

use crate::types::Transaction;

/// A single script operation.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Operation {
    /// Raw opcode byte.
    pub opcode: u8,
    /// Inline push data, if the opcode carries any.
    pub data: Option<Vec<u8>>,
}

/// An ordered list of operations.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Script(pub Vec<Operation>);

impl Script {
    /// The empty script.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an operation.
    pub fn push(&mut self, op: Operation) {
        self.0.push(op);
    }

    /// Operations in evaluation order.
    pub fn operations(&self) -> &[Operation] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Script execution engine.
///
/// `run` evaluates `input_script` against `output_script` in the context of
/// `tx`'s input at `input_index` and reports whether the spend authorizes.
/// Implementations must be pure with respect to their arguments.
pub trait ScriptRunner: Send + Sync {
    fn run(
        &self,
        input_script: &Script,
        output_script: &Script,
        tx: &Transaction,
        input_index: usize,
    ) -> bool;
}

/// Runner that authorizes every spend.
///
/// For hosts that defer script execution to a later stage, and for tests
/// that exercise the ancestor-dependent consensus checks in isolation.
pub struct AcceptAll;

impl ScriptRunner for AcceptAll {
    fn run(&self, _: &Script, _: &Script, _: &Transaction, _: usize) -> bool {
        true
    }
}
