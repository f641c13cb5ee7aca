//! # karst-chain — branch-tracked block tree and validation engine.
//!
//! Blocks arrive out of order and across competing forks. Each one is
//! parked in a detached orphan space, re-parented into the canonical tree
//! by the [`organizer`] once its parent hash is known, and promoted
//! `orphan → valid` by the [`validator`], which answers every
//! ancestor-dependent question with a single nested-set range predicate.
//!
//! - [`store::Store`] — SQLite store for the seven relations
//! - [`tree::Tree`] — nested-set position arithmetic
//! - [`ledger::ChainLedger`] — per-fork cumulative work
//! - [`organizer`] — orphan re-parenting and branch deletion
//! - [`validator`] — ancestor-scoped consensus checks
//! - [`chain::Blockchain`] — batch-triggered organize+validate driver

pub mod chain;
pub mod config;
pub mod ledger;
pub mod organizer;
pub mod reader;
pub mod store;
pub mod tree;
pub mod validator;

pub use chain::Blockchain;
pub use config::ChainConfig;
pub use ledger::ChainRecord;
pub use store::{BlockStatus, Store};
