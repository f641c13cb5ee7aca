//! Protocol constants. All monetary values in satoshis (1 coin = 10^8).

pub const COIN: u64 = 100_000_000;
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Minimum depth gap between a coinbase output and any input spending it.
pub const COINBASE_MATURITY: u64 = 100;

/// Window of ancestor timestamps inspected by the median-time-past rule.
pub const MEDIAN_TIME_SPAN: u64 = 11;

/// Blocks between difficulty retargets.
pub const RETARGET_INTERVAL: u64 = 2016;

/// Intended wall-clock duration of one retarget interval (two weeks).
pub const TARGET_TIMESPAN_SECS: u64 = 14 * 24 * 60 * 60;

/// Easiest allowed compact target (proof-of-work floor).
pub const MAX_COMPACT_TARGET: u32 = 0x1d00_ffff;

/// Accepted-block count that forces an immediate organize+validate pass.
pub const DEFAULT_CLEARANCE_LEVEL: u64 = 400;

/// Deadline for a pending batch when the clearance level is not reached.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 500;
