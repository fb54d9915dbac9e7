//! Core of the Lynx node's built-in CPU miner and its coinbase-eligibility
//! rules.
//!
//! Two tightly coupled subsystems live here:
//!
//! - [`application::cpu_limiter::CpuLimiter`], a closed-loop throttler that
//!   shapes the aggregate CPU usage of the miner's worker threads towards a
//!   configured fraction of the host's CPUs, by cooperatively suspending and
//!   resuming them in short time slices.
//! - [`protocol::consensus::lynx_rules`], three height-gated consensus
//!   predicates restricting which address may receive a block reward, based
//!   on recent coinbase history, a difficulty-derived minimum balance, and a
//!   hash-suffix match between reward address and block hash.
//!
//! [`application::loops::mine_loop::BuiltinMiner`] ties them together: it
//! spawns the workers, steers coinbase selection through the rules, and
//! submits solved blocks through the node seams defined in [`state`].

pub mod application;
pub mod protocol;
pub mod state;

#[cfg(test)]
pub mod tests;

pub use application::loops::mine_loop::BuiltinMiner;
pub use application::loops::mine_loop::MinerContext;
pub use application::loops::mine_loop::MinerError;
