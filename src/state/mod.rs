//! Seams to the rest of the node: chain access, block intake and the wallet.
//!
//! The miner core never owns chain or wallet state; it consumes these traits
//! and leaves storage, validation pipelines and key management to the node
//! shell that embeds it.

pub mod chain;
pub mod wallet;
