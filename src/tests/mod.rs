//! End-to-end scenarios driven against the in-memory regtest chain.

pub mod shared;
