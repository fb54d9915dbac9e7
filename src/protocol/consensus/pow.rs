use super::block::block_index::BlockIndex;
use super::block::BlockHash;
use super::ConsensusParams;

/// Proof-of-work verification seam.
///
/// The hash function and target arithmetic live outside this crate; the
/// miner only needs a yes/no per candidate nonce.
pub trait PowOracle: Send + Sync {
    fn check(&self, pow_hash: &BlockHash, nbits: u32, params: &ConsensusParams) -> bool;
}

/// Floating-point difficulty of a compact `nbits` target, relative to the
/// minimum difficulty of 1.
pub fn difficulty_from_nbits(nbits: u32) -> f64 {
    let mut shift = (nbits >> 24) & 0xff;
    let mut difficulty = 65535.0 / f64::from(nbits & 0x00ff_ffff);
    while shift < 29 {
        difficulty *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        difficulty /= 256.0;
        shift -= 1;
    }
    difficulty
}

/// Difficulty of the block `n_back` blocks behind `index`. The walk stops at
/// genesis when the chain is shorter than `n_back`.
pub fn difficulty_prev_n(index: &BlockIndex, n_back: u64) -> f64 {
    let mut reference = index;
    for _ in 0..n_back {
        match reference.prev.as_deref() {
            Some(prev) => reference = prev,
            None => break,
        }
    }
    difficulty_from_nbits(reference.nbits)
}
