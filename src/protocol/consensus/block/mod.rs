pub mod block_height;
pub mod block_index;

use std::fmt::Display;

use sha2::Digest;
use sha2::Sha256;

use super::transaction::Transaction;

/// A block hash: double SHA-256 over the serialized header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Lowercase hex of the digest bytes. Rule 3 compares the tail of this
    /// string against the tail of the reward address's SHA-256 hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: u64,
    /// Compact difficulty target.
    pub nbits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        let mut bytes = Vec::with_capacity(84);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(self.prev_block_hash.as_bytes());
        bytes.extend_from_slice(self.merkle_root.as_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.nbits.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&bytes);
        BlockHash(Sha256::digest(first).into())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// The digest handed to the proof-of-work oracle. What function the
    /// oracle applies to it is the oracle's concern.
    pub fn pow_hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// The coinbase transaction, by convention the first one.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Recompute the header merkle root from the current transaction set.
    /// Must be called after any coinbase mutation, e.g. an extranonce bump.
    pub fn update_merkle_root(&mut self) {
        self.header.merkle_root = merkle_root(&self.transactions);
    }
}

/// Pairwise double-SHA-256 merkle root over the transaction ids. The last
/// entry of an odd level is paired with itself.
fn merkle_root(transactions: &[Transaction]) -> BlockHash {
    let mut level: Vec<[u8; 32]> = transactions.iter().map(Transaction::txid).collect();
    if level.is_empty() {
        return BlockHash::default();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let mut bytes = [0u8; 64];
                bytes[..32].copy_from_slice(&pair[0]);
                bytes[32..].copy_from_slice(pair.last().unwrap());
                let first = Sha256::digest(bytes);
                Sha256::digest(first).into()
            })
            .collect();
    }
    BlockHash(level[0])
}
