use std::sync::Arc;

use crate::protocol::consensus::address::Address;
use crate::protocol::consensus::amount::Amount;
use crate::protocol::consensus::block::block_height::BlockHeight;
use crate::protocol::consensus::block::block_index::BlockIndex;
use crate::protocol::consensus::block::Block;
use crate::protocol::consensus::block::BlockHash;
use crate::protocol::consensus::transaction::Script;

/// A block could not be read back from storage. Consensus checks that hit
/// this fail closed: the block under validation is treated as invalid.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to read block {hash} at height {height} from storage")]
pub struct ReadBlockError {
    pub hash: BlockHash,
    pub height: BlockHeight,
}

/// Read access to the active chain.
pub trait ChainView: Send + Sync {
    /// The current tip, or `None` before the genesis block is connected.
    fn tip(&self) -> Option<Arc<BlockIndex>>;

    fn height(&self) -> Option<BlockHeight> {
        self.tip().map(|tip| tip.height)
    }

    fn read_block(&self, index: &BlockIndex) -> Result<Block, ReadBlockError>;

    /// Confirmed balance of an address; zero for unknown addresses.
    fn address_balance(&self, address: &Address) -> Amount;

    /// Whether the node is still syncing. Mining during the initial block
    /// download is pointless and disabled by default.
    fn is_initial_block_download(&self) -> bool;
}

/// A fully assembled block candidate, ready for nonce iteration.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub block: Block,
}

/// Produces block candidates paying the given coinbase script.
pub trait BlockTemplateSource: Send + Sync {
    fn create_new_block(&self, coinbase_script: &Script) -> Option<BlockTemplate>;
}

/// Accepts solved blocks into the node's validation pipeline.
pub trait BlockSink: Send + Sync {
    /// Returns whether the block was accepted as the new tip. `force`
    /// requests processing even if the block was not explicitly requested.
    fn accept(&self, block: Block, force: bool) -> bool;
}
