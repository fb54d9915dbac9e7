use std::sync::Arc;

use super::block_height::BlockHeight;
use super::BlockHash;

/// In-memory index entry for a connected block.
///
/// Index entries are immutable and chained backwards through `prev`, so any
/// ancestor walk is just pointer chasing; none of the consensus rules need
/// chain storage to look at header-level data of earlier blocks.
#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub height: BlockHeight,
    pub hash: BlockHash,
    /// Compact difficulty target of this block's header.
    pub nbits: u32,
    pub prev: Option<Arc<BlockIndex>>,
}

impl BlockIndex {
    /// The ancestor `n` blocks back, or `None` when the walk runs past
    /// genesis. `ancestor(0)` is the entry itself.
    pub fn ancestor(&self, n: u64) -> Option<&BlockIndex> {
        let mut current = self;
        for _ in 0..n {
            current = current.prev.as_deref()?;
        }
        Some(current)
    }

    /// Iterate this entry and its ancestors, tip-to-genesis.
    pub fn chain(&self) -> impl Iterator<Item = &BlockIndex> {
        std::iter::successors(Some(self), |index| index.prev.as_deref())
    }
}
