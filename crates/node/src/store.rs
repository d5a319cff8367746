use std::collections::HashMap;
use std::sync::Mutex;

use bchd_consensus::Hash256;
use bchd_net::external::BlockStore;
use bchd_primitives::Block;

/// In-memory block store. Persistent flat-file storage is deliberately
/// out of scope; the engine only needs the `BlockStore` seam.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<Hash256, Block>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_block(&self, block: Block) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.insert(block.hash(), block);
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|blocks| blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_block(&self, hash: &Hash256) -> Option<Block> {
        self.blocks.lock().ok()?.get(hash).cloned()
    }
}
