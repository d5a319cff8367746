//! Block-index arena and the active chain.
//!
//! The index is an append-only arena of header entries addressed by
//! integer id, each with an optional parent link; ancestor lookups are
//! bounded walks toward the root.

use std::collections::HashMap;

use bchd_consensus::Hash256;
use bchd_primitives::BlockHeader;

pub type BlockId = u32;

pub const STATUS_VALID_TREE: u32 = 1 << 0;
pub const STATUS_VALID_SCRIPTS: u32 = 1 << 1;
pub const STATUS_HAVE_DATA: u32 = 1 << 2;
pub const STATUS_EXCESSIVE: u32 = 1 << 3;
pub const STATUS_FAILED: u32 = 1 << 4;

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub parent: Option<BlockId>,
    pub chain_work: u128,
    pub status: u32,
}

impl IndexEntry {
    pub fn time(&self) -> i64 {
        self.header.time as i64
    }

    pub fn is_valid(&self, required: u32) -> bool {
        self.status & STATUS_FAILED == 0 && self.status & required == required
    }

    pub fn have_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }
}

/// Work contributed by one block, approximated from the compact target.
/// 2^256 / (target + 1); precise enough for download ordering, which is
/// the only use the message engine has for it.
pub fn block_proof(bits: u32) -> u128 {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007f_ffff) as u128;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return 0;
    }
    // target = mantissa * 2^(8*(exponent-3)); proof = 2^256 / target
    let shift = 256 - 8 * (exponent - 3) - 24;
    let base = (1u128 << 100) / mantissa;
    let adjust = shift - (100 - 24);
    if adjust >= 0 {
        if (base.leading_zeros() as i32) <= adjust {
            u128::MAX // proof exceeds 2^128; saturate
        } else {
            base << adjust
        }
    } else {
        base >> (-adjust).min(127)
    }
}

#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: BlockId) -> &IndexEntry {
        &self.entries[id as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut IndexEntry {
        &mut self.entries[id as usize]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    /// Insert a header whose parent is either absent (genesis) or already
    /// indexed. Returns the existing id for a duplicate.
    pub fn insert_header(&mut self, header: BlockHeader) -> Option<BlockId> {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return Some(*existing);
        }
        let parent = self.by_hash.get(&header.prev_block).copied();
        let (height, parent_work) = match parent {
            Some(parent_id) => {
                let entry = self.get(parent_id);
                (entry.height + 1, entry.chain_work)
            }
            None => {
                if !self.entries.is_empty() {
                    return None; // unconnected; caller parks it
                }
                (0, 0)
            }
        };
        let id = self.entries.len() as BlockId;
        let chain_work = parent_work.saturating_add(block_proof(header.bits));
        self.entries.push(IndexEntry {
            hash,
            header,
            height,
            parent,
            chain_work,
            status: 0,
        });
        self.by_hash.insert(hash, id);
        Some(id)
    }

    /// Walk up to the ancestor at `height`.
    pub fn ancestor(&self, mut id: BlockId, height: i32) -> Option<BlockId> {
        if height < 0 || height > self.get(id).height {
            return None;
        }
        while self.get(id).height > height {
            id = self.get(id).parent?;
        }
        Some(id)
    }

    pub fn set_status(&mut self, id: BlockId, status: u32) {
        self.get_mut(id).status |= status;
    }
}

/// The active chain as a height-indexed vector of arena ids.
#[derive(Default)]
pub struct ActiveChain {
    ids: Vec<BlockId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i32 {
        self.ids.len() as i32 - 1
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.ids.last().copied()
    }

    pub fn genesis(&self) -> Option<BlockId> {
        self.ids.first().copied()
    }

    pub fn at(&self, height: i32) -> Option<BlockId> {
        if height < 0 {
            return None;
        }
        self.ids.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: BlockId) -> bool {
        self.at(index.get(id).height) == Some(id)
    }

    pub fn next(&self, index: &BlockIndex, id: BlockId) -> Option<BlockId> {
        if !self.contains(index, id) {
            return None;
        }
        self.at(index.get(id).height + 1)
    }

    /// Extend or reorganize so that `tip` becomes the tip. Every block on
    /// the new chain must already be indexed.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: BlockId) {
        let mut fork_height = index.get(tip).height;
        let mut walk = tip;
        let mut appended = Vec::new();
        loop {
            if self.at(index.get(walk).height) == Some(walk) {
                fork_height = index.get(walk).height;
                break;
            }
            appended.push(walk);
            match index.get(walk).parent {
                Some(parent) => walk = parent,
                None => {
                    fork_height = -1;
                    break;
                }
            }
        }
        self.ids.truncate((fork_height + 1) as usize);
        for id in appended.into_iter().rev() {
            self.ids.push(id);
        }
    }

    /// Step-doubling locator back from `from` (tip when None).
    pub fn locator(&self, index: &BlockIndex, from: Option<BlockId>) -> Vec<Hash256> {
        let mut locator = Vec::with_capacity(32);
        let Some(mut id) = from.or_else(|| self.tip()) else {
            return locator;
        };
        let mut step = 1i32;
        loop {
            locator.push(index.get(id).hash);
            let height = index.get(id).height;
            if height == 0 {
                break;
            }
            let next_height = (height - step).max(0);
            // prefer walking the active chain once the fork is behind us
            id = if self.contains(index, id) {
                match self.at(next_height) {
                    Some(ancestor) => ancestor,
                    None => break,
                }
            } else {
                match index.ancestor(id, next_height) {
                    Some(ancestor) => ancestor,
                    None => break,
                }
            };
            if locator.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        locator
    }

    /// First locator entry on the active chain, else genesis.
    pub fn find_fork(&self, index: &BlockIndex, locator: &[Hash256]) -> Option<BlockId> {
        for hash in locator {
            if let Some(id) = index.lookup(hash) {
                if self.contains(index, id) {
                    return Some(id);
                }
            }
        }
        self.genesis()
    }
}

/// How long, at the tip's proof rate, the chain would take to accumulate
/// the work separating `from` from `to`. Used by the fingerprinting rule.
pub fn proof_equivalent_time(
    index: &BlockIndex,
    to: BlockId,
    from: BlockId,
    tip: BlockId,
    pow_target_spacing: i64,
) -> i64 {
    let to_work = index.get(to).chain_work;
    let from_work = index.get(from).chain_work;
    let tip_proof = block_proof(index.get(tip).header.bits).max(1);
    let (sign, delta) = if to_work >= from_work {
        (1i64, to_work - from_work)
    } else {
        (-1i64, from_work - to_work)
    };
    let spacing = pow_target_spacing as u128;
    let seconds = (delta / tip_proof)
        .saturating_mul(spacing)
        .saturating_add((delta % tip_proof).saturating_mul(spacing) / tip_proof);
    sign * seconds.min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn header_chain(count: usize, start_bits: u32) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(count);
        let mut prev = [0u8; 32];
        for i in 0..count {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [i as u8; 32],
                time: 1_500_000_000 + i as u32 * 600,
                bits: start_bits,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn insert_builds_heights_and_work() {
        let mut index = BlockIndex::new();
        let headers = header_chain(5, 0x207fffff);
        let mut last = None;
        for header in &headers {
            last = index.insert_header(*header);
            assert!(last.is_some());
        }
        let tip = last.unwrap();
        assert_eq!(index.get(tip).height, 4);
        assert!(index.get(tip).chain_work > index.get(0).chain_work);
        assert_eq!(index.ancestor(tip, 0), Some(0));
        assert_eq!(index.ancestor(tip, 5), None);
    }

    #[test]
    fn unconnected_header_is_refused() {
        let mut index = BlockIndex::new();
        let headers = header_chain(2, 0x207fffff);
        index.insert_header(headers[0]);
        let orphan = BlockHeader {
            prev_block: [0xee; 32],
            ..headers[1]
        };
        assert_eq!(index.insert_header(orphan), None);
    }

    #[test]
    fn active_chain_set_tip_and_reorg() {
        let mut index = BlockIndex::new();
        let mut chain = ActiveChain::new();
        let headers = header_chain(4, 0x207fffff);
        let ids: Vec<BlockId> = headers
            .iter()
            .map(|h| index.insert_header(*h).unwrap())
            .collect();
        chain.set_tip(&index, ids[3]);
        assert_eq!(chain.height(), 3);
        assert!(chain.contains(&index, ids[1]));
        assert_eq!(chain.next(&index, ids[1]), Some(ids[2]));

        // fork from height 1
        let fork = BlockHeader {
            nonce: 999,
            ..headers[2]
        };
        let fork_id = index.insert_header(fork).unwrap();
        chain.set_tip(&index, fork_id);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip(), Some(fork_id));
        assert!(!chain.contains(&index, ids[2]));
    }

    #[test]
    fn locator_is_dense_then_sparse() {
        let mut index = BlockIndex::new();
        let mut chain = ActiveChain::new();
        let headers = header_chain(64, 0x207fffff);
        let mut tip = 0;
        for header in &headers {
            tip = index.insert_header(*header).unwrap();
        }
        chain.set_tip(&index, tip);
        let locator = chain.locator(&index, None);
        assert_eq!(locator[0], index.get(tip).hash);
        assert_eq!(*locator.last().unwrap(), index.get(0).hash);
        assert!(locator.len() < 64);

        let fork = chain.find_fork(&index, &locator);
        assert_eq!(fork, Some(tip));
    }

    #[test]
    fn block_proof_orders_by_difficulty() {
        // smaller target (harder) must carry more work
        let easy = block_proof(0x207fffff);
        let hard = block_proof(0x1d00ffff);
        assert!(hard > easy);
        assert!(easy > 0);
    }
}
