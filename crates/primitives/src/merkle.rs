//! Partial merkle trees for filtered-block (`merkleblock`) responses.

use bchd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

const MAX_PARTIAL_HASHES: u64 = 16_000_000;

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// A merkle tree pruned down to the transactions selected by a bloom
/// filter, plus the branch hashes needed to recompute the root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartialMerkleTree {
    tx_count: u32,
    bits: Vec<bool>,
    hashes: Vec<Hash256>,
}

impl PartialMerkleTree {
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Self {
        debug_assert_eq!(txids.len(), matches.len());
        let mut tree = Self {
            tx_count: txids.len() as u32,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        let mut height = 0;
        while tree.width_at(height) > 1 {
            height += 1;
        }
        tree.build(height, 0, txids, matches);
        tree
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    fn width_at(&self, height: u32) -> u32 {
        (self.tx_count + (1 << height) - 1) >> height
    }

    fn hash_at(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.hash_at(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.width_at(height - 1) {
            self.hash_at(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        hash_pair(&left, &right)
    }

    fn build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let mut parent_of_match = false;
        let first = (pos << height) as usize;
        let last = (((pos + 1) << height) as usize).min(matches.len());
        for matched in &matches[first..last] {
            parent_of_match |= *matched;
        }
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.hashes.push(self.hash_at(height, pos, txids));
        } else {
            self.build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.width_at(height - 1) {
                self.build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    /// Recompute the merkle root, collecting matched (position, txid)
    /// pairs. Returns None for a malformed tree.
    pub fn extract_matches(&self, matched: &mut Vec<(usize, Hash256)>) -> Option<Hash256> {
        matched.clear();
        if self.tx_count == 0 || self.hashes.len() as u32 > self.tx_count {
            return None;
        }
        let mut height = 0;
        while self.width_at(height) > 1 {
            height += 1;
        }
        let mut bit_pos = 0usize;
        let mut hash_pos = 0usize;
        let root = self.extract(height, 0, &mut bit_pos, &mut hash_pos, matched)?;
        // every bit and hash must be consumed
        if hash_pos != self.hashes.len() || (bit_pos + 7) / 8 != (self.bits.len() + 7) / 8 {
            return None;
        }
        Some(root)
    }

    fn extract(
        &self,
        height: u32,
        pos: u32,
        bit_pos: &mut usize,
        hash_pos: &mut usize,
        matched: &mut Vec<(usize, Hash256)>,
    ) -> Option<Hash256> {
        if *bit_pos >= self.bits.len() {
            return None;
        }
        let parent_of_match = self.bits[*bit_pos];
        *bit_pos += 1;
        if height == 0 || !parent_of_match {
            if *hash_pos >= self.hashes.len() {
                return None;
            }
            let hash = self.hashes[*hash_pos];
            *hash_pos += 1;
            if height == 0 && parent_of_match {
                matched.push((pos as usize, hash));
            }
            return Some(hash);
        }
        let left = self.extract(height - 1, pos * 2, bit_pos, hash_pos, matched)?;
        let right = if pos * 2 + 1 < self.width_at(height - 1) {
            let right = self.extract(height - 1, pos * 2 + 1, bit_pos, hash_pos, matched)?;
            if right == left {
                // identical nodes in a pair are disallowed (CVE-2012-2459)
                return None;
            }
            right
        } else {
            left
        };
        Some(hash_pair(&left, &right))
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.tx_count);
        encoder.write_varint(self.hashes.len() as u64);
        for hash in &self.hashes {
            encoder.write_hash_le(hash);
        }
        let mut packed = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        encoder.write_var_bytes(&packed);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tx_count = decoder.read_u32_le()?;
        let hash_count = decoder.read_varint_max(MAX_PARTIAL_HASHES)? as usize;
        let mut hashes = Vec::with_capacity(hash_count.min(4096));
        for _ in 0..hash_count {
            hashes.push(decoder.read_hash()?);
        }
        let packed = decoder.read_var_bytes(MAX_PARTIAL_HASHES as usize)?;
        let mut bits = Vec::with_capacity(packed.len() * 8);
        for byte in &packed {
            for bit in 0..8 {
                bits.push(byte & (1 << bit) != 0);
            }
        }
        Ok(Self {
            tx_count,
            bits,
            hashes,
        })
    }
}

/// Root of a full merkle tree over txids.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(hash_pair(left, right));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txids(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[0] = i as u8;
                hash[1] = (i >> 8) as u8;
                sha256d(&hash)
            })
            .collect()
    }

    #[test]
    fn extract_recovers_matches_and_root() {
        for n in [1usize, 2, 3, 5, 7, 16, 33] {
            let ids = txids(n);
            let root = merkle_root(&ids);
            let mut matches = vec![false; n];
            matches[0] = true;
            if n > 4 {
                matches[n - 2] = true;
            }
            let tree = PartialMerkleTree::from_txids(&ids, &matches);
            let mut matched = Vec::new();
            let extracted = tree.extract_matches(&mut matched).expect("valid tree");
            assert_eq!(extracted, root, "root mismatch at n={n}");
            let expected: Vec<usize> = matches
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| i)
                .collect();
            let got: Vec<usize> = matched.iter().map(|(i, _)| *i).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn no_matches_still_proves_root() {
        let ids = txids(9);
        let tree = PartialMerkleTree::from_txids(&ids, &vec![false; 9]);
        let mut matched = Vec::new();
        assert_eq!(tree.extract_matches(&mut matched), Some(merkle_root(&ids)));
        assert!(matched.is_empty());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ids = txids(12);
        let mut matches = vec![false; 12];
        matches[3] = true;
        matches[11] = true;
        let tree = PartialMerkleTree::from_txids(&ids, &matches);
        let mut encoder = Encoder::new();
        tree.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = PartialMerkleTree::consensus_decode_from(&mut decoder).expect("decode");
        let mut matched = Vec::new();
        assert_eq!(
            decoded.extract_matches(&mut matched),
            Some(merkle_root(&ids))
        );
        assert_eq!(matched.len(), 2);
    }
}
