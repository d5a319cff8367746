use bchd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

const MAX_BLOCK_TXS: u64 = 16_000_000;

/// The 80-byte block header as transmitted inside `block` and `headers`
/// messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode_to(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode_to(&mut encoder);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            tx.consensus_encode_to(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let tx_count = decoder.read_varint_max(MAX_BLOCK_TXS)? as usize;
        let mut txs = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            txs.push(Transaction::consensus_decode_from(&mut decoder)?);
        }
        Ok(Self { header, txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eighty_bytes_and_hash_matches() {
        let header = BlockHeader {
            version: 4,
            prev_block: [0xaa; 32],
            merkle_root: [0xbb; 32],
            time: 1_500_000_000,
            bits: 0x1803_1abc,
            nonce: 42,
        };
        let mut encoder = Encoder::new();
        header.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(header.hash(), sha256d(&bytes));

        let mut decoder = Decoder::new(&bytes);
        let decoded = BlockHeader::consensus_decode_from(&mut decoder).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn empty_block_roundtrip() {
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            txs: Vec::new(),
        };
        let bytes = block.consensus_encode();
        assert_eq!(Block::consensus_decode(&bytes).expect("decode"), block);
    }
}
