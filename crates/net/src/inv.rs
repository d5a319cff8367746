//! Inventory vectors.

use std::fmt;

use bchd_consensus::{hash256_to_hex, Hash256, ZERO_HASH};
use bchd_primitives::{DecodeError, Decoder, Encoder};

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_THINBLOCK: u32 = 4;
pub const MSG_XTHINBLOCK: u32 = 5;
pub const MSG_GRAPHENEBLOCK: u32 = 6;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Inv {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl Inv {
    pub fn new(inv_type: u32, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH
    }

    pub fn is_known_type(&self) -> bool {
        matches!(
            self.inv_type,
            MSG_TX | MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_THINBLOCK | MSG_XTHINBLOCK
                | MSG_GRAPHENEBLOCK
        )
    }

    /// True for every inventory type that resolves to block data.
    pub fn is_block_type(&self) -> bool {
        matches!(
            self.inv_type,
            MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_THINBLOCK | MSG_XTHINBLOCK | MSG_GRAPHENEBLOCK
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self.inv_type {
            MSG_TX => "tx",
            MSG_BLOCK => "block",
            MSG_FILTERED_BLOCK => "filtered block",
            MSG_THINBLOCK => "thinblock",
            MSG_XTHINBLOCK => "xthinblock",
            MSG_GRAPHENEBLOCK => "grapheneblock",
            _ => "unknown",
        }
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.inv_type);
        encoder.write_hash_le(&self.hash);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            inv_type: decoder.read_u32_le()?,
            hash: decoder.read_hash()?,
        })
    }
}

impl fmt::Display for Inv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_name(), hash256_to_hex(&self.hash))
    }
}

pub fn encode_inv_list(invs: &[Inv]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(1 + invs.len() * 36);
    encoder.write_varint(invs.len() as u64);
    for inv in invs {
        inv.consensus_encode_to(&mut encoder);
    }
    encoder.into_inner()
}

pub fn decode_inv_list(decoder: &mut Decoder<'_>, max: usize) -> Result<Vec<Inv>, DecodeError> {
    let count = decoder.read_varint_max(max as u64)? as usize;
    let mut invs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        invs.push(Inv::consensus_decode_from(decoder)?);
    }
    Ok(invs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_list_roundtrip() {
        let invs = vec![Inv::new(MSG_TX, [1u8; 32]), Inv::new(MSG_BLOCK, [2u8; 32])];
        let bytes = encode_inv_list(&invs);
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decode_inv_list(&mut decoder, 50_000).unwrap(), invs);
    }

    #[test]
    fn oversized_list_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_varint(100);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            decode_inv_list(&mut decoder, 10),
            Err(DecodeError::SizeTooLarge)
        );
    }
}
