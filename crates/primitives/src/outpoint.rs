use bchd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.txid);
        encoder.write_u32_le(self.vout);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            txid: decoder.read_hash()?,
            vout: decoder.read_u32_le()?,
        })
    }

    /// Serialized form, used as a bloom filter element.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(36);
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }
}
