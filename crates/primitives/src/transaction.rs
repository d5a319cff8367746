use bchd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const MAX_TX_INPUTS: u64 = 1_000_000;
const MAX_SCRIPT_BYTES: usize = 10_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.consensus_encode_to(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let tx = Self::consensus_decode_from(&mut decoder)?;
        Ok(tx)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_varint_max(MAX_TX_INPUTS)? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(4096));
        for _ in 0..input_count {
            let prevout = OutPoint::consensus_decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes(MAX_SCRIPT_BYTES)?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_varint_max(MAX_TX_INPUTS)? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(4096));
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes(MAX_SCRIPT_BYTES)?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([0x11; 32], 1),
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut {
                value: 50_0000_0000,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn truncated_tx_is_eof() {
        let tx = sample_tx();
        let mut bytes = tx.consensus_encode();
        bytes.truncate(bytes.len() - 3);
        assert_eq!(
            Transaction::consensus_decode(&bytes),
            Err(DecodeError::UnexpectedEof)
        );
    }
}
