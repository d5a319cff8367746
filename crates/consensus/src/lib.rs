//! Chain parameters and protocol-wide constants.

pub mod params;
pub mod protocol;

pub use params::{chain_params, ChainParams, ConsensusParams, Network};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn hash256_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[i * 2] as char).to_digit(16)? as u8;
        let low = (bytes[i * 2 + 1] as char).to_digit(16)? as u8;
        // display order is big-endian; flip into internal order
        out[31 - i] = high << 4 | low;
    }
    Some(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_reverses_byte_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(hash256_from_hex("abcd").is_none());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_none());
    }
}
