//! Byte-level consensus serialization helpers.

use std::fmt;

use bchd_consensus::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The buffer ended before the stated length.
    UnexpectedEof,
    /// A declared size exceeds what the caller allows.
    SizeTooLarge,
    /// Structurally invalid data.
    Invalid(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of data"),
            DecodeError::SizeTooLarge => write!(f, "size too large"),
            DecodeError::Invalid(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    /// CompactSize.
    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.buf.push(value as u8);
        } else if value <= 0xffff {
            self.buf.push(0xfd);
            self.write_u16_le(value as u16);
        } else if value <= 0xffff_ffff {
            self.buf.push(0xfe);
            self.write_u32_le(value as u32);
        } else {
            self.buf.push(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    /// CompactSize.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let tag = self.read_u8()?;
        match tag {
            0xfd => Ok(self.read_u16_le()? as u64),
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => self.read_u64_le(),
            value => Ok(value as u64),
        }
    }

    /// CompactSize with a ceiling; a larger value is `SizeTooLarge`.
    pub fn read_varint_max(&mut self, max: u64) -> Result<u64, DecodeError> {
        let value = self.read_varint()?;
        if value > max {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self, max: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint_max(max as u64)? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_str(&mut self, max: usize) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes(max)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::Invalid("string is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries_roundtrip() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().unwrap(), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn truncated_read_is_eof() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn varint_max_is_size_too_large() {
        let mut encoder = Encoder::new();
        encoder.write_varint(5000);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_varint_max(1000), Err(DecodeError::SizeTooLarge));
    }

    #[test]
    fn var_str_roundtrip() {
        let mut encoder = Encoder::new();
        encoder.write_var_str("/bchd-rust:0.1.0/");
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_var_str(256).unwrap(), "/bchd-rust:0.1.0/");
    }
}
