//! The 24-byte message framing layer.

use bchd_consensus::protocol::{COMMAND_SIZE, MAX_MESSAGE_SIZE};
use bchd_primitives::sha256d;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

pub const HEADER_SIZE: usize = 24;

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A parsed frame header. Magic, command validity and checksum are checked
/// by the receive pump, not here, because each failure has a different
/// consequence.
#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Self {
            magic,
            command,
            length,
            checksum,
        }
    }

    /// The command must be printable ascii, NUL-padded with no embedded
    /// NULs, and the length within protocol bounds.
    pub fn command_str(&self) -> Result<&str, NetError> {
        let end = self
            .command
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_SIZE);
        if self.command[end..].iter().any(|byte| *byte != 0) {
            return Err(NetError::BadHeader("command has embedded NUL"));
        }
        let command = &self.command[..end];
        if command.is_empty() || !command.iter().all(|byte| byte.is_ascii_graphic()) {
            return Err(NetError::BadHeader("command is not printable ascii"));
        }
        // command bytes were just checked to be ascii
        Ok(std::str::from_utf8(command).unwrap_or_default())
    }
}

pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<MessageHeader, NetError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes).await?;
    Ok(MessageHeader::parse(&bytes))
}

pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: &MessageHeader,
) -> Result<Vec<u8>, NetError> {
    let length = header.length as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(NetError::OversizeFrame(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub fn build_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_SIZE];
    let name = command.as_bytes();
    command_bytes[..name.len().min(COMMAND_SIZE)]
        .copy_from_slice(&name[..name.len().min(COMMAND_SIZE)]);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload));
    frame.extend_from_slice(payload);
    frame
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<usize, NetError> {
    let frame = build_frame(magic, command, payload);
    writer.write_all(&frame).await?;
    Ok(frame.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let magic = [0xe3, 0xe1, 0xf3, 0xe8];
        let frame = build_frame(magic, "ping", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut reader = frame.as_slice();
        let header = read_header(&mut reader).await.expect("header");
        assert_eq!(header.magic, magic);
        assert_eq!(header.command_str().expect("command"), "ping");
        let payload = read_payload(&mut reader, &header).await.expect("payload");
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(header.checksum, checksum(&payload));
    }

    #[tokio::test]
    async fn oversize_length_is_an_error() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[4] = b'x';
        bytes[16..20].copy_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());
        let header = MessageHeader::parse(&bytes);
        let mut reader: &[u8] = &[];
        match read_payload(&mut reader, &header).await {
            Err(NetError::OversizeFrame(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn embedded_nul_in_command_is_invalid() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[4] = b'a';
        bytes[5] = 0;
        bytes[6] = b'b';
        let header = MessageHeader::parse(&bytes);
        assert!(header.command_str().is_err());
    }
}
