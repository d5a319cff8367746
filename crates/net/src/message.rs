//! Typed wire messages.
//!
//! Every command the engine speaks is a variant of [`NetMessage`], so
//! serialization and dispatch are total over the protocol.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bchd_consensus::protocol::{
    MAX_REJECT_MESSAGE_LENGTH, MAX_SUBVERSION_LENGTH,
};
use bchd_consensus::Hash256;
use bchd_primitives::{Block, BlockHeader, DecodeError, Decoder, Encoder, PartialMerkleTree,
    Transaction};

use crate::bloom::BloomFilter;
use crate::inv::{decode_inv_list, encode_inv_list, Inv};
use crate::thin::{GrapheneBlock, ThinBlock, XThinBlock};

/// Decode ceilings chosen above the protocol limits so the handlers, not
/// the codec, get to charge misbehavior for oversized-but-parsable lists.
const DECODE_MAX_INV: usize = 100_000;
const DECODE_MAX_ADDR: usize = 50_000;
const DECODE_MAX_HEADERS: usize = 8_000;
const DECODE_MAX_LOCATOR: usize = 2_000;
const DECODE_MAX_SHORT_IDS: usize = 16_000_000;

pub mod reject_code {
    pub const MALFORMED: u8 = 0x01;
    pub const INVALID: u8 = 0x10;
    pub const OBSOLETE: u8 = 0x11;
    pub const DUPLICATE: u8 = 0x12;
    pub const NONSTANDARD: u8 = 0x40;
    pub const INSUFFICIENT_FEE: u8 = 0x42;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        Self {
            services,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_routable(&self) -> bool {
        !(self.ip.is_unspecified() || self.ip.is_loopback()) && self.port != 0
    }

    /// Stable bytes for the per-peer known-address filter.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(18);
        key.extend_from_slice(&self.ip_bytes());
        key.extend_from_slice(&self.port.to_be_bytes());
        key
    }

    fn ip_bytes(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        }
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip_bytes());
        encoder.write_bytes(&self.port.to_be_bytes());
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let services = decoder.read_u64_le()?;
        let ip_bytes = decoder.read_fixed::<16>()?;
        let port_bytes = decoder.read_fixed::<2>()?;
        let ip6 = Ipv6Addr::from(ip_bytes);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

/// An address entry as carried in `addr` messages (nTime prefix included;
/// every peer we keep is past CADDR_TIME_VERSION).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimedNetAddress {
    pub time: u32,
    pub addr: NetAddress,
}

impl TimedNetAddress {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.time);
        self.addr.consensus_encode_to(encoder);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            time: decoder.read_u32_le()?,
            addr: NetAddress::consensus_decode_from(decoder)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectPayload {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Present when `message` is `block` or `tx`.
    pub hash: Option<Hash256>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBlockPayload {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetMessage {
    Version(Box<VersionPayload>),
    Verack,
    BuVersion { addr_from_port: u16 },
    BuVerack,
    Addr(Vec<TimedNetAddress>),
    GetAddr,
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    NotFound(Vec<Inv>),
    GetBlocks { locator: Vec<Hash256>, stop: Hash256 },
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    Headers(Vec<BlockHeader>),
    Block(Block),
    MerkleBlock(MerkleBlockPayload),
    Tx(Transaction),
    Mempool,
    Ping(Option<u64>),
    Pong(Option<u64>),
    Reject(RejectPayload),
    SendHeaders,
    SendCmpct { high_bandwidth: bool, version: u64 },
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    FilterSizeXthin(u32),
    GetXthin { inv: Inv, mempool_filter: BloomFilter },
    XThinBlock(XThinBlock),
    ThinBlock(ThinBlock),
    GetXBlockTx { block_hash: Hash256, short_ids: Vec<u64> },
    XBlockTx { block_hash: Hash256, txs: Vec<Transaction> },
    GetGraphene { inv: Inv, mempool_tx_count: u64 },
    GrapheneBlock(GrapheneBlock),
    GetGrapheneTx { block_hash: Hash256, short_ids: Vec<u64> },
    GrapheneTx { block_hash: Hash256, txs: Vec<Transaction> },
    ExpeditedRequest { options: u64 },
    ExpeditedBlock { hops: u8, thin: XThinBlock },
    Unknown { command: String, payload: Vec<u8> },
}

impl NetMessage {
    pub fn command(&self) -> &str {
        match self {
            NetMessage::Version(_) => "version",
            NetMessage::Verack => "verack",
            NetMessage::BuVersion { .. } => "buversion",
            NetMessage::BuVerack => "buverack",
            NetMessage::Addr(_) => "addr",
            NetMessage::GetAddr => "getaddr",
            NetMessage::Inv(_) => "inv",
            NetMessage::GetData(_) => "getdata",
            NetMessage::NotFound(_) => "notfound",
            NetMessage::GetBlocks { .. } => "getblocks",
            NetMessage::GetHeaders { .. } => "getheaders",
            NetMessage::Headers(_) => "headers",
            NetMessage::Block(_) => "block",
            NetMessage::MerkleBlock(_) => "merkleblock",
            NetMessage::Tx(_) => "tx",
            NetMessage::Mempool => "mempool",
            NetMessage::Ping(_) => "ping",
            NetMessage::Pong(_) => "pong",
            NetMessage::Reject(_) => "reject",
            NetMessage::SendHeaders => "sendheaders",
            NetMessage::SendCmpct { .. } => "sendcmpct",
            NetMessage::FilterLoad(_) => "filterload",
            NetMessage::FilterAdd(_) => "filteradd",
            NetMessage::FilterClear => "filterclear",
            // the logical name exceeds the 12-byte command field; the
            // wire mnemonic is shortened
            NetMessage::FilterSizeXthin(_) => "filtersizext",
            NetMessage::GetXthin { .. } => "get_xthin",
            NetMessage::XThinBlock(_) => "xthinblock",
            NetMessage::ThinBlock(_) => "thinblock",
            NetMessage::GetXBlockTx { .. } => "get_xblocktx",
            NetMessage::XBlockTx { .. } => "xblocktx",
            NetMessage::GetGraphene { .. } => "get_graphene",
            NetMessage::GrapheneBlock(_) => "grapheneblk",
            NetMessage::GetGrapheneTx { .. } => "get_graphtx",
            NetMessage::GrapheneTx { .. } => "graphenetx",
            NetMessage::ExpeditedRequest { .. } => "xpeditedreq",
            NetMessage::ExpeditedBlock { .. } => "xpeditedblk",
            NetMessage::Unknown { command, .. } => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetMessage::Version(payload) => {
                encoder.write_i32_le(payload.version);
                encoder.write_u64_le(payload.services);
                encoder.write_i64_le(payload.timestamp);
                payload.addr_recv.consensus_encode_to(&mut encoder);
                payload.addr_from.consensus_encode_to(&mut encoder);
                encoder.write_u64_le(payload.nonce);
                encoder.write_var_str(&payload.user_agent);
                encoder.write_i32_le(payload.start_height);
                encoder.write_u8(payload.relay as u8);
            }
            NetMessage::Verack
            | NetMessage::BuVerack
            | NetMessage::GetAddr
            | NetMessage::Mempool
            | NetMessage::SendHeaders
            | NetMessage::FilterClear => {}
            NetMessage::BuVersion { addr_from_port } => {
                encoder.write_u16_le(*addr_from_port);
            }
            NetMessage::Addr(addrs) => {
                encoder.write_varint(addrs.len() as u64);
                for addr in addrs {
                    addr.consensus_encode_to(&mut encoder);
                }
            }
            NetMessage::Inv(invs) | NetMessage::GetData(invs) | NetMessage::NotFound(invs) => {
                return encode_inv_list(invs);
            }
            NetMessage::GetBlocks { locator, stop }
            | NetMessage::GetHeaders { locator, stop } => {
                encoder.write_i32_le(bchd_consensus::protocol::PROTOCOL_VERSION);
                encoder.write_varint(locator.len() as u64);
                for hash in locator {
                    encoder.write_hash_le(hash);
                }
                encoder.write_hash_le(stop);
            }
            NetMessage::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode_to(&mut encoder);
                    encoder.write_varint(0); // empty tx list
                }
            }
            NetMessage::Block(block) => return block.consensus_encode(),
            NetMessage::MerkleBlock(payload) => {
                payload.header.consensus_encode_to(&mut encoder);
                payload.tree.consensus_encode_to(&mut encoder);
            }
            NetMessage::Tx(tx) => return tx.consensus_encode(),
            NetMessage::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    encoder.write_u64_le(*nonce);
                }
            }
            NetMessage::Pong(nonce) => {
                if let Some(nonce) = nonce {
                    encoder.write_u64_le(*nonce);
                }
            }
            NetMessage::Reject(payload) => {
                encoder.write_var_str(&payload.message);
                encoder.write_u8(payload.code);
                encoder.write_var_str(&payload.reason);
                if let Some(hash) = &payload.hash {
                    encoder.write_hash_le(hash);
                }
            }
            NetMessage::SendCmpct {
                high_bandwidth,
                version,
            } => {
                encoder.write_u8(*high_bandwidth as u8);
                encoder.write_u64_le(*version);
            }
            NetMessage::FilterLoad(filter) => filter.consensus_encode_to(&mut encoder),
            NetMessage::FilterAdd(data) => encoder.write_var_bytes(data),
            NetMessage::FilterSizeXthin(size) => encoder.write_u32_le(*size),
            NetMessage::GetXthin {
                inv,
                mempool_filter,
            } => {
                inv.consensus_encode_to(&mut encoder);
                mempool_filter.consensus_encode_to(&mut encoder);
            }
            NetMessage::XThinBlock(thin) => thin.consensus_encode_to(&mut encoder),
            NetMessage::ThinBlock(thin) => thin.consensus_encode_to(&mut encoder),
            NetMessage::GetXBlockTx {
                block_hash,
                short_ids,
            }
            | NetMessage::GetGrapheneTx {
                block_hash,
                short_ids,
            } => {
                encoder.write_hash_le(block_hash);
                encoder.write_varint(short_ids.len() as u64);
                for id in short_ids {
                    encoder.write_u64_le(*id);
                }
            }
            NetMessage::XBlockTx { block_hash, txs }
            | NetMessage::GrapheneTx { block_hash, txs } => {
                encoder.write_hash_le(block_hash);
                encoder.write_varint(txs.len() as u64);
                for tx in txs {
                    tx.consensus_encode_to(&mut encoder);
                }
            }
            NetMessage::GetGraphene {
                inv,
                mempool_tx_count,
            } => {
                inv.consensus_encode_to(&mut encoder);
                encoder.write_u64_le(*mempool_tx_count);
            }
            NetMessage::GrapheneBlock(graphene) => graphene.consensus_encode_to(&mut encoder),
            NetMessage::ExpeditedRequest { options } => encoder.write_u64_le(*options),
            NetMessage::ExpeditedBlock { hops, thin } => {
                encoder.write_u8(*hops);
                thin.consensus_encode_to(&mut encoder);
            }
            NetMessage::Unknown { payload, .. } => return payload.clone(),
        }
        encoder.into_inner()
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<NetMessage, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => {
                let version = decoder.read_i32_le()?;
                let services = decoder.read_u64_le()?;
                let timestamp = decoder.read_i64_le()?;
                let addr_recv = NetAddress::consensus_decode_from(&mut decoder)?;
                // later fields are optional for ancient peers
                let mut parsed = VersionPayload {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from: NetAddress::unroutable(),
                    nonce: 1,
                    user_agent: String::new(),
                    start_height: 0,
                    relay: true,
                };
                if !decoder.is_empty() {
                    parsed.addr_from = NetAddress::consensus_decode_from(&mut decoder)?;
                    parsed.nonce = decoder.read_u64_le()?;
                }
                if !decoder.is_empty() {
                    parsed.user_agent = decoder.read_var_str(MAX_SUBVERSION_LENGTH)?;
                }
                if !decoder.is_empty() {
                    parsed.start_height = decoder.read_i32_le()?;
                }
                if !decoder.is_empty() {
                    parsed.relay = decoder.read_u8()? != 0;
                }
                NetMessage::Version(Box::new(parsed))
            }
            "verack" => NetMessage::Verack,
            "buversion" => NetMessage::BuVersion {
                addr_from_port: decoder.read_u16_le()?,
            },
            "buverack" => NetMessage::BuVerack,
            "addr" => {
                let count = decoder.read_varint_max(DECODE_MAX_ADDR as u64)? as usize;
                let mut addrs = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    addrs.push(TimedNetAddress::consensus_decode_from(&mut decoder)?);
                }
                NetMessage::Addr(addrs)
            }
            "getaddr" => NetMessage::GetAddr,
            "inv" => NetMessage::Inv(decode_inv_list(&mut decoder, DECODE_MAX_INV)?),
            "getdata" => NetMessage::GetData(decode_inv_list(&mut decoder, DECODE_MAX_INV)?),
            "notfound" => NetMessage::NotFound(decode_inv_list(&mut decoder, DECODE_MAX_INV)?),
            "getblocks" | "getheaders" => {
                let _version = decoder.read_i32_le()?;
                let count = decoder.read_varint_max(DECODE_MAX_LOCATOR as u64)? as usize;
                let mut locator = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    locator.push(decoder.read_hash()?);
                }
                let stop = decoder.read_hash()?;
                if command == "getblocks" {
                    NetMessage::GetBlocks { locator, stop }
                } else {
                    NetMessage::GetHeaders { locator, stop }
                }
            }
            "headers" => {
                let count = decoder.read_varint_max(DECODE_MAX_HEADERS as u64)? as usize;
                let mut headers = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
                    decoder.read_varint()?; // tx count; assumed zero
                }
                NetMessage::Headers(headers)
            }
            "block" => NetMessage::Block(Block::consensus_decode(payload)?),
            "merkleblock" => {
                let header = BlockHeader::consensus_decode_from(&mut decoder)?;
                let tree = PartialMerkleTree::consensus_decode_from(&mut decoder)?;
                NetMessage::MerkleBlock(MerkleBlockPayload { header, tree })
            }
            "tx" => NetMessage::Tx(Transaction::consensus_decode(payload)?),
            "mempool" => NetMessage::Mempool,
            "ping" => {
                if decoder.remaining() >= 8 {
                    NetMessage::Ping(Some(decoder.read_u64_le()?))
                } else {
                    NetMessage::Ping(None)
                }
            }
            "pong" => {
                if decoder.remaining() >= 8 {
                    NetMessage::Pong(Some(decoder.read_u64_le()?))
                } else {
                    NetMessage::Pong(None)
                }
            }
            "reject" => {
                let message = decoder.read_var_str(bchd_consensus::protocol::COMMAND_SIZE)?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str(MAX_REJECT_MESSAGE_LENGTH)?;
                let hash = if (message == "block" || message == "tx") && decoder.remaining() >= 32
                {
                    Some(decoder.read_hash()?)
                } else {
                    None
                };
                NetMessage::Reject(RejectPayload {
                    message,
                    code,
                    reason,
                    hash,
                })
            }
            "sendheaders" => NetMessage::SendHeaders,
            "sendcmpct" => NetMessage::SendCmpct {
                high_bandwidth: decoder.read_u8()? != 0,
                version: decoder.read_u64_le()?,
            },
            "filterload" => NetMessage::FilterLoad(BloomFilter::consensus_decode_from(
                &mut decoder,
            )?),
            "filteradd" => {
                // over-length elements are a handler concern, not a codec one
                NetMessage::FilterAdd(decoder.read_var_bytes(1 << 20)?)
            }
            "filterclear" => NetMessage::FilterClear,
            "filtersizext" => NetMessage::FilterSizeXthin(decoder.read_u32_le()?),
            "get_xthin" => NetMessage::GetXthin {
                inv: Inv::consensus_decode_from(&mut decoder)?,
                mempool_filter: BloomFilter::consensus_decode_from(&mut decoder)?,
            },
            "xthinblock" => NetMessage::XThinBlock(XThinBlock::consensus_decode_from(
                &mut decoder,
            )?),
            "thinblock" => NetMessage::ThinBlock(ThinBlock::consensus_decode_from(&mut decoder)?),
            "get_xblocktx" | "get_graphtx" => {
                let block_hash = decoder.read_hash()?;
                let count = decoder.read_varint_max(DECODE_MAX_SHORT_IDS as u64)? as usize;
                let mut short_ids = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    short_ids.push(decoder.read_u64_le()?);
                }
                if command == "get_xblocktx" {
                    NetMessage::GetXBlockTx {
                        block_hash,
                        short_ids,
                    }
                } else {
                    NetMessage::GetGrapheneTx {
                        block_hash,
                        short_ids,
                    }
                }
            }
            "xblocktx" | "graphenetx" => {
                let block_hash = decoder.read_hash()?;
                let count = decoder.read_varint_max(DECODE_MAX_SHORT_IDS as u64)? as usize;
                let mut txs = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    txs.push(Transaction::consensus_decode_from(&mut decoder)?);
                }
                if command == "xblocktx" {
                    NetMessage::XBlockTx { block_hash, txs }
                } else {
                    NetMessage::GrapheneTx { block_hash, txs }
                }
            }
            "get_graphene" => NetMessage::GetGraphene {
                inv: Inv::consensus_decode_from(&mut decoder)?,
                mempool_tx_count: decoder.read_u64_le()?,
            },
            "grapheneblk" => NetMessage::GrapheneBlock(GrapheneBlock::consensus_decode_from(
                &mut decoder,
            )?),
            "xpeditedreq" => NetMessage::ExpeditedRequest {
                options: decoder.read_u64_le()?,
            },
            "xpeditedblk" => NetMessage::ExpeditedBlock {
                hops: decoder.read_u8()?,
                thin: XThinBlock::consensus_decode_from(&mut decoder)?,
            },
            _ => NetMessage::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inv::{Inv, MSG_BLOCK, MSG_TX};

    fn roundtrip(message: NetMessage) {
        let command = message.command().to_string();
        let payload = message.encode_payload();
        let decoded = NetMessage::decode(&command, &payload).expect("decode");
        assert_eq!(decoded, message, "roundtrip failed for {command}");
    }

    #[test]
    fn every_simple_command_roundtrips() {
        let addr = NetAddress::new("10.1.2.3:8333".parse().unwrap(), 1);
        roundtrip(NetMessage::Version(Box::new(VersionPayload {
            version: 80003,
            services: 1,
            timestamp: 1_600_000_000,
            addr_recv: addr,
            addr_from: addr,
            nonce: 0xdead_beef,
            user_agent: "/bchd-rust:0.1.0/".to_string(),
            start_height: 123_456,
            relay: true,
        })));
        roundtrip(NetMessage::Verack);
        roundtrip(NetMessage::BuVersion {
            addr_from_port: 8333,
        });
        roundtrip(NetMessage::BuVerack);
        roundtrip(NetMessage::Addr(vec![TimedNetAddress {
            time: 1_600_000_000,
            addr,
        }]));
        roundtrip(NetMessage::GetAddr);
        roundtrip(NetMessage::Inv(vec![Inv::new(MSG_TX, [1; 32])]));
        roundtrip(NetMessage::GetData(vec![Inv::new(MSG_BLOCK, [2; 32])]));
        roundtrip(NetMessage::NotFound(vec![Inv::new(MSG_TX, [3; 32])]));
        roundtrip(NetMessage::GetBlocks {
            locator: vec![[4; 32], [5; 32]],
            stop: [0; 32],
        });
        roundtrip(NetMessage::GetHeaders {
            locator: vec![[6; 32]],
            stop: [7; 32],
        });
        roundtrip(NetMessage::Mempool);
        roundtrip(NetMessage::Ping(Some(7)));
        roundtrip(NetMessage::Ping(None));
        roundtrip(NetMessage::Pong(Some(7)));
        roundtrip(NetMessage::SendHeaders);
        roundtrip(NetMessage::SendCmpct {
            high_bandwidth: true,
            version: 1,
        });
        roundtrip(NetMessage::FilterClear);
        roundtrip(NetMessage::FilterAdd(vec![1, 2, 3]));
        roundtrip(NetMessage::FilterSizeXthin(16_000));
        roundtrip(NetMessage::GetXBlockTx {
            block_hash: [8; 32],
            short_ids: vec![1, 2, 3],
        });
        roundtrip(NetMessage::ExpeditedRequest { options: 1 });
        roundtrip(NetMessage::Reject(RejectPayload {
            message: "block".to_string(),
            code: reject_code::INVALID,
            reason: "bad".to_string(),
            hash: Some([9; 32]),
        }));
        roundtrip(NetMessage::Reject(RejectPayload {
            message: "version".to_string(),
            code: reject_code::DUPLICATE,
            reason: "dup".to_string(),
            hash: None,
        }));
    }

    #[test]
    fn headers_payload_carries_zero_tx_counts() {
        let header = BlockHeader {
            version: 4,
            prev_block: [0; 32],
            merkle_root: [1; 32],
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
        };
        let message = NetMessage::Headers(vec![header, header]);
        let payload = message.encode_payload();
        // CompactSize(2) + 2 * (80-byte header + CompactSize(0))
        assert_eq!(payload.len(), 1 + 2 * 81);
        roundtrip(message);
    }

    #[test]
    fn truncated_version_is_malformed() {
        let err = NetMessage::decode("version", &[1, 2, 3]).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof);
    }

    #[test]
    fn unknown_command_is_preserved() {
        let decoded = NetMessage::decode("frobnicate", &[0xaa]).unwrap();
        match decoded {
            NetMessage::Unknown { command, payload } => {
                assert_eq!(command, "frobnicate");
                assert_eq!(payload, vec![0xaa]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
