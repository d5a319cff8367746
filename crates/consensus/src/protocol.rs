//! Protocol versions, service bits and wire limits.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 80003;

/// Disconnect and ban peers older than this proto version.
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;

/// `addr` entries carry a 4-byte nTime prefix from this version onward.
pub const CADDR_TIME_VERSION: i32 = 31402;

/// BIP 0031: pings carry a nonce and expect a pong above this version.
pub const BIP0031_VERSION: i32 = 60000;

/// BIP 0111: peers at or above this version must not send filter messages
/// unless we advertise NODE_BLOOM.
pub const NO_BLOOM_VERSION: i32 = 70011;

/// BIP 0130: peers at or above this version understand `sendheaders`.
pub const SENDHEADERS_VERSION: i32 = 70012;

/// Expedited forwarding and the BUVERSION/BUVERACK exchange start here.
pub const EXPEDITED_VERSION: i32 = 80002;

pub const NODE_NETWORK: u64 = 1 << 0;
pub const NODE_BLOOM: u64 = 1 << 2;
pub const NODE_XTHIN: u64 = 1 << 4;

/// Maximum number of entries in an `inv`/`getdata` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum number of headers returned in one `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum number of block hashes announced per headers message before
/// falling back to inv.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Maximum inv entries flushed per send-pump pass.
pub const MAX_INV_TO_SEND: usize = 1_000;

/// Maximum `addr` entries per message; larger messages are misbehavior.
pub const MAX_ADDR_SZ: usize = 1_000;

/// Seconds to wait for a VERACK after sending VERSION.
pub const VERACK_TIMEOUT: i64 = 60;

/// Seconds allowed for the first headers batch after starting sync.
pub const INITIAL_HEADERS_TIMEOUT: i64 = 2 * 60;

/// Seconds an unconnected header may sit in the cache before expiry.
pub const UNCONNECTED_HEADERS_TIMEOUT: i64 = 120;

/// Bound on the unconnected-header cache.
pub const MAX_UNCONNECTED_HEADERS: usize = 256;

/// Seconds between automatic keepalive pings.
pub const PING_INTERVAL: i64 = 2 * 60;

/// Concurrent initial header syncs allowed during IBD.
pub const MAX_HEADER_REQS_DURING_IBD: usize = 3;

/// Once the tip is younger than this many seconds every peer may be asked
/// for headers, not just the designated sync peers.
pub const SINGLE_PEER_REQUEST_MODE_AGE: i64 = 6 * 60 * 60;

/// Default cap on blocks requested from a single peer at once.
pub const DEFAULT_MAX_BLOCKS_IN_TRANSIT: usize = 16;

/// Default look-ahead window for block downloads along the header chain.
pub const DEFAULT_BLOCK_DOWNLOAD_WINDOW: usize = 1_024;

/// Microseconds between re-requests of an unanswered block or tx.
pub const BLK_REQ_RETRY_INTERVAL_USEC: i64 = 10 * 1_000_000;

/// Maximum serialized payload accepted from the wire.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Command field width in the message header.
pub const COMMAND_SIZE: usize = 12;

/// Largest script element; also the cap on `filteradd` data.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Hard ceiling on a BIP37 filter's bit-field size in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Hash-function count ceiling for BIP37 filters.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

/// Smallest acceptable value a peer may advertise via `filtersizexthin`.
pub const SMALLEST_MAX_BLOOM_FILTER_SIZE: u32 = 16_000;

pub const MAX_SUBVERSION_LENGTH: usize = 256;
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;

/// Average delay between queued `addr` broadcasts (Poisson).
pub const AVG_ADDRESS_BROADCAST_INTERVAL: i64 = 30;

/// Average delay between advertising our own address (Poisson).
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: i64 = 24 * 60 * 60;
