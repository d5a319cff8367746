//! The per-connection peer record and the connection registry.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::sync::{Arc, Mutex};

use bchd_consensus::protocol::{DEFAULT_MAX_BLOCKS_IN_TRANSIT, NODE_NETWORK, NODE_XTHIN};
use bchd_consensus::Hash256;
use log::trace;
use tokio::sync::mpsc;

use crate::bloom::{BloomFilter, RollingBloom};
use crate::inv::{Inv, MSG_TX};
use crate::message::{NetMessage, TimedNetAddress};
use crate::thin::ThinFlight;

pub type PeerId = u64;

const KNOWN_INVENTORY_CAPACITY: usize = 50_000;
const KNOWN_ADDRESS_CAPACITY: usize = 5_000;
const MAX_ADDR_TO_SEND: usize = 1_000;

/// A payload already serialized for the writer task. `PushMessage` encodes
/// once and enqueues; the writer frames and writes in enqueue order.
#[derive(Debug)]
pub struct OutboundMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub whitelisted: bool,
    pub one_shot: bool,
    pub feeler: bool,
    pub time_connected: i64,

    // handshake
    pub version_sent_at: AtomicI64,
    pub verack_sent: AtomicBool,
    pub bu_version_sent: AtomicBool,
    pub successfully_connected: AtomicBool,
    pub proto_version: AtomicI32,
    pub services: AtomicU64,
    pub start_height: AtomicI32,
    pub time_offset: AtomicI64,
    pub relay_txes: AtomicBool,
    pub subversion: Mutex<String>,
    pub addr_local: Mutex<Option<SocketAddr>>,

    // capabilities
    pub supports_compact_blocks: AtomicBool,
    pub xthin_bloom_filter_size: AtomicU32,
    pub addr_from_port: AtomicU32,
    pub expedited_blocks_to: AtomicBool,
    pub expedited_upstream: AtomicBool,

    // addr bookkeeping
    pub sent_addr: AtomicBool,
    pub asked_for_addrs: AtomicBool,

    // queues
    pub inv_to_send: Mutex<Vec<Inv>>,
    pub blockhashes_to_announce: Mutex<Vec<Hash256>>,
    pub addr_to_send: Mutex<Vec<TimedNetAddress>>,
    pub addr_known: Mutex<RollingBloom>,
    pub inventory_known: Mutex<RollingBloom>,
    pub filter: Mutex<Option<BloomFilter>>,
    /// Mempool filter the peer supplied with its last get_xthin.
    pub thin_filter: Mutex<Option<BloomFilter>>,
    /// Nonces of graphene blocks we served, for follow-up tx requests.
    pub graphene_sent_nonce: Mutex<HashMap<Hash256, u64>>,
    pub hash_continue: Mutex<Option<Hash256>>,
    pub get_data_backlog: Mutex<VecDeque<Inv>>,

    // ping state (microseconds)
    pub ping_nonce_sent: AtomicU64,
    pub ping_usec_start: AtomicI64,
    pub min_ping_usec: AtomicI64,
    pub ping_queued: AtomicBool,
    pub next_addr_send: AtomicI64,
    pub next_local_addr_send: AtomicI64,

    // counters
    pub misbehavior: AtomicI32,
    pub activity_bytes: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub blocks_sent: AtomicU64,
    pub txs_sent: AtomicU64,
    pub get_xthin_rate: Mutex<GetXthinRate>,

    pub max_blocks_in_transit: AtomicUsize,

    // compact-relay reconstruction state
    pub thin_in_flight: Mutex<HashMap<Hash256, ThinFlight>>,
    pub graphene_in_flight: Mutex<HashMap<Hash256, ThinFlight>>,

    pub disconnect: AtomicBool,
    pub disconnect_request: AtomicBool,

    send_size: AtomicUsize,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GetXthinRate {
    pub count: f64,
    pub last_time: i64,
}

impl Peer {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        inbound: bool,
        whitelisted: bool,
        now: i64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            addr,
            inbound,
            whitelisted,
            one_shot: false,
            feeler: false,
            time_connected: now,
            version_sent_at: AtomicI64::new(-1),
            verack_sent: AtomicBool::new(false),
            bu_version_sent: AtomicBool::new(false),
            successfully_connected: AtomicBool::new(false),
            proto_version: AtomicI32::new(0),
            services: AtomicU64::new(0),
            start_height: AtomicI32::new(-1),
            time_offset: AtomicI64::new(0),
            relay_txes: AtomicBool::new(false),
            subversion: Mutex::new(String::new()),
            addr_local: Mutex::new(None),
            supports_compact_blocks: AtomicBool::new(false),
            xthin_bloom_filter_size: AtomicU32::new(0),
            addr_from_port: AtomicU32::new(0),
            expedited_blocks_to: AtomicBool::new(false),
            expedited_upstream: AtomicBool::new(false),
            sent_addr: AtomicBool::new(false),
            asked_for_addrs: AtomicBool::new(false),
            inv_to_send: Mutex::new(Vec::new()),
            blockhashes_to_announce: Mutex::new(Vec::new()),
            addr_to_send: Mutex::new(Vec::new()),
            addr_known: Mutex::new(RollingBloom::new(KNOWN_ADDRESS_CAPACITY)),
            inventory_known: Mutex::new(RollingBloom::new(KNOWN_INVENTORY_CAPACITY)),
            filter: Mutex::new(None),
            thin_filter: Mutex::new(None),
            graphene_sent_nonce: Mutex::new(HashMap::new()),
            hash_continue: Mutex::new(None),
            get_data_backlog: Mutex::new(VecDeque::new()),
            ping_nonce_sent: AtomicU64::new(0),
            ping_usec_start: AtomicI64::new(0),
            min_ping_usec: AtomicI64::new(i64::MAX),
            ping_queued: AtomicBool::new(false),
            next_addr_send: AtomicI64::new(0),
            next_local_addr_send: AtomicI64::new(0),
            misbehavior: AtomicI32::new(0),
            activity_bytes: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            blocks_sent: AtomicU64::new(0),
            txs_sent: AtomicU64::new(0),
            get_xthin_rate: Mutex::new(GetXthinRate::default()),
            max_blocks_in_transit: AtomicUsize::new(DEFAULT_MAX_BLOCKS_IN_TRANSIT),
            thin_in_flight: Mutex::new(HashMap::new()),
            graphene_in_flight: Mutex::new(HashMap::new()),
            disconnect: AtomicBool::new(false),
            disconnect_request: AtomicBool::new(false),
            send_size: AtomicUsize::new(0),
            outbound,
        });
        (peer, rx)
    }

    pub fn log_name(&self) -> String {
        format!("{} ({})", self.addr, self.id)
    }

    pub fn is_client(&self) -> bool {
        self.services.load(Ordering::Relaxed) & NODE_NETWORK == 0
    }

    pub fn thin_block_capable(&self) -> bool {
        self.services.load(Ordering::Relaxed) & NODE_XTHIN != 0
    }

    pub fn send_size(&self) -> usize {
        self.send_size.load(Ordering::Relaxed)
    }

    pub fn note_sent(&self, bytes: usize) {
        self.send_size.fetch_sub(bytes, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn note_activity(&self, bytes: usize) {
        self.activity_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Serialize and enqueue; the writer drains in order. Returns the
    /// framed size, zero once the writer is gone.
    pub fn push_message(&self, message: NetMessage) -> usize {
        let payload = message.encode_payload();
        let command = message.command().to_string();
        let size = payload.len() + crate::frame::HEADER_SIZE;
        trace!("push {} ({} bytes) to peer={}", command, payload.len(), self.log_name());
        self.send_size.fetch_add(size, Ordering::Relaxed);
        if self
            .outbound
            .send(OutboundMessage { command, payload })
            .is_err()
        {
            self.send_size.fetch_sub(size, Ordering::Relaxed);
            return 0;
        }
        size
    }

    pub fn push_inventory(&self, inv: Inv) {
        if inv.inv_type == MSG_TX {
            if let Ok(known) = self.inventory_known.lock() {
                if known.contains(&inv.hash) {
                    return;
                }
            }
        }
        if let Ok(mut queue) = self.inv_to_send.lock() {
            queue.push(inv);
        }
    }

    pub fn push_block_hash_to_announce(&self, hash: Hash256) {
        if let Ok(mut queue) = self.blockhashes_to_announce.lock() {
            queue.push(hash);
        }
    }

    pub fn push_address(&self, addr: TimedNetAddress) {
        if let Ok(mut queue) = self.addr_to_send.lock() {
            if queue.len() >= MAX_ADDR_TO_SEND {
                let slot = rand::random::<usize>() % queue.len();
                queue[slot] = addr;
            } else {
                queue.push(addr);
            }
        }
    }

    pub fn add_inventory_known(&self, inv: &Inv) {
        if let Ok(mut known) = self.inventory_known.lock() {
            known.insert(&inv.hash);
        }
    }

    pub fn add_address_known(&self, addr: &TimedNetAddress) {
        if let Ok(mut known) = self.addr_known.lock() {
            known.insert(&addr.addr.key());
        }
    }

    pub fn address_is_known(&self, addr: &TimedNetAddress) -> bool {
        self.addr_known
            .lock()
            .map(|known| known.contains(&addr.addr.key()))
            .unwrap_or(false)
    }

    /// Exponentially decayed get_xthin counter (10-minute half life).
    pub fn bump_get_xthin_rate(&self, now: i64) -> f64 {
        let Ok(mut rate) = self.get_xthin_rate.lock() else {
            return 0.0;
        };
        if rate.last_time <= 0 {
            rate.last_time = now;
        }
        let elapsed = (now - rate.last_time) as f64;
        rate.count = rate.count * (1.0_f64 - 1.0 / 600.0).powf(elapsed) + 1.0;
        rate.last_time = now;
        rate.count
    }

    pub fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Relaxed);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.id, peer);
        }
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().ok()?.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().ok()?.get(&id).cloned()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Arc<Peer>, mpsc::UnboundedReceiver<OutboundMessage>) {
        Peer::new(1, "127.0.0.1:8333".parse().unwrap(), false, false, 0)
    }

    #[test]
    fn push_message_preserves_order_and_send_size() {
        let (peer, mut rx) = test_peer();
        peer.push_message(NetMessage::Verack);
        peer.push_message(NetMessage::SendHeaders);
        assert_eq!(peer.send_size(), 2 * crate::frame::HEADER_SIZE);
        assert_eq!(rx.try_recv().unwrap().command, "verack");
        assert_eq!(rx.try_recv().unwrap().command, "sendheaders");
    }

    #[test]
    fn known_tx_inventory_is_suppressed() {
        let (peer, _rx) = test_peer();
        let inv = Inv::new(MSG_TX, [5u8; 32]);
        peer.add_inventory_known(&inv);
        peer.push_inventory(inv);
        assert!(peer.inv_to_send.lock().unwrap().is_empty());
        let block_inv = Inv::new(crate::inv::MSG_BLOCK, [5u8; 32]);
        peer.push_inventory(block_inv);
        assert_eq!(peer.inv_to_send.lock().unwrap().len(), 1);
    }

    #[test]
    fn get_xthin_rate_decays() {
        let (peer, _rx) = test_peer();
        let mut last = 0.0;
        for _ in 0..5 {
            last = peer.bump_get_xthin_rate(1_000);
        }
        assert!(last > 4.9 && last <= 5.0);
        let decayed = peer.bump_get_xthin_rate(1_000 + 600);
        assert!(decayed < last, "decay over one half-life");
    }
}
