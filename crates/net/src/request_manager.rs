//! The shared scheduler for block and transaction fetches.
//!
//! Lock order: the main lock, when needed, is always taken before this
//! component's internal lock.

use std::collections::{HashMap, HashSet, VecDeque};

use bchd_consensus::protocol::BLK_REQ_RETRY_INTERVAL_USEC;
use bchd_consensus::Hash256;
use log::{debug, trace};

use std::sync::Mutex;

use crate::context::MainState;
use crate::inv::{Inv, MSG_BLOCK, MSG_TX};
use crate::peer::{Peer, PeerId};

/// A block request that stays unanswered this long costs the peer its
/// connection.
pub const BLOCK_DOWNLOAD_TIMEOUT_USEC: i64 = 10 * BLK_REQ_RETRY_INTERVAL_USEC;

#[derive(Debug, Default)]
struct BlockInFlight {
    peers: HashSet<PeerId>,
    last_request_usec: i64,
}

#[derive(Debug)]
struct TxRequest {
    /// Candidate sources in announcement order with their earliest ask
    /// times; re-requests walk down this list.
    sources: VecDeque<(PeerId, i64)>,
    outstanding: Option<(PeerId, i64)>,
}

#[derive(Default)]
struct RequestState {
    blocks_in_flight: HashMap<Hash256, BlockInFlight>,
    per_peer_in_flight: HashMap<PeerId, usize>,
    block_sources: HashMap<Hash256, VecDeque<PeerId>>,
    tx_requests: HashMap<Hash256, TxRequest>,
}

impl RequestState {
    fn inc_in_flight(&mut self, peer: PeerId) {
        *self.per_peer_in_flight.entry(peer).or_insert(0) += 1;
    }

    fn dec_in_flight(&mut self, peer: PeerId) {
        if let Some(count) = self.per_peer_in_flight.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Default)]
pub struct RequestManager {
    inner: Mutex<RequestState>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn initialize_peer(&self, id: PeerId) {
        self.lock().per_peer_in_flight.entry(id).or_insert(0);
    }

    /// Erase a departing peer everywhere. Blocks it was carrying get their
    /// request times reset so another peer can pick them up immediately.
    pub fn remove_peer(&self, id: PeerId) {
        let mut state = self.lock();
        state.per_peer_in_flight.remove(&id);
        state.blocks_in_flight.retain(|_, flight| {
            if flight.peers.remove(&id) {
                flight.last_request_usec = 0;
            }
            !flight.peers.is_empty()
        });
        for sources in state.block_sources.values_mut() {
            sources.retain(|source| *source != id);
        }
        state.block_sources.retain(|_, sources| !sources.is_empty());
        for request in state.tx_requests.values_mut() {
            request.sources.retain(|(source, _)| *source != id);
            if matches!(request.outstanding, Some((peer, _)) if peer == id) {
                request.outstanding = None;
            }
        }
        state
            .tx_requests
            .retain(|_, request| !request.sources.is_empty() || request.outstanding.is_some());
    }

    pub fn blocks_in_flight_is_empty(&self) -> bool {
        self.lock().blocks_in_flight.is_empty()
    }

    pub fn clear_blocks_in_flight(&self) {
        let mut state = self.lock();
        state.blocks_in_flight.clear();
        state.per_peer_in_flight.clear();
    }

    pub fn blocks_in_flight_for(&self, id: PeerId) -> Vec<Hash256> {
        let state = self.lock();
        state
            .blocks_in_flight
            .iter()
            .filter(|(_, flight)| flight.peers.contains(&id))
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn num_blocks_in_flight(&self, id: PeerId) -> usize {
        self.lock().per_peer_in_flight.get(&id).copied().unwrap_or(0)
    }

    pub fn block_in_flight(&self, hash: &Hash256) -> bool {
        self.lock().blocks_in_flight.contains_key(hash)
    }

    /// Every peer listed for an in-flight block, for invariant checks.
    pub fn in_flight_peers(&self) -> Vec<(Hash256, Vec<PeerId>)> {
        self.lock()
            .blocks_in_flight
            .iter()
            .map(|(hash, flight)| (*hash, flight.peers.iter().copied().collect()))
            .collect()
    }

    /// Register interest in an inventory item from `peer`. Returns the
    /// peer a `getdata` should go to right now, if any.
    pub fn ask_for(
        &self,
        inv: &Inv,
        peer: &Peer,
        now_usec: i64,
    ) -> Option<PeerId> {
        match inv.inv_type {
            MSG_BLOCK => self.ask_for_block(inv.hash, peer, now_usec),
            MSG_TX => self.ask_for_tx(inv.hash, peer, now_usec),
            _ => None,
        }
    }

    fn ask_for_block(&self, hash: Hash256, peer: &Peer, now_usec: i64) -> Option<PeerId> {
        let cap = peer.max_blocks_in_transit.load(std::sync::atomic::Ordering::Relaxed);
        let mut state = self.lock();
        let sources = state.block_sources.entry(hash).or_default();
        if !sources.contains(&peer.id) {
            sources.push_back(peer.id);
        }
        if let Some(flight) = state.blocks_in_flight.get(&hash) {
            if now_usec - flight.last_request_usec < BLK_REQ_RETRY_INTERVAL_USEC {
                return None; // one source at a time until the retry window
            }
            if flight.peers.contains(&peer.id) {
                return None;
            }
        }
        let in_flight = state.per_peer_in_flight.get(&peer.id).copied().unwrap_or(0);
        if in_flight >= cap {
            return None;
        }
        let flight = state.blocks_in_flight.entry(hash).or_default();
        flight.peers.insert(peer.id);
        flight.last_request_usec = now_usec;
        state.inc_in_flight(peer.id);
        trace!("block {} requested from peer {}", bchd_consensus::hash256_to_hex(&hash), peer.id);
        Some(peer.id)
    }

    fn ask_for_tx(&self, hash: Hash256, peer: &Peer, now_usec: i64) -> Option<PeerId> {
        let mut state = self.lock();
        let request = state.tx_requests.entry(hash).or_insert_with(|| TxRequest {
            sources: VecDeque::new(),
            outstanding: None,
        });
        if request
            .sources
            .iter()
            .any(|(source, _)| *source == peer.id)
        {
            return None;
        }
        // later announcers are staggered one retry interval apart
        let earliest = now_usec + request.sources.len() as i64 * BLK_REQ_RETRY_INTERVAL_USEC;
        request.sources.push_back((peer.id, earliest));
        if request.outstanding.is_none() {
            request.outstanding = Some((peer.id, now_usec));
            return Some(peer.id);
        }
        None
    }

    /// The item arrived (or entered the admission queue); stop tracking.
    pub fn received(&self, inv: &Inv, peer: PeerId) {
        let mut state = self.lock();
        match inv.inv_type {
            MSG_BLOCK => {
                if let Some(flight) = state.blocks_in_flight.remove(&inv.hash) {
                    for carrier in &flight.peers {
                        let carrier = *carrier;
                        state.dec_in_flight(carrier);
                    }
                }
                state.block_sources.remove(&inv.hash);
                let _ = peer;
            }
            MSG_TX => {
                state.tx_requests.remove(&inv.hash);
            }
            _ => {}
        }
    }

    /// The transaction is being validated; equivalent to received for
    /// scheduling purposes.
    pub fn processing(&self, inv: &Inv, peer: PeerId) {
        self.received(inv, peer);
    }

    /// Response-time accounting hook; scheduling already settled in
    /// `processing`.
    pub fn update_txn_response_time(&self, _inv: &Inv, _peer: PeerId) {}

    /// A peer REJECTed our request; drop it as a source so the same bad
    /// provider is not asked again.
    pub fn rejected(&self, inv: &Inv, peer: PeerId, code: u8) {
        debug!("reject {} code {code:#x} from peer {peer}", inv);
        let mut state = self.lock();
        match inv.inv_type {
            MSG_BLOCK => {
                if let Some(flight) = state.blocks_in_flight.get_mut(&inv.hash) {
                    if flight.peers.remove(&peer) {
                        flight.last_request_usec = 0;
                    }
                }
                if let Some(sources) = state.block_sources.get_mut(&inv.hash) {
                    sources.retain(|source| *source != peer);
                }
                state.dec_in_flight(peer);
            }
            MSG_TX => {
                if let Some(request) = state.tx_requests.get_mut(&inv.hash) {
                    request.sources.retain(|(source, _)| *source != peer);
                    if matches!(request.outstanding, Some((out, _)) if out == peer) {
                        request.outstanding = None;
                    }
                }
            }
            _ => {}
        }
    }

    /// Overdue transaction requests that should move to their next source.
    pub fn due_tx_requests(&self, now_usec: i64) -> Vec<(PeerId, Inv)> {
        let mut actions = Vec::new();
        let mut state = self.lock();
        for (hash, request) in state.tx_requests.iter_mut() {
            let expired = match request.outstanding {
                Some((_, asked)) => now_usec - asked >= BLK_REQ_RETRY_INTERVAL_USEC,
                None => true,
            };
            if !expired {
                continue;
            }
            let previous = request.outstanding.map(|(peer, _)| peer);
            if let Some(peer) = previous {
                request.sources.retain(|(source, _)| *source != peer);
            }
            let next = request
                .sources
                .iter()
                .find(|(_, earliest)| *earliest <= now_usec)
                .map(|(peer, _)| *peer);
            if let Some(peer) = next {
                request.outstanding = Some((peer, now_usec));
                actions.push((peer, Inv::new(MSG_TX, *hash)));
            } else {
                request.outstanding = None;
            }
        }
        state
            .tx_requests
            .retain(|_, request| !request.sources.is_empty() || request.outstanding.is_some());
        actions
    }

    /// True when a block assigned to this peer has exceeded the download
    /// timeout. Whitelisted peers are never disconnected for slowness.
    pub fn has_download_timeout(&self, peer: &Peer, now_usec: i64) -> bool {
        if peer.whitelisted {
            return false;
        }
        let state = self.lock();
        state.blocks_in_flight.iter().any(|(_, flight)| {
            flight.peers.contains(&peer.id)
                && flight.last_request_usec > 0
                && now_usec - flight.last_request_usec > BLOCK_DOWNLOAD_TIMEOUT_USEC
        })
    }

    /// Walk the peer's best-known chain from the last common block and
    /// pick the next bodies to fetch, bounded by the download window and
    /// the peer's in-transit cap. Called from the send pump with the main
    /// lock held.
    pub fn request_next_blocks_to_download(
        &self,
        main: &mut MainState,
        peer: &Peer,
        window: usize,
        now_usec: i64,
    ) -> Vec<Inv> {
        main.process_block_availability(peer.id);

        let Some(tip) = main.active.tip() else {
            return Vec::new();
        };
        let Some(state) = main.peer_states.get(&peer.id) else {
            return Vec::new();
        };
        let Some(best) = state.best_known_block else {
            return Vec::new();
        };
        if main.block_index.get(best).chain_work < main.block_index.get(tip).chain_work {
            return Vec::new(); // this peer has nothing useful
        }

        // establish the deepest shared block on the peer's chain
        let last_common = match state.last_common_block {
            Some(common) => common,
            None => {
                let start = main
                    .block_index
                    .get(best)
                    .height
                    .min(main.block_index.get(tip).height);
                let mut walk = main.block_index.ancestor(best, start).unwrap_or(best);
                while !main.active.contains(&main.block_index, walk) {
                    match main.block_index.get(walk).parent {
                        Some(parent) => walk = parent,
                        None => break,
                    }
                }
                walk
            }
        };

        let cap = peer
            .max_blocks_in_transit
            .load(std::sync::atomic::Ordering::Relaxed);
        let best_height = main.block_index.get(best).height;
        let mut fetch_height = main.block_index.get(last_common).height;
        let window_end = fetch_height + window as i32;
        let mut new_common = last_common;
        let mut to_fetch = Vec::new();
        let mut contiguous = true;

        {
            let mut state_lock = self.lock();
            let mut in_flight = state_lock
                .per_peer_in_flight
                .get(&peer.id)
                .copied()
                .unwrap_or(0);
            while fetch_height < best_height && fetch_height < window_end {
                fetch_height += 1;
                let Some(candidate) = main.block_index.ancestor(best, fetch_height) else {
                    break;
                };
                let entry = main.block_index.get(candidate);
                if entry.have_data() {
                    if contiguous {
                        new_common = candidate;
                    }
                    continue;
                }
                contiguous = false;
                let hash = entry.hash;
                if state_lock.blocks_in_flight.contains_key(&hash) {
                    continue;
                }
                if in_flight >= cap {
                    break;
                }
                let flight = state_lock.blocks_in_flight.entry(hash).or_default();
                flight.peers.insert(peer.id);
                flight.last_request_usec = now_usec;
                state_lock.inc_in_flight(peer.id);
                in_flight += 1;
                to_fetch.push(Inv::new(MSG_BLOCK, hash));
            }
        }

        if let Some(state) = main.peer_states.get_mut(&peer.id) {
            state.last_common_block = Some(new_common);
        }
        to_fetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockIndex, STATUS_HAVE_DATA};
    use bchd_primitives::BlockHeader;

    fn peer(id: PeerId) -> std::sync::Arc<Peer> {
        Peer::new(id, "127.0.0.1:0".parse().unwrap(), false, false, 0).0
    }

    fn header_chain(count: usize) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut prev = [0u8; 32];
        for i in 0..count {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [i as u8; 32],
                time: 1_500_000_000 + i as u32 * 600,
                bits: 0x207fffff,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn block_ask_is_single_source_until_retry() {
        let requester = RequestManager::new();
        let first = peer(1);
        let second = peer(2);
        requester.initialize_peer(1);
        requester.initialize_peer(2);
        let inv = Inv::new(MSG_BLOCK, [9; 32]);
        assert_eq!(requester.ask_for(&inv, &first, 1_000), Some(1));
        assert_eq!(requester.ask_for(&inv, &second, 2_000), None);
        let after_retry = 1_000 + BLK_REQ_RETRY_INTERVAL_USEC;
        assert_eq!(requester.ask_for(&inv, &second, after_retry), Some(2));
        assert_eq!(requester.num_blocks_in_flight(1), 1);
        assert_eq!(requester.num_blocks_in_flight(2), 1);
    }

    #[test]
    fn peer_removal_resets_block_requests() {
        let requester = RequestManager::new();
        let first = peer(1);
        let second = peer(2);
        requester.initialize_peer(1);
        requester.initialize_peer(2);
        let inv = Inv::new(MSG_BLOCK, [9; 32]);
        requester.ask_for(&inv, &first, 1_000);
        requester.remove_peer(1);
        assert!(requester.blocks_in_flight_is_empty());
        // immediately eligible again, no retry wait
        assert_eq!(requester.ask_for(&inv, &second, 1_001), Some(2));
    }

    #[test]
    fn tx_sources_rotate_on_timeout() {
        let requester = RequestManager::new();
        let first = peer(1);
        let second = peer(2);
        requester.initialize_peer(1);
        requester.initialize_peer(2);
        let inv = Inv::new(MSG_TX, [7; 32]);
        assert_eq!(requester.ask_for(&inv, &first, 0), Some(1));
        assert_eq!(requester.ask_for(&inv, &second, 0), None);
        assert!(requester.due_tx_requests(1_000).is_empty());
        let due = requester.due_tx_requests(2 * BLK_REQ_RETRY_INTERVAL_USEC);
        assert_eq!(due, vec![(2, inv)]);
        // received stops the rotation
        requester.received(&inv, 2);
        assert!(requester
            .due_tx_requests(10 * BLK_REQ_RETRY_INTERVAL_USEC)
            .is_empty());
    }

    #[test]
    fn next_blocks_walk_window_and_respect_cap() {
        let mut main = MainState::new();
        let mut index = BlockIndex::new();
        let ids: Vec<_> = header_chain(10)
            .into_iter()
            .map(|h| index.insert_header(h).unwrap())
            .collect();
        index.set_status(ids[0], STATUS_HAVE_DATA);
        main.block_index = index;
        main.active.set_tip(&main.block_index, ids[0]);
        main.initialize_peer(1);
        main.peer_state_mut(1).unwrap().best_known_block = Some(ids[9]);

        let requester = RequestManager::new();
        requester.initialize_peer(1);
        let downloader = peer(1);
        downloader
            .max_blocks_in_transit
            .store(4, std::sync::atomic::Ordering::Relaxed);
        let fetch = requester.request_next_blocks_to_download(&mut main, &downloader, 100, 0);
        assert_eq!(fetch.len(), 4);
        assert_eq!(requester.num_blocks_in_flight(1), 4);
        // oldest first
        let first_hash = main.block_index.get(ids[1]).hash;
        assert_eq!(fetch[0].hash, first_hash);
        // a second call adds nothing while the cap is full
        let again = requester.request_next_blocks_to_download(&mut main, &downloader, 100, 0);
        assert!(again.is_empty());
    }
}
