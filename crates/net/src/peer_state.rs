//! Per-peer chain view, tracked under the main lock.

use log::{debug, warn};

use bchd_consensus::Hash256;

use crate::chain::BlockId;
use crate::context::MainState;
use crate::peer::{Peer, PeerId};
use crate::request_manager::RequestManager;

#[derive(Clone, Debug, Default)]
pub struct PeerChainState {
    /// Best header the peer is known to have, by most work.
    pub best_known_block: Option<BlockId>,
    /// A block the peer announced that we have not indexed yet.
    pub hash_last_unknown_block: Option<Hash256>,
    /// Deepest block on the active chain both sides are known to share.
    pub last_common_block: Option<BlockId>,
    /// Last header we delivered in a `headers` message.
    pub best_header_sent: Option<BlockId>,
    pub prefer_headers: bool,
    pub preferred_download: bool,
    pub sync_started: bool,
    pub sync_start_time: i64,
    pub first_headers_expected_height: i32,
    pub first_headers_received: bool,
    pub requested_initial_block_availability: bool,
}

impl MainState {
    pub fn initialize_peer(&mut self, id: PeerId) {
        self.peer_states.insert(id, PeerChainState::default());
    }

    pub fn peer_state(&self, id: PeerId) -> Option<&PeerChainState> {
        self.peer_states.get(&id)
    }

    pub fn peer_state_mut(&mut self, id: PeerId) -> Option<&mut PeerChainState> {
        self.peer_states.get_mut(&id)
    }

    /// A preferred download peer is a full-service peer that is neither
    /// one-shot nor header-only.
    pub fn update_preferred_download(&mut self, peer: &Peer) {
        let Some(state) = self.peer_states.get_mut(&peer.id) else {
            return;
        };
        self.preferred_download_count -= state.preferred_download as i32;
        state.preferred_download = !peer.one_shot && !peer.is_client();
        self.preferred_download_count += state.preferred_download as i32;
    }

    /// The peer has this header if it is an ancestor of its best known
    /// block or of the best header we sent it.
    pub fn peer_has_header(&self, id: PeerId, block: BlockId) -> bool {
        let Some(state) = self.peer_states.get(&id) else {
            return false;
        };
        let height = self.block_index.get(block).height;
        if let Some(best) = state.best_known_block {
            if self.block_index.ancestor(best, height) == Some(block) {
                return true;
            }
        }
        if let Some(sent) = state.best_header_sent {
            if self.block_index.ancestor(sent, height) == Some(block) {
                return true;
            }
        }
        false
    }

    /// Record that the peer announced `hash`; resolved to an index entry
    /// lazily by `process_block_availability`.
    pub fn update_block_availability(&mut self, id: PeerId, hash: Hash256) {
        self.process_block_availability(id);
        let known = self.block_index.lookup(&hash);
        let Some(state) = self.peer_states.get_mut(&id) else {
            return;
        };
        match known {
            Some(block) => {
                let work = self.block_index.get(block).chain_work;
                let better = match state.best_known_block {
                    Some(best) => self.block_index.get(best).chain_work <= work,
                    None => true,
                };
                if better {
                    state.best_known_block = Some(block);
                }
            }
            None => state.hash_last_unknown_block = Some(hash),
        }
    }

    /// If the last unknown announcement has since been indexed, fold it
    /// into best-known.
    pub fn process_block_availability(&mut self, id: PeerId) {
        let Some(state) = self.peer_states.get_mut(&id) else {
            return;
        };
        let Some(hash) = state.hash_last_unknown_block else {
            return;
        };
        if let Some(block) = self.block_index.lookup(&hash) {
            let work = self.block_index.get(block).chain_work;
            let better = match state.best_known_block {
                Some(best) => self.block_index.get(best).chain_work <= work,
                None => true,
            };
            if better {
                state.best_known_block = Some(block);
            }
            state.hash_last_unknown_block = None;
        }
    }

    /// Tear down a departing peer's chain state and its download slots.
    /// Its in-flight blocks become immediately re-requestable.
    pub fn finalize_peer(&mut self, id: PeerId, requester: &RequestManager) {
        let Some(state) = self.peer_states.remove(&id) else {
            warn!("finalize for unknown peer id {id}");
            return;
        };
        if state.sync_started {
            self.sync_started_count -= 1;
        }
        self.preferred_download_count -= state.preferred_download as i32;
        requester.remove_peer(id);

        if self.peer_states.is_empty() {
            // consistency check once the last peer is gone; force a
            // consistent state in production
            if !requester.blocks_in_flight_is_empty() {
                debug!("blocks in flight not empty after last peer removal");
                requester.clear_blocks_in_flight();
            }
            if self.preferred_download_count != 0 {
                debug!(
                    "preferred download count {} after last peer removal",
                    self.preferred_download_count
                );
                self.preferred_download_count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockIndex;
    use crate::peer::Peer;
    use bchd_consensus::protocol::NODE_NETWORK;
    use bchd_primitives::BlockHeader;
    use std::sync::atomic::Ordering;

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

    fn indexed_main(count: usize) -> (MainState, Vec<crate::chain::BlockId>) {
        let mut main = MainState::new();
        let mut index = BlockIndex::new();
        let ids: Vec<_> = header_chain(count)
            .into_iter()
            .map(|h| index.insert_header(h).unwrap())
            .collect();
        main.block_index = index;
        main.active.set_tip(&main.block_index, *ids.last().unwrap());
        (main, ids)
    }

    #[test]
    fn preferred_download_counts_stay_consistent() {
        let (mut main, _) = indexed_main(1);
        let (peer, _rx) = Peer::new(7, "1.2.3.4:8333".parse().unwrap(), false, false, 0);
        peer.services.store(NODE_NETWORK, Ordering::Relaxed);
        main.initialize_peer(7);
        main.update_preferred_download(&peer);
        assert_eq!(main.preferred_download_count, 1);
        // repeated updates do not double count
        main.update_preferred_download(&peer);
        assert_eq!(main.preferred_download_count, 1);

        let requester = RequestManager::new();
        requester.initialize_peer(7);
        main.finalize_peer(7, &requester);
        assert_eq!(main.preferred_download_count, 0);
        assert!(main.peer_states.is_empty());
    }

    #[test]
    fn unknown_block_availability_resolves_later() {
        let (mut main, ids) = indexed_main(3);
        main.initialize_peer(1);
        let unknown = [0xab; 32];
        main.update_block_availability(1, unknown);
        assert_eq!(
            main.peer_state(1).unwrap().hash_last_unknown_block,
            Some(unknown)
        );

        let known_hash = main.block_index.get(ids[2]).hash;
        main.update_block_availability(1, known_hash);
        assert_eq!(main.peer_state(1).unwrap().best_known_block, Some(ids[2]));
    }

    #[test]
    fn peer_has_header_checks_both_anchors() {
        let (mut main, ids) = indexed_main(4);
        main.initialize_peer(1);
        main.peer_state_mut(1).unwrap().best_known_block = Some(ids[2]);
        assert!(main.peer_has_header(1, ids[1]));
        assert!(!main.peer_has_header(1, ids[3]));
        main.peer_state_mut(1).unwrap().best_header_sent = Some(ids[3]);
        assert!(main.peer_has_header(1, ids[3]));
    }
}
