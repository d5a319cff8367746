//! Headers-first discovery: batch validation, the unconnected-header
//! cache, acceptor feeding and direct fetch.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bchd_consensus::protocol::{
    MAX_HEADERS_RESULTS, MAX_UNCONNECTED_HEADERS, UNCONNECTED_HEADERS_TIMEOUT,
};
use bchd_consensus::{hash256_to_hex, Hash256, ZERO_HASH};
use bchd_primitives::BlockHeader;
use log::{debug, info, trace};

use crate::chain::{BlockId, STATUS_VALID_TREE};
use crate::context::{now_secs, now_usec, NodeContext};
use crate::error::NetError;
use crate::inv::{Inv, MSG_BLOCK};
use crate::message::NetMessage;
use crate::peer::Peer;

/// Accept one validated header into the index.
pub fn accept_block_header(
    ctx: &NodeContext,
    main: &mut crate::context::MainState,
    header: &BlockHeader,
) -> Result<BlockId, crate::external::ValidationFailure> {
    ctx.validator.check_block_header(header)?;
    match main.block_index.insert_header(*header) {
        Some(id) => {
            main.block_index.set_status(id, STATUS_VALID_TREE);
            main.consider_best_header(id);
            Ok(id)
        }
        None => Err(crate::external::ValidationFailure::new(
            "previous block unknown",
            crate::message::reject_code::INVALID,
            0,
        )),
    }
}

pub fn handle_headers(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    mut headers: Vec<BlockHeader>,
) -> Result<(), NetError> {
    if headers.len() > MAX_HEADERS_RESULTS {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "headers message size = {}",
            headers.len()
        )));
    }
    if headers.is_empty() {
        // nothing interesting; stop asking this peer for more headers
        return Ok(());
    }

    let now = now_secs();
    let mut main = ctx.main();

    // The batch must be continuous before any of it is accepted; out of
    // order headers would otherwise lock us out of direct fetch.
    let mut new_unconnected = false;
    let mut hash_last: Option<Hash256> = None;
    for header in &headers {
        if hash_last.is_none() && main.block_index.lookup(&header.prev_block).is_some() {
            hash_last = Some(header.prev_block);
        }
        if Some(header.prev_block) != hash_last {
            // an old-dated discontinuity while we are still syncing is an
            // attack on the sync, not a race with a new batch
            if (header.time as i64) < now - 24 * 60 * 60 {
                peer.set_disconnect();
                return Err(NetError::Protocol(format!(
                    "non-continuous headers sequence during node sync, peer={}",
                    peer.log_name()
                )));
            }
            new_unconnected = true;
        }
        if new_unconnected {
            let hash = header.hash();
            if main.unconnected_headers.len() < MAX_UNCONNECTED_HEADERS {
                main.unconnected_headers.insert(hash, (*header, now));
            }
            // still lets us fetch the block from this peer once another
            // peer's headers connect it
            main.update_block_availability(peer.id, hash);
        }
        hash_last = Some(header.hash());
    }
    if new_unconnected {
        return Ok(());
    }

    // Splice in cached headers that connect to the end of this batch,
    // rescanning after each hit in case a chain of them connects.
    loop {
        let last_hash = match headers.last() {
            Some(header) => header.hash(),
            None => break,
        };
        let next = main
            .unconnected_headers
            .iter()
            .find(|(_, (header, _))| header.prev_block == last_hash)
            .map(|(hash, _)| *hash);
        match next {
            Some(hash) => {
                if let Some((header, _)) = main.unconnected_headers.remove(&hash) {
                    trace!("splicing unconnected header {}", hash256_to_hex(&hash));
                    headers.push(header);
                }
            }
            None => break,
        }
    }
    // expire stale entries and drop any now covered by the batch
    let batch_hashes: HashSet<Hash256> = headers.iter().map(|header| header.hash()).collect();
    main.unconnected_headers.retain(|hash, (_, arrived)| {
        now - *arrived < UNCONNECTED_HEADERS_TIMEOUT && !batch_hashes.contains(hash)
    });

    // Accept in dependency order; the first invalid header ends the batch.
    let mut last_accepted: Option<BlockId> = None;
    let mut accepted = 0usize;
    for header in &headers {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match accept_block_header(ctx, &mut main, header) {
            Ok(id) => {
                last_accepted = Some(id);
                accepted += 1;
            }
            Err(failure) => {
                if failure.dos_score > 0 {
                    ctx.misbehaving(peer, failure.dos_score);
                }
                debug!(
                    "header rejected ({}) from peer={}",
                    failure.reason,
                    peer.log_name()
                );
                break;
            }
        }
    }
    headers.truncate(accepted);

    if let Some(last) = last_accepted {
        let hash = main.block_index.get(last).hash;
        main.update_block_availability(peer.id, hash);
    }

    if accepted == MAX_HEADERS_RESULTS {
        if let Some(last) = last_accepted {
            // the peer likely has more; continue from the last accepted
            let locator = main.active.locator(&main.block_index, Some(last));
            debug!(
                "more getheaders ({}) to peer={} (startheight:{})",
                main.block_index.get(last).height,
                peer.log_name(),
                peer.start_height.load(Ordering::Relaxed)
            );
            peer.push_message(NetMessage::GetHeaders {
                locator,
                stop: ZERO_HASH,
            });
            if let Some(state) = main.peer_state_mut(peer.id) {
                state.sync_start_time = now; // more headers are owed
            }

            // during IBD, cheaply refresh every other full peer's block
            // availability with a single-header request for this block
            if ctx.is_initial_block_download(&main) {
                let last_hash = main.block_index.get(last).hash;
                let last_work = main.block_index.get(last).chain_work;
                for other in ctx.peers.snapshot() {
                    if other.id == peer.id || other.is_client() {
                        continue;
                    }
                    let Some(state) = main.peer_state(other.id) else {
                        continue;
                    };
                    let needs_probe = match state.best_known_block {
                        Some(best) => main.block_index.get(best).chain_work < last_work,
                        None => true,
                    };
                    if needs_probe {
                        other.push_message(NetMessage::GetHeaders {
                            locator: Vec::new(),
                            stop: last_hash,
                        });
                        debug!(
                            "requesting header for block availability, peer={} block={}",
                            other.log_name(),
                            hash256_to_hex(&last_hash)
                        );
                    }
                }
            }
        }
    }

    // The first batch after starting sync must reach the height we were
    // at when we asked; anything less is some old valid header.
    if let Some(last) = last_accepted {
        let last_height = main.block_index.get(last).height;
        let lenient_network = !matches!(
            ctx.params.network,
            bchd_consensus::params::Network::Main | bchd_consensus::params::Network::Regtest
        );
        if let Some(state) = main.peer_state_mut(peer.id) {
            if !state.first_headers_received {
                if state.first_headers_expected_height <= last_height {
                    state.first_headers_received = true;
                    info!("initial headers received for peer={}", peer.log_name());
                }
                if lenient_network {
                    state.first_headers_received = true;
                }
            }
        }
    }

    // Direct fetch: with at least as much work as our tip and a fresh
    // chain, skip the inv round-trip and ask for the bodies now.
    if let Some(last) = last_accepted {
        let can_fetch = ctx.can_direct_fetch(&main)
            && main.block_index.get(last).is_valid(STATUS_VALID_TREE);
        let enough_work = match main.active.tip() {
            Some(tip) => {
                main.block_index.get(tip).chain_work <= main.block_index.get(last).chain_work
            }
            None => true,
        };
        if can_fetch && enough_work {
            if ctx.config.max_blocks_in_transit_per_peer != 0 {
                peer.max_blocks_in_transit
                    .store(ctx.config.max_blocks_in_transit_per_peer, Ordering::Relaxed);
            }
            let mut to_fetch = Vec::new();
            let mut walk = Some(last);
            while let Some(id) = walk {
                if main.active.contains(&main.block_index, id) {
                    break;
                }
                to_fetch.push(id);
                walk = main.block_index.get(id).parent;
            }
            let cap = peer.max_blocks_in_transit.load(Ordering::Relaxed);
            let mut asked = 0usize;
            let now_us = now_usec();
            let mut requests = Vec::new();
            for id in to_fetch.iter().rev() {
                let hash = main.block_index.get(*id).hash;
                if !main.already_have_block(&hash) {
                    let inv = Inv::new(MSG_BLOCK, hash);
                    if ctx.requester.ask_for(&inv, peer, now_us).is_some() {
                        requests.push(inv);
                        trace!(
                            "ask for block via headers direct fetch {} ({})",
                            hash256_to_hex(&hash),
                            main.block_index.get(*id).height
                        );
                    }
                    asked += 1;
                }
                // the request manager dedupes; we only cap the ask count
                if asked >= cap {
                    debug!("large reorg, could only direct fetch {asked} blocks");
                    break;
                }
            }
            if !requests.is_empty() {
                if requests.len() > 1 {
                    debug!(
                        "downloading blocks toward {} ({}) via headers direct fetch",
                        hash256_to_hex(&main.block_index.get(last).hash),
                        main.block_index.get(last).height
                    );
                }
                // direct fetch only runs near the tip, where a lone block
                // is eligible for compact relay
                crate::thin::request_blocks_with(ctx, peer, &requests, true);
            }
        }
    }

    Ok(())
}

/// GETHEADERS: walk forward from the fork point (or serve the single
/// `stop` header for a null locator), then remember what we told them.
pub fn handle_get_headers(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    locator: &[Hash256],
    stop: &Hash256,
) -> Result<(), NetError> {
    let mut main = ctx.main();

    let mut walk: Option<BlockId> = if locator.is_empty() {
        match main.block_index.lookup(stop) {
            Some(id) => Some(id),
            None => return Ok(()),
        }
    } else {
        let fork = main.active.find_fork(&main.block_index, locator);
        fork.and_then(|id| main.active.next(&main.block_index, id))
    };

    let mut headers = Vec::new();
    let mut last_sent: Option<BlockId> = None;
    while let Some(id) = walk {
        headers.push(main.block_index.get(id).header);
        last_sent = Some(id);
        if headers.len() >= MAX_HEADERS_RESULTS || main.block_index.get(id).hash == *stop {
            break;
        }
        walk = main.active.next(&main.block_index, id);
    }
    debug!(
        "getheaders -> {} headers for peer={}",
        headers.len(),
        peer.log_name()
    );

    // an empty response means the peer already has our tip
    let best_sent = last_sent.or_else(|| main.active.tip());
    if let Some(state) = main.peer_state_mut(peer.id) {
        state.best_header_sent = best_sent;
    }
    peer.push_message(NetMessage::Headers(headers));
    Ok(())
}
