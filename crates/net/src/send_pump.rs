//! The periodic per-peer send pump: pings, addr trickle, sync starts,
//! block announcements, inv flushing and download scheduling.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bchd_consensus::protocol::{
    AVG_ADDRESS_BROADCAST_INTERVAL, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, BIP0031_VERSION,
    INITIAL_HEADERS_TIMEOUT, MAX_ADDR_SZ, MAX_BLOCKS_TO_ANNOUNCE, MAX_HEADER_REQS_DURING_IBD,
    MAX_INV_TO_SEND, PING_INTERVAL, SINGLE_PEER_REQUEST_MODE_AGE, VERACK_TIMEOUT,
};
use bchd_consensus::{hash256_to_hex, ZERO_HASH};
use log::{debug, info, trace, warn};

use crate::chain::BlockId;
use crate::context::{now_secs, now_usec, NodeContext};
use crate::inv::{Inv, MSG_BLOCK, MSG_TX};
use crate::message::{NetAddress, NetMessage, TimedNetAddress};
use crate::peer::Peer;
use crate::thin;

/// Idle peers get their tx invs choked after this long with zero useful
/// traffic; block invs still flow for wallets and pruned nodes.
const TX_INV_CHOKE_SECS: i64 = 120;

/// Next event time for a Poisson process with the given average interval.
pub fn poisson_next_send(now_usec: i64, average_interval_secs: i64) -> i64 {
    let uniform: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
    now_usec + (-uniform.ln() * average_interval_secs as f64 * 1e6) as i64
}

pub async fn run_send_pump(ctx: Arc<NodeContext>, peer: Arc<Peer>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if ctx.cancel.is_cancelled() || peer.is_disconnecting() {
            return;
        }
        send_messages(&ctx, &peer);
    }
}

/// One pump tick. Ordering matters: connection-health checks run before
/// any protocol traffic, and nothing is sent before the handshake is
/// complete.
pub fn send_messages(ctx: &NodeContext, peer: &Arc<Peer>) {
    let now = now_secs();
    let now_us = now_usec();

    if ctx.dosman.is_banned(peer.addr.ip()) {
        peer.set_disconnect();
        return;
    }

    // an internal disconnect request waits for in-flight blocks to drain
    // rather than abandoning and re-requesting them
    if peer.disconnect_request.load(Ordering::Relaxed) {
        let in_flight = ctx.requester.num_blocks_in_flight(peer.id);
        debug!(
            "peer {}, checking disconnect request with {in_flight} in flight blocks",
            peer.log_name()
        );
        if in_flight == 0 {
            peer.set_disconnect();
            debug!("peer {}, disconnect request was set, so disconnected", peer.log_name());
        }
    }

    // the handshake gets a hard deadline; slow peers are dropped, not
    // banned, and the slot admission policy hears about it
    let version_sent_at = peer.version_sent_at.load(Ordering::Relaxed);
    if !peer.successfully_connected.load(Ordering::Relaxed)
        && version_sent_at >= 0
        && now - version_sent_at > VERACK_TIMEOUT
    {
        warn!(
            "disconnecting - VERACK not received within {VERACK_TIMEOUT} seconds for peer={}",
            peer.log_name()
        );
        ctx.addrman.record_eviction(peer.addr.ip());
        peer.set_disconnect();
        return;
    }

    if peer.is_disconnecting() || !peer.successfully_connected.load(Ordering::Relaxed) {
        return;
    }

    maybe_ping(peer, now_us);

    // slow compact-relay and block downloads cost the connection
    thin::check_thin_timeouts(ctx, peer, now_us);
    if ctx.requester.has_download_timeout(peer, now_us) {
        warn!(
            "disconnecting peer {} for block download timeout",
            peer.log_name()
        );
        peer.set_disconnect();
        return;
    }

    // address refresh broadcast
    let in_ibd = {
        let main = ctx.main();
        ctx.is_initial_block_download(&main)
    };
    if !in_ibd && peer.next_local_addr_send.load(Ordering::Relaxed) < now_us {
        advertise_local(ctx, peer, now);
        peer.next_local_addr_send.store(
            poisson_next_send(now_us, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL),
            Ordering::Relaxed,
        );
    }
    if peer.next_addr_send.load(Ordering::Relaxed) < now_us {
        peer.next_addr_send.store(
            poisson_next_send(now_us, AVG_ADDRESS_BROADCAST_INTERVAL),
            Ordering::Relaxed,
        );
        flush_addrs(peer);
    }

    maybe_start_sync(ctx, peer, now);

    // wallet rebroadcasts only make sense fully synced; otherwise old
    // transactions spam the network
    if !ctx.is_importing() && !in_ibd {
        ctx.observer
            .broadcast(ctx.time_best_received.load(Ordering::Relaxed));
    }

    announce_blocks(ctx, peer);
    flush_invs(peer, now_us);

    // a getdata backlog left behind by a large block response drains here
    // rather than waiting for the peer's next message
    crate::block_service::process_get_data(ctx, peer);

    // request the next block bodies; mostly an IBD path but also used
    // when a lone block arrives via headers
    let window = ctx.config.block_download_window;
    let to_fetch = {
        let mut main = ctx.main();
        ctx.requester
            .request_next_blocks_to_download(&mut main, peer, window, now_us)
    };
    if !to_fetch.is_empty() {
        for inv in &to_fetch {
            trace!("requesting block {} from peer={}", hash256_to_hex(&inv.hash), peer.log_name());
        }
        thin::request_blocks(ctx, peer, &to_fetch);
    }

    // rotate overdue transaction requests to their next source
    for (target, inv) in ctx.requester.due_tx_requests(now_us) {
        if target == peer.id {
            peer.push_message(NetMessage::GetData(vec![inv]));
        } else if let Some(other) = ctx.peers.get(target) {
            other.push_message(NetMessage::GetData(vec![inv]));
        }
    }
}

fn maybe_ping(peer: &Arc<Peer>, now_us: i64) {
    let mut ping_send = peer.ping_queued.swap(false, Ordering::Relaxed);
    if peer.ping_nonce_sent.load(Ordering::Relaxed) == 0
        && peer.ping_usec_start.load(Ordering::Relaxed) + PING_INTERVAL * 1_000_000 < now_us
    {
        // automatic latency probe and keepalive
        ping_send = true;
    }
    if !ping_send {
        return;
    }
    let mut nonce = 0u64;
    while nonce == 0 {
        nonce = rand::random();
    }
    peer.ping_usec_start.store(now_us, Ordering::Relaxed);
    if peer.proto_version.load(Ordering::Relaxed) > BIP0031_VERSION {
        peer.ping_nonce_sent.store(nonce, Ordering::Relaxed);
        peer.push_message(NetMessage::Ping(Some(nonce)));
    } else {
        // peer too old for nonced pings; a pong will never arrive
        peer.ping_nonce_sent.store(0, Ordering::Relaxed);
        peer.push_message(NetMessage::Ping(None));
    }
}

fn advertise_local(ctx: &NodeContext, peer: &Arc<Peer>, now: i64) {
    if !ctx.listening.load(Ordering::Relaxed) {
        return;
    }
    let Some(local) = *ctx.local_address.lock().unwrap_or_else(|e| e.into_inner()) else {
        return;
    };
    let addr = TimedNetAddress {
        time: now as u32,
        addr: NetAddress::new(local, ctx.config.services),
    };
    if addr.addr.is_routable() {
        peer.push_address(addr);
    }
}

/// Flush queued addresses the peer does not already know, in batches the
/// receiver will accept.
fn flush_addrs(peer: &Arc<Peer>) {
    let queued: Vec<TimedNetAddress> = {
        let mut pending = peer.addr_to_send.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pending)
    };
    let mut batch = Vec::with_capacity(queued.len().min(MAX_ADDR_SZ));
    for addr in queued {
        if peer.address_is_known(&addr) {
            continue;
        }
        peer.add_address_known(&addr);
        batch.push(addr);
        if batch.len() >= MAX_ADDR_SZ {
            peer.push_message(NetMessage::Addr(std::mem::take(&mut batch)));
        }
    }
    if !batch.is_empty() {
        peer.push_message(NetMessage::Addr(batch));
    }
}

/// Start headers sync with this peer when it looks useful, plus the
/// one-time block-availability probe during IBD.
fn maybe_start_sync(ctx: &NodeContext, peer: &Arc<Peer>, now: i64) {
    if ctx.is_importing() {
        return;
    }
    let mut main = ctx.main();
    if main.best_header.is_none() {
        main.best_header = main.active.tip();
    }
    let Some(tip) = main.active.tip() else {
        return;
    };
    let Some(state) = main.peer_state(peer.id) else {
        return;
    };

    // a started sync that produced nothing within the timeout is logged;
    // a replacement sync peer gets picked up naturally
    if state.sync_started
        && state.sync_start_time < now - INITIAL_HEADERS_TIMEOUT
        && !state.first_headers_received
        && !peer.whitelisted
    {
        info!(
            "initial headers were either not received or not received before the timeout, peer={}",
            peer.log_name()
        );
    }

    // download from this peer if it is a nice peer, or if we have no
    // nice peers and this one might do
    let mut fetch = state.preferred_download
        || (main.preferred_download_count == 0 && !peer.one_shot);
    if !state.sync_started {
        // only one pruned peer may carry a header sync
        if peer.is_client() && main.sync_started_pruned >= 1 {
            fetch = false;
        }
        let tip_time = main.block_index.get(tip).time();
        let near_tip = tip_time > now - SINGLE_PEER_REQUEST_MODE_AGE;
        if (main.sync_started_count < MAX_HEADER_REQS_DURING_IBD && fetch) || near_tip {
            // start at the block before the tip so an up-to-date peer
            // still sends a non-empty response we can anchor its best
            // known block on
            let start = main
                .block_index
                .get(tip)
                .parent
                .unwrap_or(tip);
            let start_height = main.block_index.get(start).height;
            // don't start downloading headers unless our chain is shorter
            if start_height < peer.start_height.load(Ordering::Relaxed) {
                let pruned = peer.is_client();
                main.sync_started_count += 1;
                if pruned {
                    main.sync_started_pruned += 1;
                }
                if let Some(state) = main.peer_state_mut(peer.id) {
                    state.sync_started = true;
                    state.sync_start_time = now;
                    state.requested_initial_block_availability = true;
                    state.first_headers_expected_height = start_height;
                }
                let locator = main.active.locator(&main.block_index, Some(start));
                info!(
                    "initial getheaders ({start_height}) to peer={} (startheight:{})",
                    peer.log_name(),
                    peer.start_height.load(Ordering::Relaxed)
                );
                peer.push_message(NetMessage::GetHeaders {
                    locator,
                    stop: ZERO_HASH,
                });
                return;
            }
        }
    }

    // during IBD ask each new full peer whether it has our best header,
    // once, to seed its block availability
    let needs_probe = {
        let Some(state) = main.peer_state(peer.id) else {
            return;
        };
        ctx.is_initial_block_download(&main)
            && !state.requested_initial_block_availability
            && state.best_known_block.is_none()
            && !peer.is_client()
    };
    if needs_probe {
        if let Some(best) = main.best_header_id() {
            if let Some(state) = main.peer_state_mut(peer.id) {
                state.requested_initial_block_availability = true;
            }
            let best_hash = main.block_index.get(best).hash;
            debug!(
                "requesting header for initial blockavailability, peer={} block={}",
                peer.log_name(),
                hash256_to_hex(&best_hash)
            );
            peer.push_message(NetMessage::GetHeaders {
                locator: Vec::new(),
                stop: best_hash,
            });
        }
    }
}

/// Announce queued tips as headers when every announced block still sits
/// on the active chain and extends what the peer already has; otherwise
/// fall back to inv.
fn announce_blocks(ctx: &NodeContext, peer: &Arc<Peer>) {
    let to_announce: Vec<_> = {
        let mut queue = peer
            .blockhashes_to_announce
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    };
    if to_announce.is_empty() {
        return;
    }

    let mut main = ctx.main();
    main.process_block_availability(peer.id);
    let prefer_headers = main
        .peer_state(peer.id)
        .map(|state| state.prefer_headers)
        .unwrap_or(false);

    let mut revert_to_inv =
        !prefer_headers || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
    let mut headers = Vec::new();
    let mut best_index: Option<BlockId> = None;

    if !revert_to_inv {
        let mut found_starting_header = false;
        for hash in &to_announce {
            // skip blocks we don't know about
            let Some(id) = main.block_index.lookup(hash) else {
                continue;
            };
            if !main.active.contains(&main.block_index, id) {
                // bail out if we reorged away from this block
                revert_to_inv = true;
                break;
            }
            if let Some(best) = best_index {
                if main.block_index.get(id).parent != Some(best) {
                    // announced blocks that don't connect to each other;
                    // happens under repeated invalidate/reconsider of the
                    // tip, handled robustly by reverting to inv
                    revert_to_inv = true;
                    break;
                }
            }
            best_index = Some(id);
            if found_starting_header {
                headers.push(main.block_index.get(id).header);
            } else if main.peer_has_header(peer.id, id) {
                continue; // keep looking for the first new block
            } else if main.block_index.get(id).parent.is_none()
                || main
                    .block_index
                    .get(id)
                    .parent
                    .map(|parent| main.peer_has_header(peer.id, parent))
                    .unwrap_or(false)
            {
                // peer has the prior header; start sending from here
                found_starting_header = true;
                headers.push(main.block_index.get(id).header);
            } else {
                // nothing will connect for this peer
                revert_to_inv = true;
                break;
            }
        }
    }

    if revert_to_inv {
        for hash in &to_announce {
            let Some(id) = main.block_index.lookup(hash) else {
                continue;
            };
            if !main.active.contains(&main.block_index, id) {
                debug!(
                    "announcing block {} not on main chain",
                    hash256_to_hex(hash)
                );
            }
            // if the peer announced this block to us, don't inv it back
            if !main.peer_has_header(peer.id, id) {
                peer.push_inventory(Inv::new(MSG_BLOCK, *hash));
                trace!("sending inv peer={} hash={}", peer.log_name(), hash256_to_hex(hash));
            }
        }
    } else if !headers.is_empty() {
        if headers.len() > 1 {
            debug!(
                "{} headers, range ({}...{}), to peer={}",
                headers.len(),
                hash256_to_hex(&headers[0].hash()),
                hash256_to_hex(&headers[headers.len() - 1].hash()),
                peer.log_name()
            );
        } else {
            debug!(
                "sending header {} to peer={}",
                hash256_to_hex(&headers[0].hash()),
                peer.log_name()
            );
        }
        if let Some(state) = main.peer_state_mut(peer.id) {
            state.best_header_sent = best_index;
        }
        peer.push_message(NetMessage::Headers(headers));
    }
}

/// Flush inventory in receiver-sized batches. Peers idle past the choke
/// window stop receiving tx invs; they still get block announcements.
fn flush_invs(peer: &Arc<Peer>, now_us: i64) {
    loop {
        let batch: Vec<Inv> = {
            let mut queue = peer.inv_to_send.lock().unwrap_or_else(|e| e.into_inner());
            if queue.is_empty() {
                break;
            }
            let choke_tx = peer.activity_bytes.load(Ordering::Relaxed) == 0
                && now_us / 1_000_000 - peer.time_connected > TX_INV_CHOKE_SECS;
            let mut send = Vec::with_capacity(queue.len().min(MAX_INV_TO_SEND));
            let mut taken = 0usize;
            {
                let mut known = peer
                    .inventory_known
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for inv in queue.iter() {
                    taken += 1;
                    if inv.inv_type == MSG_TX {
                        if choke_tx {
                            continue;
                        }
                        if known.contains(&inv.hash) {
                            continue;
                        }
                    }
                    send.push(*inv);
                    known.insert(&inv.hash);
                    if send.len() >= MAX_INV_TO_SEND {
                        break;
                    }
                }
            }
            queue.drain(..taken);
            send
        };
        if !batch.is_empty() {
            peer.push_message(NetMessage::Inv(batch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisson_next_send_is_future_and_varies() {
        let now = 1_000_000;
        let mut samples = Vec::new();
        for _ in 0..32 {
            let next = poisson_next_send(now, 30);
            assert!(next > now);
            samples.push(next);
        }
        samples.dedup();
        assert!(samples.len() > 1);
    }
}
