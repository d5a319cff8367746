//! The per-peer receive pump: framing, checksums, and dispatch of every
//! wire command to its handler.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bchd_consensus::protocol::{
    BIP0031_VERSION, CADDR_TIME_VERSION, EXPEDITED_VERSION, MAX_ADDR_SZ, MAX_INV_SZ,
    MIN_PEER_PROTO_VERSION, NODE_BLOOM, NO_BLOOM_VERSION, PROTOCOL_VERSION,
    SENDHEADERS_VERSION, SMALLEST_MAX_BLOOM_FILTER_SIZE,
};
use bchd_consensus::{hash256_to_hex, Hash256, ZERO_HASH};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::block_service::process_get_data;
use crate::bloom::BloomFilter;
use crate::context::{now_secs, now_usec, NodeContext};
use crate::error::NetError;
use crate::frame;
use crate::header_ingest;
use crate::inv::{Inv, MSG_BLOCK, MSG_FILTERED_BLOCK, MSG_THINBLOCK, MSG_TX};
use crate::message::{
    reject_code, NetAddress, NetMessage, RejectPayload, TimedNetAddress, VersionPayload,
};
use crate::peer::{OutboundMessage, Peer};
use crate::thin;

/// Messages handled per pump pass before yielding to other peers.
const MAX_MSGS_PER_PASS: usize = 2_000;

/// Ban duration for a peer speaking another network's magic.
const BAD_MAGIC_BAN_SECS: i64 = 4 * 60 * 60;

const GETBLOCKS_LIMIT: usize = 500;

/// Register a new connection everywhere and, for outbound peers, open
/// with our VERSION.
pub fn initialize_peer(ctx: &NodeContext, peer: &Arc<Peer>) {
    ctx.peers.insert(Arc::clone(peer));
    peer.max_blocks_in_transit
        .store(ctx.config.max_blocks_in_transit(), Ordering::Relaxed);
    {
        let mut main = ctx.main();
        main.initialize_peer(peer.id);
    }
    ctx.requester.initialize_peer(peer.id);
    if !peer.inbound {
        push_version(ctx, peer);
    }
}

/// Remove a departed connection; its chain state and download slots go
/// with it.
pub fn finalize_peer(ctx: &NodeContext, peer: &Arc<Peer>) {
    ctx.peers.remove(peer.id);
    let mut main = ctx.main();
    main.finalize_peer(peer.id, &ctx.requester);
}

pub fn push_version(ctx: &NodeContext, peer: &Arc<Peer>) {
    let start_height = {
        let main = ctx.main();
        main.active.height()
    };
    let addr_from = match *ctx.local_address.lock().unwrap_or_else(|e| e.into_inner()) {
        Some(local) => NetAddress::new(local, ctx.config.services),
        None => NetAddress::unroutable(),
    };
    peer.version_sent_at.store(now_secs(), Ordering::Relaxed);
    peer.push_message(NetMessage::Version(Box::new(VersionPayload {
        version: PROTOCOL_VERSION,
        services: ctx.config.services,
        timestamp: now_secs(),
        addr_recv: NetAddress::new(peer.addr, 0),
        addr_from,
        nonce: ctx.local_nonce,
        user_agent: ctx.config.user_agent.clone(),
        start_height,
        relay: !ctx.config.blocks_only,
    })));
}

/// The writer half: drains the peer's ordered outbound queue onto the
/// socket.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    ctx: Arc<NodeContext>,
    peer: Arc<Peer>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let magic = ctx.params.message_start;
    while let Some(OutboundMessage { command, payload }) = rx.recv().await {
        match frame::write_frame(&mut writer, magic, &command, &payload).await {
            Ok(written) => {
                peer.note_sent(written);
                ctx.net_totals.add_sent(written);
            }
            Err(err) => {
                debug!("write to peer {} failed: {err}", peer.log_name());
                peer.set_disconnect();
                break;
            }
        }
    }
}

/// The receive pump. Returns when the peer is done; the caller finalizes.
pub async fn run_receive_pump<R: AsyncRead + Unpin>(
    ctx: &Arc<NodeContext>,
    peer: &Arc<Peer>,
    reader: &mut R,
) -> Result<(), NetError> {
    let mut processed_in_pass = 0usize;
    loop {
        if ctx.cancel.is_cancelled() || peer.is_disconnecting() {
            return Ok(());
        }
        // backpressure: a peer that will not drain its send buffer does
        // not get to feed us more work
        while peer.send_size() >= ctx.config.send_buffer_limit {
            if peer.is_disconnecting() || ctx.cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // serve any getdata backlog before reading more
        process_get_data(ctx, peer);

        let header = frame::read_header(reader).await?;
        if header.magic != ctx.params.message_start {
            warn!(
                "invalid message start from peer={}",
                peer.log_name()
            );
            if !peer.whitelisted {
                ctx.dosman
                    .ban(peer.addr.ip(), "node misbehaving", BAD_MAGIC_BAN_SECS);
            }
            peer.set_disconnect();
            return Err(NetError::BadMagic);
        }

        let command = match header.command_str() {
            Ok(command) => command.to_string(),
            Err(err) => {
                warn!("errors in header from peer={}: {err}", peer.log_name());
                // stay in sync by consuming the payload
                frame::read_payload(reader, &header).await?;
                continue;
            }
        };

        let payload = frame::read_payload(reader, &header).await?;
        ctx.net_totals.add_recv(frame::HEADER_SIZE + payload.len());
        peer.bytes_recv
            .fetch_add((frame::HEADER_SIZE + payload.len()) as u64, Ordering::Relaxed);

        if frame::checksum(&payload) != header.checksum {
            warn!(
                "checksum error for {command} ({} bytes) from peer={}",
                payload.len(),
                peer.log_name()
            );
            continue;
        }

        if ctx.config.drop_messages_test > 0
            && rand::random::<u32>() % ctx.config.drop_messages_test == 0
        {
            info!("dropmessagestest DROPPING RECV MESSAGE");
            continue;
        }

        trace!(
            "received: {command} ({} bytes) peer={}",
            payload.len(),
            peer.log_name()
        );

        match NetMessage::decode(&command, &payload) {
            Ok(message) => {
                if !matches!(message, NetMessage::Ping(_) | NetMessage::Pong(_)) {
                    peer.note_activity(payload.len());
                }
                if let Err(err) = process_message(ctx, peer, message, now_usec()) {
                    match err {
                        NetError::Fatal(message) => return Err(NetError::Fatal(message)),
                        other => {
                            debug!(
                                "{command} ({} bytes) FAILED peer {}: {other}",
                                payload.len(),
                                peer.log_name()
                            );
                        }
                    }
                }
            }
            Err(error) => {
                // a malformed payload costs the message, not the
                // connection, except during the handshake; and a bad
                // reject never triggers another reject
                warn!(
                    "malformed {command} ({} bytes) from peer={}: {error}",
                    payload.len(),
                    peer.log_name()
                );
                if command != "reject" {
                    peer.push_message(NetMessage::Reject(RejectPayload {
                        message: command.clone(),
                        code: reject_code::MALFORMED,
                        reason: "error parsing message".to_string(),
                        hash: None,
                    }));
                }
                if command == "version" {
                    peer.set_disconnect();
                }
            }
        }

        processed_in_pass += 1;
        if processed_in_pass >= MAX_MSGS_PER_PASS {
            // let someone else do something periodically
            processed_in_pass = 0;
            tokio::task::yield_now().await;
        }
    }
}

/// Dispatch one decoded message. An `Err` means this message failed; the
/// pump logs it and carries on unless it is fatal.
pub fn process_message(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    message: NetMessage,
    received_usec: i64,
) -> Result<(), NetError> {
    // filter messages demand the bloom service bit
    if ctx.config.services & NODE_BLOOM == 0
        && matches!(
            message,
            NetMessage::FilterLoad(_) | NetMessage::FilterAdd(_) | NetMessage::FilterClear
        )
    {
        if peer.proto_version.load(Ordering::Relaxed) >= NO_BLOOM_VERSION {
            ctx.misbehaving(peer, 100);
        } else {
            debug!("inconsistent bloom filter settings peer {}", peer.log_name());
            peer.set_disconnect();
        }
        return Err(NetError::Protocol("bloom filtering not offered".to_string()));
    }

    match message {
        NetMessage::Version(payload) => handle_version(ctx, peer, *payload),
        NetMessage::Verack => handle_verack(ctx, peer),
        NetMessage::BuVersion { addr_from_port } => handle_buversion(ctx, peer, addr_from_port),
        NetMessage::BuVerack => handle_buverack(ctx, peer),
        NetMessage::Addr(addrs) => handle_addr(ctx, peer, addrs),
        NetMessage::GetAddr => handle_getaddr(ctx, peer),
        NetMessage::Inv(invs) => handle_inv(ctx, peer, invs),
        NetMessage::GetData(invs) => handle_getdata(ctx, peer, invs),
        NetMessage::NotFound(_) => Ok(()),
        NetMessage::GetBlocks { locator, stop } => handle_getblocks(ctx, peer, &locator, &stop),
        NetMessage::GetHeaders { locator, stop } => {
            header_ingest::handle_get_headers(ctx, peer, &locator, &stop)
        }
        NetMessage::Headers(headers) => {
            if ctx.importing.load(Ordering::Relaxed) {
                debug!("skipping processing of HEADERS because importing");
                return Ok(());
            }
            if ctx.reindex.load(Ordering::Relaxed) {
                debug!("skipping processing of HEADERS because reindexing");
                return Ok(());
            }
            header_ingest::handle_headers(ctx, peer, headers)
        }
        NetMessage::Block(block) => {
            if ctx.is_importing() {
                return Ok(());
            }
            handle_block(ctx, peer, block, received_usec)
        }
        NetMessage::MerkleBlock(_) => Ok(()), // we never request these
        NetMessage::Tx(tx) => handle_tx(ctx, peer, tx),
        NetMessage::Mempool => handle_mempool(ctx, peer),
        NetMessage::Ping(nonce) => {
            if peer.proto_version.load(Ordering::Relaxed) > BIP0031_VERSION {
                peer.push_message(NetMessage::Pong(nonce));
            }
            Ok(())
        }
        NetMessage::Pong(nonce) => {
            handle_pong(peer, nonce, received_usec);
            Ok(())
        }
        NetMessage::Reject(payload) => handle_reject(ctx, peer, payload),
        NetMessage::SendHeaders => {
            let mut main = ctx.main();
            if let Some(state) = main.peer_state_mut(peer.id) {
                state.prefer_headers = true;
            }
            Ok(())
        }
        NetMessage::SendCmpct {
            high_bandwidth: _,
            version,
        } => {
            // recorded for statistics only; compact block relay is not
            // implemented on this network
            if peer.proto_version.load(Ordering::Relaxed) >= 70014 {
                peer.supports_compact_blocks
                    .store(version == 1, Ordering::Relaxed);
            }
            Ok(())
        }
        NetMessage::FilterLoad(filter) => handle_filterload(ctx, peer, filter),
        NetMessage::FilterAdd(data) => handle_filteradd(ctx, peer, data),
        NetMessage::FilterClear => {
            *peer.filter.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(BloomFilter::match_all());
            peer.relay_txes.store(true, Ordering::Relaxed);
            Ok(())
        }
        NetMessage::FilterSizeXthin(size) => handle_filtersizexthin(ctx, peer, size),
        NetMessage::GetXthin {
            inv,
            mempool_filter,
        } => {
            if ctx.is_importing() || !ctx.config.thin_blocks_enabled {
                return Ok(());
            }
            thin::handle_get_xthin(ctx, peer, &inv, mempool_filter)
        }
        NetMessage::XThinBlock(thin_block) => {
            if thin_response_allowed(ctx) {
                thin::handle_xthinblock(ctx, peer, thin_block)
            } else {
                Ok(())
            }
        }
        NetMessage::ThinBlock(thin_block) => {
            if thin_response_allowed(ctx) {
                thin::handle_thinblock(ctx, peer, thin_block)
            } else {
                Ok(())
            }
        }
        NetMessage::GetXBlockTx {
            block_hash,
            short_ids,
        } => {
            if thin_response_allowed(ctx) {
                thin::handle_get_xblocktx(ctx, peer, &block_hash, &short_ids, false)
            } else {
                Ok(())
            }
        }
        NetMessage::XBlockTx { block_hash, txs } => {
            if thin_response_allowed(ctx) {
                thin::handle_blocktx_response(ctx, peer, &block_hash, txs, false)
            } else {
                Ok(())
            }
        }
        NetMessage::GetGraphene {
            inv,
            mempool_tx_count,
        } => {
            if ctx.is_importing() || !ctx.config.graphene_enabled {
                return Ok(());
            }
            thin::handle_get_graphene(ctx, peer, &inv, mempool_tx_count)
        }
        NetMessage::GrapheneBlock(graphene) => {
            if graphene_response_allowed(ctx) {
                thin::handle_grapheneblock(ctx, peer, graphene)
            } else {
                Ok(())
            }
        }
        NetMessage::GetGrapheneTx {
            block_hash,
            short_ids,
        } => {
            if graphene_response_allowed(ctx) {
                thin::handle_get_xblocktx(ctx, peer, &block_hash, &short_ids, true)
            } else {
                Ok(())
            }
        }
        NetMessage::GrapheneTx { block_hash, txs } => {
            if graphene_response_allowed(ctx) {
                thin::handle_blocktx_response(ctx, peer, &block_hash, txs, true)
            } else {
                Ok(())
            }
        }
        NetMessage::ExpeditedRequest { options } => {
            thin::handle_expedited_request(ctx, peer, options)
        }
        NetMessage::ExpeditedBlock { hops, thin: block } => {
            let near_tip = {
                let main = ctx.main();
                !ctx.is_initial_block_download(&main)
            };
            if !ctx.is_importing() && near_tip {
                thin::handle_expedited_block(ctx, peer, hops, block)
            } else {
                Ok(())
            }
        }
        NetMessage::Unknown { command, .. } => {
            // ignore unknown commands for extensibility
            debug!("unknown command \"{command}\" from peer={}", peer.log_name());
            Ok(())
        }
    }
}

fn thin_response_allowed(ctx: &NodeContext) -> bool {
    if ctx.is_importing() || !ctx.config.thin_blocks_enabled {
        return false;
    }
    let main = ctx.main();
    !ctx.is_initial_block_download(&main)
}

fn graphene_response_allowed(ctx: &NodeContext) -> bool {
    if ctx.is_importing() || !ctx.config.graphene_enabled {
        return false;
    }
    let main = ctx.main();
    !ctx.is_initial_block_download(&main)
}

fn handle_version(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    payload: VersionPayload,
) -> Result<(), NetError> {
    // each connection can only send one version message
    if peer.proto_version.load(Ordering::Relaxed) != 0 {
        peer.push_message(NetMessage::Reject(RejectPayload {
            message: "version".to_string(),
            code: reject_code::DUPLICATE,
            reason: "Duplicate version message".to_string(),
            hash: None,
        }));
        peer.set_disconnect();
        return Err(NetError::Protocol(format!(
            "duplicate version message received, disconnecting peer={}",
            peer.log_name()
        )));
    }

    let mut version = payload.version;
    if version < MIN_PEER_PROTO_VERSION {
        peer.push_message(NetMessage::Reject(RejectPayload {
            message: "version".to_string(),
            code: reject_code::OBSOLETE,
            reason: format!("Protocol Version must be {MIN_PEER_PROTO_VERSION} or greater"),
            hash: None,
        }));
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "using obsolete protocol version {version}, banning peer={}",
            peer.log_name()
        )));
    }
    if version == 10300 {
        version = 300;
    }

    // disconnect if we connected to ourself
    if payload.nonce == ctx.local_nonce && payload.nonce > 1 {
        info!("connected to self at {}, disconnecting", peer.addr);
        peer.set_disconnect();
        return Ok(());
    }

    peer.proto_version.store(version, Ordering::Relaxed);
    peer.services.store(payload.services, Ordering::Relaxed);
    peer.start_height
        .store(payload.start_height, Ordering::Relaxed);
    peer.relay_txes.store(payload.relay, Ordering::Relaxed);
    *peer.subversion.lock().unwrap_or_else(|e| e.into_inner()) =
        sanitize_subversion(&payload.user_agent);
    *peer.addr_local.lock().unwrap_or_else(|e| e.into_inner()) =
        Some(payload.addr_recv.socket_addr());

    // be shy and don't send version until we hear
    if peer.inbound {
        push_version(ctx, peer);
    }

    {
        let mut main = ctx.main();
        main.update_preferred_download(peer);
    }

    peer.verack_sent.store(true, Ordering::Relaxed);
    peer.push_message(NetMessage::Verack);

    if !peer.inbound {
        // advertise our address
        let advertise = {
            let main = ctx.main();
            ctx.listening.load(Ordering::Relaxed) && !ctx.is_initial_block_download(&main)
        };
        if advertise {
            if let Some(local) = *ctx.local_address.lock().unwrap_or_else(|e| e.into_inner()) {
                let addr = TimedNetAddress {
                    time: now_secs() as u32,
                    addr: NetAddress::new(local, ctx.config.services),
                };
                if addr.addr.is_routable() {
                    debug!("advertising address {local}");
                    peer.push_address(addr);
                }
            }
        }

        // get recent addresses
        if peer.one_shot || version >= CADDR_TIME_VERSION || ctx.addrman.size() < 1000 {
            peer.push_message(NetMessage::GetAddr);
            peer.asked_for_addrs.store(true, Ordering::Relaxed);
        }
        ctx.addrman.good(peer.addr.ip());
    } else if payload.addr_from.is_routable() && payload.addr_from.ip == peer.addr.ip() {
        let from = TimedNetAddress {
            time: now_secs() as u32,
            addr: payload.addr_from,
        };
        ctx.addrman.add(vec![from], peer.addr.ip(), 0);
        ctx.addrman.good(payload.addr_from.ip);
    }

    info!(
        "receive version message: {}: version {}, blocks={}, peer={}",
        peer.subversion.lock().unwrap_or_else(|e| e.into_inner()),
        version,
        payload.start_height,
        peer.log_name()
    );

    peer.time_offset
        .store(payload.timestamp - now_secs(), Ordering::Relaxed);

    // feeler connections exist only to verify that an address is online
    if peer.feeler {
        debug!("disconnecting feeler to peer {}", peer.log_name());
        peer.set_disconnect();
    }
    Ok(())
}

fn handle_verack(ctx: &NodeContext, peer: &Arc<Peer>) -> Result<(), NetError> {
    if peer.version_sent_at.load(Ordering::Relaxed) < 0 {
        peer.set_disconnect();
        return Err(NetError::Protocol(format!(
            "VERACK received but we never sent a VERSION message, disconnecting peer={}",
            peer.log_name()
        )));
    }
    if peer.successfully_connected.load(Ordering::Relaxed) {
        peer.set_disconnect();
        return Err(NetError::Protocol(format!(
            "duplicate VERACK received, disconnecting peer={}",
            peer.log_name()
        )));
    }
    peer.successfully_connected.store(true, Ordering::Relaxed);

    let version = peer.proto_version.load(Ordering::Relaxed);
    if version >= SENDHEADERS_VERSION {
        // tell our peer we prefer headers over invs; even non-full peers
        // can announce blocks
        peer.push_message(NetMessage::SendHeaders);
    }
    if peer.thin_block_capable() && ctx.config.thin_blocks_enabled {
        peer.push_message(NetMessage::FilterSizeXthin(ctx.config.xthin_bloom_filter_size));
    }
    // the listening port for expedited forwarding travels in a separate
    // message so future VERSION extensions cannot collide with it, and
    // only after VERACK so strict peers see a clean handshake
    if version >= EXPEDITED_VERSION {
        peer.bu_version_sent.store(true, Ordering::Relaxed);
        peer.push_message(NetMessage::BuVersion {
            addr_from_port: ctx.config.listen_port,
        });
    }
    Ok(())
}

fn handle_buversion(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    addr_from_port: u16,
) -> Result<(), NetError> {
    if !peer.verack_sent.load(Ordering::Relaxed) {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "BUVERSION received but we never sent a VERACK message, banning peer={}",
            peer.log_name()
        )));
    }
    if peer.addr_from_port.load(Ordering::Relaxed) != 0 {
        peer.push_message(NetMessage::Reject(RejectPayload {
            message: "buversion".to_string(),
            code: reject_code::DUPLICATE,
            reason: "Duplicate BU version message".to_string(),
            hash: None,
        }));
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "duplicate BU version message received from peer={}",
            peer.log_name()
        )));
    }
    peer.addr_from_port
        .store(addr_from_port as u32, Ordering::Relaxed);
    peer.push_message(NetMessage::BuVerack);
    Ok(())
}

fn handle_buverack(ctx: &NodeContext, peer: &Arc<Peer>) -> Result<(), NetError> {
    if !peer.bu_version_sent.load(Ordering::Relaxed) {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "BUVERACK received but we never sent a BUVERSION message, banning peer={}",
            peer.log_name()
        )));
    }
    thin::check_and_request_expedited_blocks(ctx, peer);
    Ok(())
}

fn handle_addr(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    addrs: Vec<TimedNetAddress>,
) -> Result<(), NetError> {
    let version = peer.proto_version.load(Ordering::Relaxed);
    // don't want addr from older versions unless seeding
    if version < CADDR_TIME_VERSION && ctx.addrman.size() > 1000 {
        return Ok(());
    }
    if addrs.len() > MAX_ADDR_SZ {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "message addr size() = {}",
            addrs.len()
        )));
    }

    let now = now_secs();
    let since = now - 10 * 60;
    let batch_len = addrs.len();
    let mut ok_addrs = Vec::with_capacity(addrs.len());
    for mut timed in addrs {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if timed.time <= 100_000_000 || timed.time as i64 > now + 10 * 60 {
            timed.time = (now - 5 * 24 * 60 * 60) as u32;
        }
        peer.add_address_known(&timed);
        let fresh = timed.time as i64 > since;
        if fresh
            && !peer.asked_for_addrs.load(Ordering::Relaxed)
            && batch_len <= 10
            && timed.addr.is_routable()
        {
            relay_address(ctx, peer, timed, now);
        }
        if timed.addr.is_routable() {
            ok_addrs.push(timed);
        }
    }
    ctx.addrman.add(ok_addrs, peer.addr.ip(), 2 * 60 * 60);
    if batch_len < MAX_ADDR_SZ {
        peer.asked_for_addrs.store(false, Ordering::Relaxed);
    }
    if peer.one_shot {
        debug!("disconnecting {}: one shot", peer.log_name());
        peer.set_disconnect();
    }
    Ok(())
}

/// Relay a fresh address to a couple of peers chosen deterministically
/// for the day, so the chosen peers' known-address filters suppress
/// repeats.
fn relay_address(ctx: &NodeContext, from: &Peer, addr: TimedNetAddress, now: i64) {
    let day = (now / (24 * 60 * 60)) as u32;
    let salt = ctx.local_nonce as u32;
    let mut candidates: Vec<(u32, Arc<Peer>)> = ctx
        .peers
        .snapshot()
        .into_iter()
        .filter(|peer| {
            peer.id != from.id
                && peer.proto_version.load(Ordering::Relaxed) >= CADDR_TIME_VERSION
        })
        .map(|peer| {
            let mut key = addr.addr.key();
            key.extend_from_slice(&peer.id.to_le_bytes());
            key.extend_from_slice(&day.to_le_bytes());
            (crate::bloom::murmur3_32(salt, &key), peer)
        })
        .collect();
    candidates.sort_by_key(|(hash, _)| *hash);
    for (_, target) in candidates.into_iter().take(2) {
        target.push_address(addr);
    }
}

fn handle_getaddr(ctx: &NodeContext, peer: &Arc<Peer>) -> Result<(), NetError> {
    // outbound getaddr is a fingerprinting vector: attackers stuff fake
    // addresses and ask for them back
    if !peer.inbound {
        debug!("ignoring \"getaddr\" from outbound connection, peer={}", peer.log_name());
        return Ok(());
    }
    if peer.sent_addr.swap(true, Ordering::Relaxed) {
        debug!("ignoring repeated \"getaddr\", peer={}", peer.log_name());
        return Ok(());
    }
    if let Ok(mut pending) = peer.addr_to_send.lock() {
        pending.clear();
    }
    for addr in ctx.addrman.get_addrs() {
        peer.push_address(addr);
    }
    Ok(())
}

fn handle_inv(ctx: &NodeContext, peer: &Arc<Peer>, invs: Vec<Inv>) -> Result<(), NetError> {
    if ctx.is_importing() {
        return Ok(());
    }
    debug!("received INV list of size {}", invs.len());

    // intolerant of an empty and useless request
    if invs.len() > MAX_INV_SZ || invs.is_empty() {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "message inv size() = {}",
            invs.len()
        )));
    }

    let mut blocks_only = ctx.config.blocks_only;
    if peer.whitelisted && ctx.config.whitelist_relay {
        blocks_only = false;
    }

    for inv in &invs {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if !(inv.inv_type == MSG_TX || inv.inv_type == MSG_BLOCK) || inv.is_null() {
            ctx.misbehaving(peer, 20);
            return Err(NetError::Protocol(format!(
                "message inv invalid type = {} or is null hash {}",
                inv.inv_type,
                hash256_to_hex(&inv.hash)
            )));
        }

        if inv.inv_type == MSG_BLOCK {
            let (already_have, in_ibd, locator) = {
                let mut main = ctx.main();
                let already_have = main.already_have_block(&inv.hash);
                main.update_block_availability(peer.id, inv.hash);
                let in_ibd = ctx.is_initial_block_download(&main);
                let best = main.best_header_id();
                let locator = main.active.locator(&main.block_index, best);
                (already_have, in_ibd, locator)
            };
            trace!(
                "got inv: {inv} {} peer={}",
                if already_have { "have" } else { "new" },
                peer.log_name()
            );
            // Announced blocks are fetched through their headers: an inv
            // is not trust-anchored, so requesting the header first stops
            // fake inventories from driving block downloads. During IBD
            // (except regtest) arrival order must track the header chain,
            // so skip even that.
            let fetchable = !already_have
                && (!in_ibd
                    || ctx.params.network == bchd_consensus::params::Network::Regtest);
            if fetchable {
                peer.push_message(NetMessage::GetHeaders {
                    locator,
                    stop: inv.hash,
                });
            } else {
                trace!(
                    "skipping request of block {}, already have: {already_have}",
                    hash256_to_hex(&inv.hash)
                );
            }
        } else {
            let already_have = ctx.mempool.contains(&inv.hash);
            trace!("got inv: {inv} have: {already_have} peer={}", peer.log_name());
            peer.add_inventory_known(inv);
            if blocks_only {
                debug!(
                    "transaction ({}) inv sent in violation of protocol peer={}",
                    hash256_to_hex(&inv.hash),
                    peer.log_name()
                );
            } else {
                let in_ibd = {
                    let main = ctx.main();
                    ctx.is_initial_block_download(&main)
                };
                // during IBD fetching loose transactions is wasted
                // bandwidth, they arrive in blocks anyway
                if !already_have && !in_ibd {
                    if ctx.requester.ask_for(inv, peer, now_usec()).is_some() {
                        peer.push_message(NetMessage::GetData(vec![*inv]));
                    }
                }
            }
        }

        ctx.observer.inventory(&inv.hash);

        if peer.send_size() > ctx.config.send_buffer_limit * 2 {
            ctx.misbehaving(peer, 50);
            return Err(NetError::Protocol(format!(
                "send buffer size() = {}",
                peer.send_size()
            )));
        }
    }
    Ok(())
}

fn handle_getdata(ctx: &NodeContext, peer: &Arc<Peer>, invs: Vec<Inv>) -> Result<(), NetError> {
    if ctx.is_importing() {
        debug!("received getdata from {} but importing", peer.log_name());
        return Ok(());
    }
    if invs.len() > MAX_INV_SZ || invs.is_empty() {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "message getdata size() = {}",
            invs.len()
        )));
    }
    for inv in &invs {
        if !matches!(
            inv.inv_type,
            MSG_TX | MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_THINBLOCK
        ) {
            ctx.misbehaving(peer, 20);
            return Err(NetError::Protocol(format!(
                "message inv invalid type = {}",
                inv.inv_type
            )));
        }
        if inv.inv_type == MSG_THINBLOCK {
            thin::basic_thinblock_checks(ctx, peer)?;
        }
    }

    debug!(
        "received getdata ({} invsz) peer={}",
        invs.len(),
        peer.log_name()
    );
    if invs.len() == 1 {
        debug!("received getdata for: {} peer={}", invs[0], peer.log_name());
    }

    {
        let mut backlog = peer
            .get_data_backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        backlog.extend(invs.iter().copied());
    }
    process_get_data(ctx, peer);
    Ok(())
}

fn handle_getblocks(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    locator: &[Hash256],
    stop: &Hash256,
) -> Result<(), NetError> {
    if ctx.is_importing() {
        return Ok(());
    }
    let main = ctx.main();
    let fork = main.active.find_fork(&main.block_index, locator);
    let mut walk = fork.and_then(|id| main.active.next(&main.block_index, id));
    debug!(
        "getblocks {} to {} from peer={}",
        walk.map(|id| main.block_index.get(id).height).unwrap_or(-1),
        if *stop == ZERO_HASH {
            "end".to_string()
        } else {
            hash256_to_hex(stop)
        },
        peer.log_name()
    );
    let mut limit = GETBLOCKS_LIMIT;
    while let Some(id) = walk {
        let entry = main.block_index.get(id);
        if entry.hash == *stop {
            debug!("  getblocks stopping at {} {}", entry.height, hash256_to_hex(&entry.hash));
            break;
        }
        peer.push_inventory(Inv::new(MSG_BLOCK, entry.hash));
        limit -= 1;
        if limit == 0 {
            // when this block is requested, we'll send an inv that
            // triggers the peer to getblocks the next batch
            debug!(
                "  getblocks stopping at limit {} {}",
                entry.height,
                hash256_to_hex(&entry.hash)
            );
            *peer.hash_continue.lock().unwrap_or_else(|e| e.into_inner()) = Some(entry.hash);
            break;
        }
        walk = main.active.next(&main.block_index, id);
    }
    Ok(())
}

fn handle_tx(ctx: &NodeContext, peer: &Arc<Peer>, tx: bchd_primitives::Transaction) -> Result<(), NetError> {
    // blocks-only mode drops loose transactions unless the peer is
    // whitelisted for relay
    if ctx.config.blocks_only && !(peer.whitelisted && ctx.config.whitelist_relay) {
        debug!(
            "transaction sent in violation of protocol peer={}",
            peer.log_name()
        );
        return Ok(());
    }

    let txid = tx.txid();
    let inv = Inv::new(MSG_TX, txid);
    // the tx is now queued for admission, though not yet in the mempool
    ctx.requester.processing(&inv, peer.id);
    ctx.mempool.enqueue_tx_for_admission(crate::external::TxInputData {
        tx,
        peer_id: peer.id,
        peer_name: peer.log_name(),
        whitelisted: peer.whitelisted,
    });
    peer.add_inventory_known(&inv);
    ctx.requester.update_txn_response_time(&inv, peer.id);
    Ok(())
}

fn handle_block(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    block: bchd_primitives::Block,
    _received_usec: i64,
) -> Result<(), NetError> {
    let hash = block.hash();
    let inv = Inv::new(MSG_BLOCK, hash);
    debug!("received block {} peer={}", hash256_to_hex(&hash), peer.log_name());

    // near the tip, push the block straight out the expedited channels
    let nearly_synced = {
        let main = ctx.main();
        ctx.can_direct_fetch(&main)
    };
    if nearly_synced && ctx.validator.check_block_header(&block.header).is_ok() {
        thin::send_expedited_block(ctx, &block, peer);
    }

    {
        let mut main = ctx.main();
        if let Some(state) = main.peer_state_mut(peer.id) {
            // a block can consume all bandwidth; headers are not late yet
            state.sync_start_time = now_secs();
        }
        if let Err(failure) = header_ingest::accept_block_header(ctx, &mut main, &block.header) {
            if failure.dos_score > 0 {
                ctx.misbehaving(peer, failure.dos_score);
            }
        }
        if let Some(id) = main.block_index.lookup(&hash) {
            main.block_index
                .set_status(id, crate::chain::STATUS_HAVE_DATA);
        }
    }
    // reset the ping clock for the same reason
    peer.ping_usec_start.store(now_usec(), Ordering::Relaxed);

    ctx.requester.received(&inv, peer.id);
    ctx.time_best_received.store(now_secs(), Ordering::Relaxed);
    if let Err(failure) = ctx.validator.process_new_block(block, peer.id, false) {
        if failure.dos_score > 0 {
            ctx.misbehaving(peer, failure.dos_score);
        }
        debug!(
            "block {} rejected: {}",
            hash256_to_hex(&hash),
            failure.reason
        );
    }
    Ok(())
}

fn handle_mempool(ctx: &NodeContext, peer: &Arc<Peer>) -> Result<(), NetError> {
    if ctx.net_totals.outbound_target_reached() && !peer.whitelisted {
        debug!(
            "mempool request with bandwidth limit reached, disconnect peer {}",
            peer.log_name()
        );
        peer.set_disconnect();
        return Ok(());
    }
    let txids = ctx.mempool.query_hashes();
    let have_filter = peer
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_some();
    let mut invs = Vec::new();
    for txid in txids {
        let inv = Inv::new(MSG_TX, txid);
        if have_filter {
            let Some(tx) = ctx.mempool.get(&txid) else {
                continue; // removed since query_hashes, maybe
            };
            let mut filter_slot = peer.filter.lock().unwrap_or_else(|e| e.into_inner());
            let relevant = match filter_slot.as_mut() {
                Some(filter) => filter.is_relevant_and_update(&tx),
                None => true,
            };
            if !relevant {
                continue;
            }
        }
        invs.push(inv);
        if invs.len() == MAX_INV_SZ {
            peer.push_message(NetMessage::Inv(std::mem::take(&mut invs)));
        }
    }
    if !invs.is_empty() {
        peer.push_message(NetMessage::Inv(invs));
    }
    Ok(())
}

fn handle_pong(peer: &Arc<Peer>, nonce: Option<u64>, received_usec: i64) {
    let outstanding = peer.ping_nonce_sent.load(Ordering::Relaxed);
    let mut finished = false;
    let mut problem: Option<&'static str> = None;

    match nonce {
        Some(nonce) => {
            if outstanding != 0 {
                if nonce == outstanding {
                    finished = true;
                    let elapsed = received_usec - peer.ping_usec_start.load(Ordering::Relaxed);
                    if elapsed > 0 {
                        peer.min_ping_usec.fetch_min(elapsed, Ordering::Relaxed);
                    } else {
                        problem = Some("Timing mishap");
                    }
                } else if nonce == 0 {
                    // most likely a bug in another implementation
                    finished = true;
                    problem = Some("Nonce zero");
                } else {
                    // normal when pings overlap
                    problem = Some("Nonce mismatch");
                }
            } else {
                problem = Some("Unsolicited pong without ping");
            }
        }
        None => {
            finished = true;
            problem = Some("Short payload");
        }
    }

    if let Some(problem) = problem {
        debug!(
            "pong peer={}: {problem}, {outstanding:x} expected, {:x} received",
            peer.log_name(),
            nonce.unwrap_or(0)
        );
    }
    if finished {
        peer.ping_nonce_sent.store(0, Ordering::Relaxed);
    }
}

fn handle_reject(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    payload: crate::message::RejectPayload,
) -> Result<(), NetError> {
    if let Some(hash) = payload.hash {
        debug!(
            "Reject {} code {:#x}: {}: hash {}",
            payload.message,
            payload.code,
            payload.reason,
            hash256_to_hex(&hash)
        );
        if payload.message == "block" {
            ctx.requester
                .rejected(&Inv::new(MSG_BLOCK, hash), peer.id, payload.code);
        } else if payload.message == "tx" {
            ctx.requester
                .rejected(&Inv::new(MSG_TX, hash), peer.id, payload.code);
        }
    } else {
        debug!(
            "Reject {} code {:#x}: {}",
            payload.message, payload.code, payload.reason
        );
    }
    Ok(())
}

fn handle_filterload(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    filter: BloomFilter,
) -> Result<(), NetError> {
    if !filter.is_within_size_constraints() {
        // there is no excuse for sending a too-large filter
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol("oversized bloom filter".to_string()));
    }
    *peer.filter.lock().unwrap_or_else(|e| e.into_inner()) = Some(filter);
    peer.relay_txes.store(true, Ordering::Relaxed);
    Ok(())
}

fn handle_filteradd(ctx: &NodeContext, peer: &Arc<Peer>, data: Vec<u8>) -> Result<(), NetError> {
    use bchd_consensus::protocol::MAX_SCRIPT_ELEMENT_SIZE;
    // no matched object can exceed the script element ceiling
    if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol("oversized filteradd element".to_string()));
    }
    let mut filter_slot = peer.filter.lock().unwrap_or_else(|e| e.into_inner());
    match filter_slot.as_mut() {
        Some(filter) => {
            filter.insert(&data);
            Ok(())
        }
        None => {
            drop(filter_slot);
            ctx.misbehaving(peer, 100);
            Err(NetError::Protocol("filteradd with no filter loaded".to_string()))
        }
    }
}

fn handle_filtersizexthin(ctx: &NodeContext, peer: &Arc<Peer>, size: u32) -> Result<(), NetError> {
    if peer.thin_block_capable() {
        peer.xthin_bloom_filter_size.store(size, Ordering::Relaxed);
        // never accept a smaller ceiling than the global minimum
        if size == 0 || size < SMALLEST_MAX_BLOOM_FILTER_SIZE {
            peer.push_message(NetMessage::Reject(RejectPayload {
                message: "filtersizext".to_string(),
                code: reject_code::INVALID,
                reason: "filter size was too small".to_string(),
                hash: None,
            }));
            debug!("disconnecting {}: bloom filter size too small", peer.log_name());
            peer.set_disconnect();
            return Err(NetError::Protocol("xthin filter size too small".to_string()));
        }
    } else {
        peer.set_disconnect();
        return Err(NetError::Protocol(
            "filtersizexthin from non thinblock peer".to_string(),
        ));
    }
    Ok(())
}

fn sanitize_subversion(subversion: &str) -> String {
    subversion
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(bchd_consensus::protocol::MAX_SUBVERSION_LENGTH)
        .collect()
}
