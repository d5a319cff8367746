//! Thin, xthin and graphene block relay, plus the expedited forwarding
//! subscription reached from the BU handshake.
//!
//! All three encodings ship the header and a list of short ids resolved
//! against the receiver's mempool; transactions the sender believes the
//! receiver lacks ride along, and anything still unresolved is fetched
//! with a follow-up request.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bchd_consensus::hash256_to_hex;
use bchd_consensus::Hash256;
use bchd_primitives::{Block, BlockHeader, DecodeError, Decoder, Encoder, Transaction};
use log::{debug, warn};

use crate::bloom::{murmur3_32, BloomFilter, BLOOM_UPDATE_NONE};
use crate::context::{now_secs, now_usec, NodeContext};
use crate::error::NetError;
use crate::inv::{Inv, MSG_BLOCK, MSG_GRAPHENEBLOCK, MSG_THINBLOCK, MSG_XTHINBLOCK};
use crate::message::NetMessage;
use crate::peer::Peer;

pub const EXPEDITED_STOP: u64 = 1;
pub const EXPEDITED_BLOCKS: u64 = 2;
pub const EXPEDITED_TXNS: u64 = 4;

/// Disconnect a compact-relay peer after six unanswered retry intervals;
/// this bounds how many half-built blocks a slow peer can pin in memory.
pub const THIN_TIMEOUT_MULTIPLIER: i64 = 6;

const DECODE_MAX_THIN_TXS: u64 = 16_000_000;

/// First eight txid bytes, the xthin short id.
pub fn short_id64(txid: &Hash256) -> u64 {
    u64::from_le_bytes([
        txid[0], txid[1], txid[2], txid[3], txid[4], txid[5], txid[6], txid[7],
    ])
}

/// Salted short id for graphene; the nonce keeps id collisions unstable
/// across blocks.
pub fn graphene_short_id(nonce: u64, txid: &Hash256) -> u64 {
    let low = murmur3_32(nonce as u32, txid) as u64;
    let high = murmur3_32((nonce >> 32) as u32, txid) as u64;
    high << 32 | low
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThinBlock {
    pub header: BlockHeader,
    pub tx_hashes: Vec<Hash256>,
    pub missing: Vec<Transaction>,
}

impl ThinBlock {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        self.header.consensus_encode_to(encoder);
        encoder.write_varint(self.tx_hashes.len() as u64);
        for hash in &self.tx_hashes {
            encoder.write_hash_le(hash);
        }
        encoder.write_varint(self.missing.len() as u64);
        for tx in &self.missing {
            tx.consensus_encode_to(encoder);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut tx_hashes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            tx_hashes.push(decoder.read_hash()?);
        }
        let missing_count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut missing = Vec::with_capacity(missing_count.min(4096));
        for _ in 0..missing_count {
            missing.push(Transaction::consensus_decode_from(decoder)?);
        }
        Ok(Self {
            header,
            tx_hashes,
            missing,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct XThinBlock {
    pub header: BlockHeader,
    pub short_ids: Vec<u64>,
    pub missing: Vec<Transaction>,
}

impl XThinBlock {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        self.header.consensus_encode_to(encoder);
        encoder.write_varint(self.short_ids.len() as u64);
        for id in &self.short_ids {
            encoder.write_u64_le(*id);
        }
        encoder.write_varint(self.missing.len() as u64);
        for tx in &self.missing {
            tx.consensus_encode_to(encoder);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut short_ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            short_ids.push(decoder.read_u64_le()?);
        }
        let missing_count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut missing = Vec::with_capacity(missing_count.min(4096));
        for _ in 0..missing_count {
            missing.push(Transaction::consensus_decode_from(decoder)?);
        }
        Ok(Self {
            header,
            short_ids,
            missing,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GrapheneBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<u64>,
    pub extra: Vec<Transaction>,
}

impl GrapheneBlock {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        self.header.consensus_encode_to(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_varint(self.short_ids.len() as u64);
        for id in &self.short_ids {
            encoder.write_u64_le(*id);
        }
        encoder.write_varint(self.extra.len() as u64);
        for tx in &self.extra {
            tx.consensus_encode_to(encoder);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let nonce = decoder.read_u64_le()?;
        let count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut short_ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            short_ids.push(decoder.read_u64_le()?);
        }
        let extra_count = decoder.read_varint_max(DECODE_MAX_THIN_TXS)? as usize;
        let mut extra = Vec::with_capacity(extra_count.min(4096));
        for _ in 0..extra_count {
            extra.push(Transaction::consensus_decode_from(decoder)?);
        }
        Ok(Self {
            header,
            nonce,
            short_ids,
            extra,
        })
    }
}

/// One compact-relay request we are waiting on, plus any half-finished
/// reconstruction.
#[derive(Debug, Default)]
pub struct ThinFlight {
    pub request_time_usec: i64,
    pub received: bool,
    pub pending: Option<PendingReconstruction>,
}

#[derive(Debug)]
pub struct PendingReconstruction {
    pub header: BlockHeader,
    pub nonce: Option<u64>,
    pub slots: Vec<TxSlot>,
}

#[derive(Debug)]
pub enum TxSlot {
    Have(Transaction),
    Want(u64),
}

impl PendingReconstruction {
    pub fn missing_ids(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                TxSlot::Want(id) => Some(*id),
                TxSlot::Have(_) => None,
            })
            .collect()
    }

    pub fn fill(&mut self, txs: Vec<Transaction>) {
        let salt = self.nonce;
        let mut by_id: HashMap<u64, Transaction> = txs
            .into_iter()
            .map(|tx| {
                let txid = tx.txid();
                let id = match salt {
                    Some(nonce) => graphene_short_id(nonce, &txid),
                    None => short_id64(&txid),
                };
                (id, tx)
            })
            .collect();
        for slot in &mut self.slots {
            if let TxSlot::Want(id) = slot {
                if let Some(tx) = by_id.remove(id) {
                    *slot = TxSlot::Have(tx);
                }
            }
        }
    }

    pub fn into_block(self) -> Option<Block> {
        let mut txs = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                TxSlot::Have(tx) => txs.push(tx),
                TxSlot::Want(_) => return None,
            }
        }
        Some(Block {
            header: self.header,
            txs,
        })
    }
}

pub fn build_thin_block(block: &Block, exclude: &BloomFilter) -> ThinBlock {
    let mut tx_hashes = Vec::with_capacity(block.txs.len());
    let mut missing = Vec::new();
    for (index, tx) in block.txs.iter().enumerate() {
        let txid = tx.txid();
        tx_hashes.push(txid);
        if index == 0 || !exclude.contains(&txid) {
            missing.push(tx.clone());
        }
    }
    ThinBlock {
        header: block.header,
        tx_hashes,
        missing,
    }
}

pub fn build_xthin_block(block: &Block, exclude: &BloomFilter) -> XThinBlock {
    let mut short_ids = Vec::with_capacity(block.txs.len());
    let mut missing = Vec::new();
    for (index, tx) in block.txs.iter().enumerate() {
        let txid = tx.txid();
        short_ids.push(short_id64(&txid));
        if index == 0 || !exclude.contains(&txid) {
            missing.push(tx.clone());
        }
    }
    XThinBlock {
        header: block.header,
        short_ids,
        missing,
    }
}

pub fn build_graphene_block(block: &Block, nonce: u64) -> GrapheneBlock {
    let mut short_ids = Vec::with_capacity(block.txs.len());
    let mut extra = Vec::new();
    for (index, tx) in block.txs.iter().enumerate() {
        let txid = tx.txid();
        short_ids.push(graphene_short_id(nonce, &txid));
        if index == 0 {
            extra.push(tx.clone());
        }
    }
    GrapheneBlock {
        header: block.header,
        nonce,
        short_ids,
        extra,
    }
}

/// Bloom of every mempool txid, sent with get_xthin so the block source
/// can omit transactions we already hold.
pub fn build_mempool_filter(ctx: &NodeContext) -> BloomFilter {
    let txids = ctx.mempool.query_hashes();
    let mut filter = BloomFilter::new(txids.len(), 0.001, rand::random(), BLOOM_UPDATE_NONE);
    for txid in &txids {
        filter.insert(txid);
    }
    filter
}

/// Route block-body requests: near the tip a single block goes out as a
/// graphene or xthin request to a capable peer, everything else as plain
/// getdata. `near_tip` is the caller's view under its own main lock.
pub fn request_blocks_with(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    invs: &[Inv],
    near_tip: bool,
) {
    if near_tip && invs.len() == 1 && peer.thin_block_capable() {
        let hash = invs[0].hash;
        if ctx.config.graphene_enabled {
            mark_in_flight(peer, hash, true);
            peer.push_message(NetMessage::GetGraphene {
                inv: Inv::new(MSG_GRAPHENEBLOCK, hash),
                mempool_tx_count: ctx.mempool.query_hashes().len() as u64,
            });
            return;
        }
        if ctx.config.thin_blocks_enabled {
            mark_in_flight(peer, hash, false);
            peer.push_message(NetMessage::GetXthin {
                inv: Inv::new(MSG_XTHINBLOCK, hash),
                mempool_filter: build_mempool_filter(ctx),
            });
            return;
        }
    }
    for chunk in invs.chunks(16) {
        peer.push_message(NetMessage::GetData(chunk.to_vec()));
    }
}

pub fn request_blocks(ctx: &NodeContext, peer: &Arc<Peer>, invs: &[Inv]) {
    let near_tip = {
        let main = ctx.main();
        ctx.can_direct_fetch(&main)
    };
    request_blocks_with(ctx, peer, invs, near_tip);
}

/// Capability plus rate-limit gate shared by every thin-block entry
/// point. More than ~20 requests inside the decay window on mainnet
/// costs the peer half a ban score.
pub fn basic_thinblock_checks(ctx: &NodeContext, peer: &Arc<Peer>) -> Result<(), NetError> {
    if !peer.thin_block_capable() {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "thinblock message received from a non thinblock node, peer={}",
            peer.log_name()
        )));
    }
    if ctx.params.network != bchd_consensus::params::Network::Regtest {
        let count = peer.bump_get_xthin_rate(now_secs());
        debug!("get_xthin count is {count:.2} for peer={}", peer.log_name());
        if ctx.params.network == bchd_consensus::params::Network::Main && count >= 20.0 {
            ctx.misbehaving(peer, 50);
            return Err(NetError::Protocol(
                "requesting too many getdata thinblocks".to_string(),
            ));
        }
    }
    Ok(())
}

/// Encode and push a thin variant of `block`, falling back to the full
/// block when the encoding would not actually be thinner.
pub fn send_xthin_block(ctx: &NodeContext, peer: &Arc<Peer>, block: &Block, inv: &Inv) {
    let message = match inv.inv_type {
        MSG_XTHINBLOCK => {
            let filter = peer
                .thin_filter
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(BloomFilter::match_all);
            NetMessage::XThinBlock(build_xthin_block(block, &filter))
        }
        MSG_THINBLOCK => {
            let filter = peer
                .filter
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(BloomFilter::match_all);
            NetMessage::ThinBlock(build_thin_block(block, &filter))
        }
        _ => NetMessage::Block(block.clone()),
    };
    let thin_size = message.encode_payload().len();
    let full_size = block.consensus_encode().len();
    if thin_size >= full_size {
        debug!(
            "thin encoding ({thin_size} bytes) not smaller than block ({full_size} bytes), \
             sending full block to peer={}",
            peer.log_name()
        );
        peer.blocks_sent.fetch_add(1, Ordering::Relaxed);
        peer.push_message(NetMessage::Block(block.clone()));
        return;
    }
    peer.blocks_sent.fetch_add(1, Ordering::Relaxed);
    peer.push_message(message);
}

pub fn handle_get_xthin(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    inv: &Inv,
    mempool_filter: BloomFilter,
) -> Result<(), NetError> {
    basic_thinblock_checks(ctx, peer)?;

    if !matches!(inv.inv_type, MSG_XTHINBLOCK | MSG_THINBLOCK) || inv.is_null() {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "invalid get_xthin type={} hash={}",
            inv.inv_type,
            hash256_to_hex(&inv.hash)
        )));
    }

    if !mempool_filter.is_within_size_constraints() {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol("oversized get_xthin filter".to_string()));
    }
    *peer.thin_filter.lock().unwrap_or_else(|e| e.into_inner()) = Some(mempool_filter);

    let allowed = {
        let main = ctx.main();
        match main.block_index.lookup(&inv.hash) {
            Some(id) => crate::block_service::serving_policy_allows(ctx, &main, peer, id),
            None => {
                drop(main);
                ctx.misbehaving(peer, 100);
                return Err(NetError::Protocol(format!(
                    "peer {} requested nonexistent block {}",
                    peer.log_name(),
                    hash256_to_hex(&inv.hash)
                )));
            }
        }
    };
    if !allowed {
        return Ok(());
    }
    match ctx.block_store.read_block(&inv.hash) {
        Some(block) => {
            send_xthin_block(ctx, peer, &block, inv);
            Ok(())
        }
        None => Err(NetError::Protocol(format!(
            "peer {} requested block {} that cannot be read",
            peer.log_name(),
            hash256_to_hex(&inv.hash)
        ))),
    }
}

fn mempool_short_id_map(ctx: &NodeContext, nonce: Option<u64>) -> HashMap<u64, Hash256> {
    let mut map = HashMap::new();
    for txid in ctx.mempool.query_hashes() {
        let id = match nonce {
            Some(nonce) => graphene_short_id(nonce, &txid),
            None => short_id64(&txid),
        };
        map.entry(id).or_insert(txid);
    }
    map
}

/// Shared reconstruction path for xthin, graphene and expedited blocks.
/// Returns the ids still missing after the mempool pass, an empty list
/// meaning the block was completed and handed to the validator.
fn reconstruct_thin(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    header: BlockHeader,
    short_ids: &[u64],
    provided: Vec<Transaction>,
    nonce: Option<u64>,
) -> Result<Vec<u64>, NetError> {
    let mut pending = PendingReconstruction {
        header,
        nonce,
        slots: short_ids.iter().map(|id| TxSlot::Want(*id)).collect(),
    };
    pending.fill(provided);

    let lookup = mempool_short_id_map(ctx, nonce);
    for slot in &mut pending.slots {
        if let TxSlot::Want(id) = slot {
            if let Some(txid) = lookup.get(id) {
                if let Some(tx) = ctx.mempool.get(txid) {
                    *slot = TxSlot::Have(tx.as_ref().clone());
                }
            }
        }
    }

    let missing = pending.missing_ids();
    if missing.is_empty() {
        let hash = pending.header.hash();
        if let Some(block) = pending.into_block() {
            debug!(
                "reconstructed thin block {} with {} txs from peer={}",
                hash256_to_hex(&hash),
                block.txs.len(),
                peer.log_name()
            );
            deliver_block(ctx, peer, block);
        }
        return Ok(Vec::new());
    }

    // park the half-built block until the blocktx response arrives
    let hash = header.hash();
    let map = if nonce.is_some() {
        &peer.graphene_in_flight
    } else {
        &peer.thin_in_flight
    };
    let mut flights = map.lock().unwrap_or_else(|e| e.into_inner());
    let flight = flights.entry(hash).or_default();
    flight.received = true;
    flight.pending = Some(pending);
    Ok(missing)
}

fn deliver_block(ctx: &NodeContext, peer: &Arc<Peer>, block: Block) {
    let hash = block.hash();
    {
        let mut main = ctx.main();
        if let Some(id) = main.block_index.lookup(&hash) {
            main.block_index
                .set_status(id, crate::chain::STATUS_HAVE_DATA);
        }
    }
    ctx.requester.received(&Inv::new(MSG_BLOCK, hash), peer.id);
    if let Err(failure) = ctx.validator.process_new_block(block, peer.id, false) {
        if failure.dos_score > 0 {
            ctx.misbehaving(peer, failure.dos_score);
        }
        warn!(
            "thin block {} rejected: {}",
            hash256_to_hex(&hash),
            failure.reason
        );
    }
}

pub fn handle_xthinblock(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    thin: XThinBlock,
) -> Result<(), NetError> {
    let hash = thin.header.hash();
    let requested = {
        let mut flights = peer
            .thin_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match flights.get_mut(&hash) {
            Some(flight) => {
                flight.received = true;
                true
            }
            None => false,
        }
    };
    if !requested {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "unrequested xthinblock {} from peer={}",
            hash256_to_hex(&hash),
            peer.log_name()
        )));
    }
    let missing = reconstruct_thin(ctx, peer, thin.header, &thin.short_ids, thin.missing, None)?;
    if !missing.is_empty() {
        debug!(
            "re-requesting {} txs for xthinblock {}",
            missing.len(),
            hash256_to_hex(&hash)
        );
        peer.push_message(NetMessage::GetXBlockTx {
            block_hash: hash,
            short_ids: missing,
        });
    } else {
        peer.thin_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&hash);
    }
    Ok(())
}

pub fn handle_thinblock(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    thin: ThinBlock,
) -> Result<(), NetError> {
    let hash = thin.header.hash();
    let requested = peer
        .thin_in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains_key(&hash);
    if !requested {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "unrequested thinblock {} from peer={}",
            hash256_to_hex(&hash),
            peer.log_name()
        )));
    }
    let short_ids: Vec<u64> = thin.tx_hashes.iter().map(short_id64).collect();
    let missing = reconstruct_thin(ctx, peer, thin.header, &short_ids, thin.missing, None)?;
    if !missing.is_empty() {
        peer.push_message(NetMessage::GetXBlockTx {
            block_hash: hash,
            short_ids: missing,
        });
    } else {
        peer.thin_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&hash);
    }
    Ok(())
}

pub fn handle_get_xblocktx(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    block_hash: &Hash256,
    short_ids: &[u64],
    graphene: bool,
) -> Result<(), NetError> {
    if !peer.thin_block_capable() {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(
            "blocktx request from non thinblock node".to_string(),
        ));
    }
    if short_ids.is_empty() {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol("empty blocktx request".to_string()));
    }
    let have = {
        let main = ctx.main();
        main.already_have_block(block_hash)
    };
    if !have {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "blocktx request for unknown block {}",
            hash256_to_hex(block_hash)
        )));
    }
    let Some(block) = ctx.block_store.read_block(block_hash) else {
        return Err(NetError::Protocol(format!(
            "blocktx request for unreadable block {}",
            hash256_to_hex(block_hash)
        )));
    };
    let wanted: std::collections::HashSet<u64> = short_ids.iter().copied().collect();
    // graphene ids are salted with the nonce we used when serving the
    // block; without it there is nothing to match against
    let nonce = if graphene {
        let sent = {
            let nonces = peer
                .graphene_sent_nonce
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            nonces.get(block_hash).copied()
        };
        match sent {
            Some(nonce) => Some(nonce),
            None => {
                ctx.misbehaving(peer, 20);
                return Err(NetError::Protocol(format!(
                    "graphenetx request for unserved block {}",
                    hash256_to_hex(block_hash)
                )));
            }
        }
    } else {
        None
    };
    let txs: Vec<Transaction> = block
        .txs
        .iter()
        .filter(|tx| {
            let txid = tx.txid();
            let id = match nonce {
                Some(nonce) => graphene_short_id(nonce, &txid),
                None => short_id64(&txid),
            };
            wanted.contains(&id)
        })
        .cloned()
        .collect();
    peer.txs_sent.fetch_add(txs.len() as u64, Ordering::Relaxed);
    if graphene {
        peer.push_message(NetMessage::GrapheneTx {
            block_hash: *block_hash,
            txs,
        });
    } else {
        peer.push_message(NetMessage::XBlockTx {
            block_hash: *block_hash,
            txs,
        });
    }
    Ok(())
}

pub fn handle_blocktx_response(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    block_hash: &Hash256,
    txs: Vec<Transaction>,
    graphene: bool,
) -> Result<(), NetError> {
    let map = if graphene {
        &peer.graphene_in_flight
    } else {
        &peer.thin_in_flight
    };
    let pending = {
        let mut flights = map.lock().unwrap_or_else(|e| e.into_inner());
        match flights.get_mut(block_hash) {
            Some(flight) => flight.pending.take(),
            None => None,
        }
    };
    let Some(mut pending) = pending else {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "unsolicited blocktx for {} from peer={}",
            hash256_to_hex(block_hash),
            peer.log_name()
        )));
    };
    pending.fill(txs);
    if pending.missing_ids().is_empty() {
        if let Some(block) = pending.into_block() {
            deliver_block(ctx, peer, block);
        }
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(block_hash);
    } else {
        // still incomplete after the response; give up on this source
        debug!(
            "blocktx response for {} still incomplete, dropping reconstruction",
            hash256_to_hex(block_hash)
        );
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(block_hash);
        peer.set_disconnect();
    }
    Ok(())
}

pub fn handle_get_graphene(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    inv: &Inv,
    _mempool_tx_count: u64,
) -> Result<(), NetError> {
    if inv.is_null() || inv.inv_type != crate::inv::MSG_GRAPHENEBLOCK {
        ctx.misbehaving(peer, 100);
        return Err(NetError::Protocol(format!(
            "invalid get_graphene type={}",
            inv.inv_type
        )));
    }
    let allowed = {
        let main = ctx.main();
        match main.block_index.lookup(&inv.hash) {
            Some(id) => crate::block_service::serving_policy_allows(ctx, &main, peer, id),
            None => {
                drop(main);
                ctx.misbehaving(peer, 100);
                return Err(NetError::Protocol(format!(
                    "peer {} requested nonexistent graphene block {}",
                    peer.log_name(),
                    hash256_to_hex(&inv.hash)
                )));
            }
        }
    };
    if !allowed {
        return Ok(());
    }
    let Some(block) = ctx.block_store.read_block(&inv.hash) else {
        return Err(NetError::Protocol(format!(
            "graphene block {} cannot be read",
            hash256_to_hex(&inv.hash)
        )));
    };
    let nonce = rand::random();
    let graphene = build_graphene_block(&block, nonce);
    let message = NetMessage::GrapheneBlock(graphene);
    peer.blocks_sent.fetch_add(1, Ordering::Relaxed);
    if message.encode_payload().len() >= block.consensus_encode().len() {
        peer.push_message(NetMessage::Block(block));
    } else {
        peer.graphene_sent_nonce
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(inv.hash, nonce);
        peer.push_message(message);
    }
    Ok(())
}

pub fn handle_grapheneblock(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    graphene: GrapheneBlock,
) -> Result<(), NetError> {
    let hash = graphene.header.hash();
    let requested = {
        let mut flights = peer
            .graphene_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match flights.get_mut(&hash) {
            Some(flight) => {
                flight.received = true;
                true
            }
            None => false,
        }
    };
    if !requested {
        ctx.misbehaving(peer, 20);
        return Err(NetError::Protocol(format!(
            "unrequested graphene block {} from peer={}",
            hash256_to_hex(&hash),
            peer.log_name()
        )));
    }
    let missing = reconstruct_thin(
        ctx,
        peer,
        graphene.header,
        &graphene.short_ids,
        graphene.extra,
        Some(graphene.nonce),
    )?;
    if !missing.is_empty() {
        peer.push_message(NetMessage::GetGrapheneTx {
            block_hash: hash,
            short_ids: missing,
        });
    } else {
        peer.graphene_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&hash);
    }
    Ok(())
}

/// Record an outgoing thin or graphene request so the send pump can
/// enforce the in-flight timeout.
pub fn mark_in_flight(peer: &Peer, hash: Hash256, graphene: bool) {
    let map = if graphene {
        &peer.graphene_in_flight
    } else {
        &peer.thin_in_flight
    };
    let mut flights = map.lock().unwrap_or_else(|e| e.into_inner());
    flights.entry(hash).or_insert_with(|| ThinFlight {
        request_time_usec: now_usec(),
        received: false,
        pending: None,
    });
}

/// Disconnect slow compact-relay peers rather than keeping half-built
/// blocks around; a late arrival would otherwise get them banned.
pub fn check_thin_timeouts(ctx: &NodeContext, peer: &Arc<Peer>, now_us: i64) {
    if peer.whitelisted || ctx.params.network == bchd_consensus::params::Network::Regtest {
        return;
    }
    let timeout = THIN_TIMEOUT_MULTIPLIER * bchd_consensus::protocol::BLK_REQ_RETRY_INTERVAL_USEC;
    for map in [&peer.thin_in_flight, &peer.graphene_in_flight] {
        let flights = map.lock().unwrap_or_else(|e| e.into_inner());
        for (hash, flight) in flights.iter() {
            if !flight.received && now_us - flight.request_time_usec > timeout {
                debug!(
                    "disconnecting peer {} due to thinblock download timeout on {}",
                    peer.log_name(),
                    hash256_to_hex(hash)
                );
                peer.set_disconnect();
                return;
            }
        }
    }
}

pub fn handle_expedited_request(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    options: u64,
) -> Result<(), NetError> {
    if !peer.successfully_connected.load(Ordering::Relaxed) {
        ctx.misbehaving(peer, 5);
        return Err(NetError::Protocol(
            "expedited request before handshake".to_string(),
        ));
    }
    if options & EXPEDITED_STOP != 0 {
        peer.expedited_blocks_to.store(false, Ordering::Relaxed);
    } else if options & EXPEDITED_BLOCKS != 0 {
        peer.expedited_blocks_to.store(true, Ordering::Relaxed);
        debug!("peer {} subscribed to expedited blocks", peer.log_name());
    }
    Ok(())
}

/// After BUVERACK, subscribe upstream for expedited blocks when enabled.
pub fn check_and_request_expedited_blocks(ctx: &NodeContext, peer: &Arc<Peer>) {
    if !ctx.config.expedited_blocks || !peer.thin_block_capable() {
        return;
    }
    peer.expedited_upstream.store(true, Ordering::Relaxed);
    peer.push_message(NetMessage::ExpeditedRequest {
        options: EXPEDITED_BLOCKS,
    });
}

/// Forward a freshly received block to expedited subscribers before full
/// validation completes.
pub fn send_expedited_block(ctx: &NodeContext, block: &Block, from: &Peer) {
    let thin = build_xthin_block(block, &BloomFilter::match_all());
    for peer in ctx.peers.snapshot() {
        if peer.id == from.id || !peer.expedited_blocks_to.load(Ordering::Relaxed) {
            continue;
        }
        peer.push_message(NetMessage::ExpeditedBlock {
            hops: 0,
            thin: thin.clone(),
        });
    }
}

pub fn handle_expedited_block(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    _hops: u8,
    thin: XThinBlock,
) -> Result<(), NetError> {
    if !peer.expedited_upstream.load(Ordering::Relaxed) {
        // tolerated, but scored: we never asked this peer for expedited
        // forwarding
        ctx.misbehaving(peer, 5);
        return Ok(());
    }
    let hash = thin.header.hash();
    {
        let main = ctx.main();
        if main.already_have_block(&hash) {
            return Ok(());
        }
    }
    let missing = reconstruct_thin(ctx, peer, thin.header, &thin.short_ids, thin.missing, None)?;
    if !missing.is_empty() {
        mark_in_flight(peer, hash, false);
        peer.push_message(NetMessage::GetXBlockTx {
            block_hash: hash,
            short_ids: missing,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchd_primitives::{OutPoint, TxIn, TxOut};

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([tag; 32], 0),
                script_sig: vec![tag],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut {
                value: tag as i64,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(tx_count: u8) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [1; 32],
                merkle_root: [2; 32],
                time: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 7,
            },
            txs: (0..tx_count).map(tx).collect(),
        }
    }

    #[test]
    fn thin_payloads_roundtrip() {
        let block = block(4);
        let thin = build_thin_block(&block, &BloomFilter::match_all());
        let mut encoder = Encoder::new();
        thin.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let decoded = ThinBlock::consensus_decode_from(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, thin);

        let xthin = build_xthin_block(&block, &BloomFilter::match_all());
        let mut encoder = Encoder::new();
        xthin.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let decoded = XThinBlock::consensus_decode_from(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, xthin);

        let graphene = build_graphene_block(&block, 99);
        let mut encoder = Encoder::new();
        graphene.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let decoded = GrapheneBlock::consensus_decode_from(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, graphene);
    }

    #[test]
    fn excluded_txs_are_not_resent() {
        let block = block(4);
        let mut have = BloomFilter::new(10, 0.000001, 0, crate::bloom::BLOOM_UPDATE_NONE);
        have.insert(&block.txs[2].txid());
        let xthin = build_xthin_block(&block, &have);
        assert_eq!(xthin.short_ids.len(), 4);
        // coinbase always included; tx 2 withheld
        assert_eq!(xthin.missing.len(), 3);
        assert!(xthin.missing.iter().all(|tx| tx.txid() != block.txs[2].txid()));
    }

    #[test]
    fn pending_reconstruction_fills_and_completes() {
        let block = block(3);
        let short_ids: Vec<u64> = block.txs.iter().map(|tx| short_id64(&tx.txid())).collect();
        let mut pending = PendingReconstruction {
            header: block.header,
            nonce: None,
            slots: short_ids.iter().map(|id| TxSlot::Want(*id)).collect(),
        };
        pending.fill(vec![block.txs[0].clone(), block.txs[2].clone()]);
        assert_eq!(pending.missing_ids(), vec![short_ids[1]]);
        pending.fill(vec![block.txs[1].clone()]);
        assert!(pending.missing_ids().is_empty());
        let rebuilt = pending.into_block().unwrap();
        assert_eq!(rebuilt, block);
    }
}
