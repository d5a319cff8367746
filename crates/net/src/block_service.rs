//! Serving `getdata` for blocks, filtered blocks, thin blocks and
//! transactions.

use std::sync::Arc;

use bchd_consensus::hash256_to_hex;
use bchd_primitives::{Block, PartialMerkleTree};
use log::{debug, info};

use crate::chain::{proof_equivalent_time, BlockId, STATUS_EXCESSIVE, STATUS_VALID_SCRIPTS};
use crate::context::{MainState, NodeContext};
use crate::inv::{Inv, MSG_BLOCK, MSG_FILTERED_BLOCK, MSG_THINBLOCK, MSG_TX, MSG_XTHINBLOCK};
use crate::message::{MerkleBlockPayload, NetMessage};
use crate::peer::Peer;
use crate::thin;

const ONE_MONTH_SECS: i64 = 30 * 24 * 60 * 60;
const ONE_WEEK_SECS: i64 = 7 * 24 * 60 * 60;

/// Anti-fingerprinting and anti-amplification policy for a block that is
/// not on the active chain: it must be fully valid, recent in wall-clock
/// time, recent in equivalent proof-of-work, and not excessive.
pub fn serving_policy_allows(
    ctx: &NodeContext,
    main: &MainState,
    peer: &Peer,
    id: BlockId,
) -> bool {
    if main.active.contains(&main.block_index, id) {
        return true;
    }
    let entry = main.block_index.get(id);
    let Some(best_header) = main.best_header_id() else {
        return false;
    };
    let allowed = entry.is_valid(STATUS_VALID_SCRIPTS)
        && main.block_index.get(best_header).time() - entry.time() < ONE_MONTH_SECS
        && proof_equivalent_time(
            &main.block_index,
            best_header,
            id,
            best_header,
            ctx.params.consensus.pow_target_spacing,
        ) < ONE_MONTH_SECS;
    if !allowed {
        info!(
            "ignoring request from peer={} for old block that isn't in the main chain",
            peer.log_name()
        );
        return false;
    }
    if entry.status & STATUS_EXCESSIVE != 0 {
        info!(
            "ignoring request from peer={} for excessive block of height {} not on the main chain",
            peer.log_name(),
            entry.height
        );
        return false;
    }
    true
}

fn push_block_response(ctx: &NodeContext, peer: &Arc<Peer>, inv: &Inv, block: Block) {
    match inv.inv_type {
        MSG_BLOCK => {
            peer.blocks_sent
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            peer.push_message(NetMessage::Block(block));
        }
        MSG_THINBLOCK | MSG_XTHINBLOCK => {
            debug!("sending thinblock by inv queue getdata message");
            thin::send_xthin_block(ctx, peer, &block, inv);
        }
        MSG_FILTERED_BLOCK => {
            let mut filter_slot = peer.filter.lock().unwrap_or_else(|e| e.into_inner());
            let Some(filter) = filter_slot.as_mut() else {
                return; // no filter loaded, no response
            };
            let txids: Vec<_> = block.txs.iter().map(|tx| tx.txid()).collect();
            let matches: Vec<bool> = block
                .txs
                .iter()
                .map(|tx| filter.is_relevant_and_update(tx))
                .collect();
            drop(filter_slot);
            let tree = PartialMerkleTree::from_txids(&txids, &matches);
            peer.blocks_sent
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            peer.push_message(NetMessage::MerkleBlock(MerkleBlockPayload {
                header: block.header,
                tree,
            }));
            // also push the matched transactions so the SPV peer is not
            // forced into a second round trip; duplicates are allowed by
            // the protocol, omissions are not
            for (index, matched) in matches.iter().enumerate() {
                if *matched {
                    peer.txs_sent
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    peer.push_message(NetMessage::Tx(block.txs[index].clone()));
                }
            }
        }
        _ => {}
    }
}

/// Drain the peer's getdata backlog. Serves at most one block-class item
/// per call so the main lock is never held across many large reads;
/// returns true if any work was done.
pub fn process_get_data(ctx: &NodeContext, peer: &Arc<Peer>) -> bool {
    let mut got_work_done = false;
    let mut not_found: Vec<Inv> = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        // don't bother when the send buffer is too full to respond anyway
        if peer.send_size() >= ctx.config.send_buffer_limit {
            break;
        }
        let inv = {
            let mut backlog = peer
                .get_data_backlog
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match backlog.pop_front() {
                Some(inv) => inv,
                None => break,
            }
        };
        got_work_done = true;

        if matches!(
            inv.inv_type,
            MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_THINBLOCK | MSG_XTHINBLOCK
        ) {
            let mut send_block = None;
            {
                let main = ctx.main();
                if let Some(id) = main.block_index.lookup(&inv.hash) {
                    let mut allowed = serving_policy_allows(ctx, &main, peer, id);

                    // stop serving week-old history (and filtered blocks)
                    // once past the outbound bandwidth target
                    if allowed && ctx.net_totals.outbound_target_reached() && !peer.whitelisted {
                        let old = match main.best_header_id() {
                            Some(best) => {
                                main.block_index.get(best).time()
                                    - main.block_index.get(id).time()
                                    > ONE_WEEK_SECS
                            }
                            None => false,
                        };
                        if old || inv.inv_type == MSG_FILTERED_BLOCK {
                            debug!(
                                "historical block serving limit reached, disconnect peer {}",
                                peer.log_name()
                            );
                            peer.set_disconnect();
                            allowed = false;
                        }
                    }

                    // pruned nodes may have deleted the data since
                    if allowed && main.block_index.get(id).have_data() {
                        send_block = Some(inv.hash);
                    }
                }
            }
            if let Some(hash) = send_block {
                match ctx.block_store.read_block(&hash) {
                    Some(block) => {
                        push_block_response(ctx, peer, &inv, block);

                        // trigger the peer to ask for the next batch
                        let continue_hit = {
                            let mut slot = peer
                                .hash_continue
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            if *slot == Some(inv.hash) {
                                *slot = None;
                                true
                            } else {
                                false
                            }
                        };
                        if continue_hit {
                            let tip_inv = {
                                let main = ctx.main();
                                main.active
                                    .tip()
                                    .map(|tip| Inv::new(MSG_BLOCK, main.block_index.get(tip).hash))
                            };
                            if let Some(tip_inv) = tip_inv {
                                // must send even if redundant, bypassing
                                // the known-inventory filter
                                peer.push_message(NetMessage::Inv(vec![tip_inv]));
                            }
                        }
                    }
                    None => {
                        // known but not loadable yet; no response
                        debug!("unable to load block {} from disk", hash256_to_hex(&hash));
                    }
                }
            }
            ctx.observer.inventory(&inv.hash);
            // one block-class item per entry; these are large and high
            // priority, let the reply drain before reading the queue again
            break;
        } else if inv.is_known_type() {
            let mut pushed = false;
            // copy the handle out before pushing; the relay lock is never
            // held across a send
            let relayed = {
                let pool = ctx.relay_pool.lock().unwrap_or_else(|e| e.into_inner());
                pool.get(&inv)
            };
            if let Some(tx) = relayed {
                peer.push_message(NetMessage::Tx(tx.as_ref().clone()));
                peer.txs_sent
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                pushed = true;
            }
            if !pushed && inv.inv_type == MSG_TX {
                if let Some(tx) = ctx.mempool.get(&inv.hash) {
                    peer.push_message(NetMessage::Tx(tx.as_ref().clone()));
                    peer.txs_sent
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    pushed = true;
                }
            }
            if !pushed {
                not_found.push(inv);
            }
            ctx.observer.inventory(&inv.hash);
        }
    }

    if !not_found.is_empty() {
        // SPV clients walking tx dependencies need to know what we lack
        peer.push_message(NetMessage::NotFound(not_found));
    }
    got_work_done
}
