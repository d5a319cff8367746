//! Reimport of magic-delimited block files written by other nodes.

use std::collections::HashMap;
use std::io::Read;

use bchd_consensus::{hash256_to_hex, Hash256};
use bchd_primitives::Block;
use log::{debug, info, warn};

use crate::context::NodeContext;
use crate::error::NetError;
use crate::header_ingest::accept_block_header;

/// Records claiming more than this are suspicious enough to log, but are
/// still read; miners on this network choose their own block sizes.
const GIGANTIC_BLOCK_BYTES: u32 = 256 * 1024 * 1024;

const MIN_BLOCK_BYTES: u32 = 80;

/// Scan a sequential block file: find the network magic, read a length
/// prefix and a serialized block, and feed each connectable block to the
/// acceptor. Blocks whose parent has not been seen yet are parked and
/// replayed once the parent arrives. Returns the number imported.
pub fn load_external_block_file<R: Read>(
    ctx: &NodeContext,
    reader: &mut R,
) -> Result<usize, NetError> {
    let mut data = Vec::new();
    if let Err(err) = reader.read_to_end(&mut data) {
        ctx.abort_node(&format!("System error: {err}"), "");
        return Err(err.into());
    }

    let magic = ctx.params.message_start;
    let mut parked: HashMap<Hash256, Vec<Block>> = HashMap::new();
    let mut loaded = 0usize;
    let mut pos = 0usize;

    while pos + 8 <= data.len() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if data[pos..pos + 4] != magic {
            pos += 1;
            continue;
        }
        let size = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        if size < MIN_BLOCK_BYTES {
            debug!("reindex error: short block: {size}");
            pos += 1;
            continue;
        }
        if size > GIGANTIC_BLOCK_BYTES {
            warn!("reindex warning: gigantic block: {size}");
        }
        let start = pos + 8;
        let end = start + size as usize;
        if end > data.len() {
            break; // truncated tail record
        }
        match Block::consensus_decode(&data[start..end]) {
            Ok(block) => {
                pos = end;
                let hash = block.hash();
                let parent = block.header.prev_block;
                let genesis = hash == ctx.params.consensus.hash_genesis_block;
                let parent_known = {
                    let main = ctx.main();
                    main.block_index.lookup(&parent).is_some()
                };
                if !genesis && !parent_known {
                    debug!(
                        "reindex: out of order block {}, parent {} not known",
                        hash256_to_hex(&hash),
                        hash256_to_hex(&parent)
                    );
                    parked.entry(parent).or_default().push(block);
                    continue;
                }
                if import_block(ctx, block) {
                    loaded += 1;
                }
                // replay any parked descendants, breadth-first
                let mut queue = vec![hash];
                while let Some(head) = queue.pop() {
                    if let Some(children) = parked.remove(&head) {
                        for child in children {
                            let child_hash = child.hash();
                            info!(
                                "reindex: processing out of order child {} of {}",
                                hash256_to_hex(&child_hash),
                                hash256_to_hex(&head)
                            );
                            if import_block(ctx, child) {
                                loaded += 1;
                                queue.push(child_hash);
                            }
                        }
                    }
                }
            }
            Err(err) => {
                debug!("reindex: deserialize error: {err}");
                pos += 1;
            }
        }
    }

    if loaded > 0 {
        info!("loaded {loaded} blocks from external file");
    }
    Ok(loaded)
}

fn import_block(ctx: &NodeContext, block: Block) -> bool {
    let hash = block.hash();
    {
        let mut main = ctx.main();
        if main.already_have_block(&hash) {
            return false;
        }
        if let Err(failure) = accept_block_header(ctx, &mut main, &block.header) {
            debug!(
                "reindex: header {} rejected: {}",
                hash256_to_hex(&hash),
                failure.reason
            );
            return false;
        }
        if let Some(id) = main.block_index.lookup(&hash) {
            main.block_index
                .set_status(id, crate::chain::STATUS_HAVE_DATA);
        }
    }
    ctx.validator.process_new_block(block, 0, true).is_ok()
}
