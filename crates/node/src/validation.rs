use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bchd_consensus::hash256_to_hex;
use bchd_net::chain::STATUS_VALID_SCRIPTS;
use bchd_net::context::{MainState, NodeContext};
use bchd_net::external::{BlockValidator, ValidationFailure};
use bchd_net::message::reject_code;
use bchd_net::peer::PeerId;
use bchd_primitives::{Block, BlockHeader};

use crate::mempool::NodeMempool;
use crate::store::MemoryBlockStore;

const MAX_FUTURE_BLOCK_TIME_SECS: i64 = 2 * 60 * 60;

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}

/// The node's stand-in for a full consensus validator: structural header
/// checks, block storage and chain activation. Script and UTXO
/// validation belong to a real validator behind the same seam.
pub struct NodeValidator {
    ctx: OnceLock<Arc<NodeContext>>,
    store: Arc<MemoryBlockStore>,
    mempool: Arc<NodeMempool>,
}

impl NodeValidator {
    pub fn new(store: Arc<MemoryBlockStore>, mempool: Arc<NodeMempool>) -> Self {
        Self {
            ctx: OnceLock::new(),
            store,
            mempool,
        }
    }

    pub fn attach_context(&self, ctx: Arc<NodeContext>) {
        let _ = self.ctx.set(ctx);
    }
}

impl BlockValidator for NodeValidator {
    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ValidationFailure> {
        if header.bits == 0 {
            return Err(ValidationFailure::new(
                "bad-diffbits",
                reject_code::INVALID,
                50,
            ));
        }
        if header.time as i64 > unix_now_secs() + MAX_FUTURE_BLOCK_TIME_SECS {
            return Err(ValidationFailure::new(
                "time-too-new",
                reject_code::INVALID,
                0,
            ));
        }
        Ok(())
    }

    fn process_new_block(
        &self,
        block: Block,
        source_peer: PeerId,
        _force_processing: bool,
    ) -> Result<(), ValidationFailure> {
        self.check_block_header(&block.header)?;
        let hash = block.hash();
        let txids: Vec<_> = block.txs.iter().map(|tx| tx.txid()).collect();
        self.store.write_block(block);

        let Some(ctx) = self.ctx.get() else {
            return Ok(());
        };

        let new_tip = {
            let mut main = ctx.main();
            let Some(id) = main.block_index.lookup(&hash) else {
                return Err(ValidationFailure::new(
                    "header not indexed",
                    reject_code::INVALID,
                    0,
                ));
            };
            main.block_index
                .set_status(id, bchd_net::chain::STATUS_HAVE_DATA | STATUS_VALID_SCRIPTS);

            // activate when this block has the most work and its whole
            // ancestry is present
            let better = match main.active.tip() {
                Some(tip) => {
                    main.block_index.get(id).chain_work > main.block_index.get(tip).chain_work
                }
                None => true,
            };
            let mut connected = better;
            if better {
                let mut walk = Some(id);
                while let Some(step) = walk {
                    if main.active.contains(&main.block_index, step) {
                        break;
                    }
                    if !main.block_index.get(step).have_data() {
                        connected = false;
                        break;
                    }
                    walk = main.block_index.get(step).parent;
                }
            }
            if better && connected {
                let MainState {
                    active, block_index, ..
                } = &mut *main;
                active.set_tip(block_index, id);
                main.consider_best_header(id);
                Some(hash)
            } else {
                None
            }
        };

        if let Some(tip_hash) = new_tip {
            log_info!(
                "new tip {} from peer {source_peer}",
                hash256_to_hex(&tip_hash)
            );
            self.mempool.remove_confirmed(&txids);
            for peer in ctx.peers.snapshot() {
                if peer.id != source_peer {
                    peer.push_block_hash_to_announce(tip_hash);
                }
            }
        }
        Ok(())
    }
}
