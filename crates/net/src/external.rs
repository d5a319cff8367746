//! Collaborator seams. The engine drives these; it implements none of them.

use std::net::IpAddr;
use std::sync::Arc;

use bchd_consensus::Hash256;
use bchd_primitives::{Block, BlockHeader, Transaction};

use crate::message::TimedNetAddress;
use crate::peer::{Peer, PeerId};

/// Why a validator refused a header or block, with the DoS score the
/// offering peer earns (zero for non-punishable failures).
#[derive(Clone, Debug)]
pub struct ValidationFailure {
    pub reason: String,
    pub reject_code: u8,
    pub dos_score: i32,
}

impl ValidationFailure {
    pub fn new(reason: impl Into<String>, reject_code: u8, dos_score: i32) -> Self {
        Self {
            reason: reason.into(),
            reject_code,
            dos_score,
        }
    }
}

/// Consensus-rule checks. Header context (parent lookup, index insertion)
/// stays with the engine; the validator judges the header/block itself.
pub trait BlockValidator: Send + Sync {
    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ValidationFailure>;

    /// Full block hand-off; admission to the chain happens on the
    /// validator's side of the seam.
    fn process_new_block(
        &self,
        block: Block,
        source_peer: PeerId,
        force_processing: bool,
    ) -> Result<(), ValidationFailure>;
}

#[derive(Clone, Copy, Debug)]
pub struct Coin {
    pub height: i32,
    pub spent: bool,
}

pub trait CoinView: Send + Sync {
    /// Slow-path lookup used by `GetTransaction`-style queries.
    fn lookup(&self, txid: &Hash256) -> Option<Coin>;
}

pub trait BlockStore: Send + Sync {
    fn read_block(&self, hash: &Hash256) -> Option<Block>;
}

/// A transaction arriving from the wire, stamped for the admission queue.
#[derive(Clone, Debug)]
pub struct TxInputData {
    pub tx: Transaction,
    pub peer_id: PeerId,
    pub peer_name: String,
    pub whitelisted: bool,
}

pub trait Mempool: Send + Sync {
    fn get(&self, txid: &Hash256) -> Option<Arc<Transaction>>;
    fn contains(&self, txid: &Hash256) -> bool;
    fn query_hashes(&self) -> Vec<Hash256>;
    /// Hand the transaction to the admission pipeline. Validation never
    /// runs on the message pump.
    fn enqueue_tx_for_admission(&self, tx: TxInputData);
}

pub trait AddrManager: Send + Sync {
    fn add(&self, addrs: Vec<TimedNetAddress>, source: IpAddr, penalty_secs: i64);
    fn good(&self, addr: IpAddr);
    fn get_addrs(&self) -> Vec<TimedNetAddress>;
    fn size(&self) -> usize;
    /// Feed the connection-slot admission policy (VERACK timeouts).
    fn record_eviction(&self, addr: IpAddr);
}

pub trait BanManager: Send + Sync {
    /// Charge misbehavior; implementations flag `peer.disconnect` when the
    /// score crosses their threshold.
    fn misbehaving(&self, peer: &Peer, score: i32);
    fn ban(&self, addr: IpAddr, reason: &str, seconds: i64);
    fn is_banned(&self, addr: IpAddr) -> bool;
}

pub trait UiInterface: Send + Sync {
    fn thread_safe_message_box(&self, message: &str);
    fn notify_alert_changed(&self);
    fn start_shutdown(&self);
    /// Run the `-alertnotify` shell template with `%s` substituted.
    fn run_alert_command(&self, command: &str);
}

/// Explicit replacement for the validator's signal bus: the engine calls
/// these methods instead of firing slots.
pub trait ValidationObserver: Send + Sync {
    /// An inventory item was seen or served.
    fn inventory(&self, hash: &Hash256);
    /// Periodic chance to rebroadcast wallet transactions.
    fn broadcast(&self, time_best_received: i64);
}

/// No-op observer for deployments without a wallet.
pub struct NullObserver;

impl ValidationObserver for NullObserver {
    fn inventory(&self, _hash: &Hash256) {}
    fn broadcast(&self, _time_best_received: i64) {}
}
