//! Shared engine state and configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bchd_consensus::params::{chain_params, ChainParams, Network};
use bchd_consensus::protocol::{
    DEFAULT_BLOCK_DOWNLOAD_WINDOW, DEFAULT_MAX_BLOCKS_IN_TRANSIT, NODE_BLOOM, NODE_NETWORK,
    NODE_XTHIN, SMALLEST_MAX_BLOOM_FILTER_SIZE,
};
use bchd_consensus::Hash256;
use bchd_primitives::BlockHeader;
use log::error;

use crate::chain::{ActiveChain, BlockId, BlockIndex, STATUS_HAVE_DATA};
use crate::external::{
    AddrManager, BanManager, BlockStore, BlockValidator, CoinView, Mempool, UiInterface,
    ValidationObserver,
};
use crate::peer::{Peer, PeerId, PeerRegistry};
use crate::peer_state::PeerChainState;
use crate::relay::RelayPool;
use crate::request_manager::RequestManager;

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_usec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_micros() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub services: u64,
    pub user_agent: String,
    pub listen_port: u16,
    /// 0 means the protocol default.
    pub max_blocks_in_transit_per_peer: usize,
    pub block_download_window: usize,
    pub xthin_bloom_filter_size: u32,
    pub blocks_only: bool,
    pub whitelist_relay: bool,
    pub limit_free_relay: i64,
    /// Drop one in N received messages (test hook); 0 disables.
    pub drop_messages_test: u32,
    pub test_safe_mode: bool,
    pub alert_notify: Option<String>,
    pub thin_blocks_enabled: bool,
    pub graphene_enabled: bool,
    pub expedited_blocks: bool,
    pub send_buffer_limit: usize,
    /// Outbound bandwidth target in bytes; 0 means unlimited.
    pub max_outbound_bytes: u64,
}

impl Config {
    pub fn default_for(network: Network) -> Self {
        Self {
            network,
            services: NODE_NETWORK | NODE_BLOOM | NODE_XTHIN,
            user_agent: "/bchd-rust:0.1.0/".to_string(),
            listen_port: chain_params(network).default_port,
            max_blocks_in_transit_per_peer: 0,
            block_download_window: DEFAULT_BLOCK_DOWNLOAD_WINDOW,
            xthin_bloom_filter_size: SMALLEST_MAX_BLOOM_FILTER_SIZE,
            blocks_only: false,
            whitelist_relay: true,
            limit_free_relay: 15,
            drop_messages_test: 0,
            test_safe_mode: false,
            alert_notify: None,
            thin_blocks_enabled: true,
            graphene_enabled: true,
            expedited_blocks: false,
            send_buffer_limit: 10 * 1000 * 1000,
            max_outbound_bytes: 0,
        }
    }

    pub fn max_blocks_in_transit(&self) -> usize {
        if self.max_blocks_in_transit_per_peer == 0 {
            DEFAULT_MAX_BLOCKS_IN_TRANSIT
        } else {
            self.max_blocks_in_transit_per_peer
        }
    }

    pub fn free_txns_disallowed(&self) -> bool {
        self.limit_free_relay == 0
    }
}

/// Everything guarded by the engine's main lock: the block index, the
/// active chain, per-peer chain state, and the unconnected-header cache.
pub struct MainState {
    pub block_index: BlockIndex,
    pub active: ActiveChain,
    pub best_header: Option<BlockId>,
    pub peer_states: HashMap<PeerId, PeerChainState>,
    pub preferred_download_count: i32,
    pub sync_started_count: usize,
    pub sync_started_pruned: usize,
    pub unconnected_headers: HashMap<Hash256, (BlockHeader, i64)>,
}

impl MainState {
    pub fn new() -> Self {
        Self {
            block_index: BlockIndex::new(),
            active: ActiveChain::new(),
            best_header: None,
            peer_states: HashMap::new(),
            preferred_download_count: 0,
            sync_started_count: 0,
            sync_started_pruned: 0,
            unconnected_headers: HashMap::new(),
        }
    }

    pub fn best_header_id(&self) -> Option<BlockId> {
        self.best_header.or_else(|| self.active.tip())
    }

    /// Track the most-work valid header.
    pub fn consider_best_header(&mut self, id: BlockId) {
        let work = self.block_index.get(id).chain_work;
        match self.best_header {
            Some(best) if self.block_index.get(best).chain_work >= work => {}
            _ => self.best_header = Some(id),
        }
    }

    /// True only when the block's data is on disk, not merely its header.
    pub fn already_have_block(&self, hash: &Hash256) -> bool {
        match self.block_index.lookup(hash) {
            Some(id) => self.block_index.get(id).status & STATUS_HAVE_DATA != 0,
            None => false,
        }
    }
}

impl Default for MainState {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate byte accounting plus the outbound bandwidth target used by
/// the historical-block serving limit.
#[derive(Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    target: AtomicU64,
}

impl NetTotals {
    pub fn new(target: u64) -> Self {
        Self {
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            target: AtomicU64::new(target),
        }
    }

    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn outbound_target_reached(&self) -> bool {
        let target = self.target.load(Ordering::Relaxed);
        target != 0 && self.bytes_sent.load(Ordering::Relaxed) >= target
    }
}

/// Cooperative cancellation checked between messages, inside long inv
/// loops and during reindex scanning.
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub struct NodeContext {
    pub params: ChainParams,
    pub config: Config,
    pub main: Mutex<MainState>,
    pub peers: PeerRegistry,
    pub requester: RequestManager,
    pub relay_pool: Mutex<RelayPool>,
    pub net_totals: NetTotals,

    pub validator: Arc<dyn BlockValidator>,
    pub coins: Arc<dyn CoinView>,
    pub block_store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn Mempool>,
    pub addrman: Arc<dyn AddrManager>,
    pub dosman: Arc<dyn BanManager>,
    pub ui: Arc<dyn UiInterface>,
    pub observer: Arc<dyn ValidationObserver>,

    pub importing: AtomicBool,
    pub reindex: AtomicBool,
    pub listening: AtomicBool,
    pub local_nonce: u64,
    pub local_address: Mutex<Option<SocketAddr>>,
    pub time_best_received: AtomicI64,
    pub last_partition_alert: AtomicI64,
    pub misc_warning: Mutex<String>,
    pub cancel: CancelFlag,
}

pub struct Collaborators {
    pub validator: Arc<dyn BlockValidator>,
    pub coins: Arc<dyn CoinView>,
    pub block_store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn Mempool>,
    pub addrman: Arc<dyn AddrManager>,
    pub dosman: Arc<dyn BanManager>,
    pub ui: Arc<dyn UiInterface>,
    pub observer: Arc<dyn ValidationObserver>,
}

impl NodeContext {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let params = chain_params(config.network);
        let max_outbound = config.max_outbound_bytes;
        Self {
            params,
            config,
            main: Mutex::new(MainState::new()),
            peers: PeerRegistry::new(),
            requester: RequestManager::new(),
            relay_pool: Mutex::new(RelayPool::new()),
            net_totals: NetTotals::new(max_outbound),
            validator: collaborators.validator,
            coins: collaborators.coins,
            block_store: collaborators.block_store,
            mempool: collaborators.mempool,
            addrman: collaborators.addrman,
            dosman: collaborators.dosman,
            ui: collaborators.ui,
            observer: collaborators.observer,
            importing: AtomicBool::new(false),
            reindex: AtomicBool::new(false),
            listening: AtomicBool::new(true),
            local_nonce: rand::random::<u64>() | 1,
            local_address: Mutex::new(None),
            time_best_received: AtomicI64::new(0),
            last_partition_alert: AtomicI64::new(0),
            misc_warning: Mutex::new(String::new()),
            cancel: CancelFlag::new(),
        }
    }

    /// Status-bar warning text for RPC/UI consumers.
    pub fn get_warnings(&self) -> String {
        if self.config.test_safe_mode {
            return "testsafemode enabled".to_string();
        }
        self.misc_warning
            .lock()
            .map(|warning| warning.clone())
            .unwrap_or_default()
    }

    pub fn main(&self) -> std::sync::MutexGuard<'_, MainState> {
        self.main.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_importing(&self) -> bool {
        self.importing.load(Ordering::Relaxed) || self.reindex.load(Ordering::Relaxed)
    }

    /// IBD: no best header yet, or the best header is older than a day.
    pub fn is_initial_block_download(&self, main: &MainState) -> bool {
        if self.is_importing() {
            return true;
        }
        match main.best_header_id() {
            Some(best) => main.block_index.get(best).time() < now_secs() - 24 * 60 * 60,
            None => true,
        }
    }

    /// Near enough to the tip to fetch announced blocks directly.
    pub fn can_direct_fetch(&self, main: &MainState) -> bool {
        match main.active.tip() {
            Some(tip) => {
                main.block_index.get(tip).time()
                    > now_secs() - self.params.consensus.pow_target_spacing * 20
            }
            None => false,
        }
    }

    pub fn misbehaving(&self, peer: &Peer, score: i32) {
        self.dosman.misbehaving(peer, score);
    }

    /// Fatal local failure: surface to the UI and request shutdown.
    pub fn abort_node(&self, message: &str, user_message: &str) {
        if let Ok(mut warning) = self.misc_warning.lock() {
            *warning = message.to_string();
        }
        error!("*** {message}");
        let shown = if user_message.is_empty() {
            "Error: A fatal internal error occurred, see the log for details"
        } else {
            user_message
        };
        self.ui.thread_safe_message_box(shown);
        self.ui.start_shutdown();
        self.cancel.cancel();
    }
}
