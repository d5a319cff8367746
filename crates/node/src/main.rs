//! bchd-node: wires the peer-message engine to sockets, config and the
//! reference collaborator implementations.

macro_rules! log_info {
    ($($arg:tt)*) => { log::info!($($arg)*) };
}
macro_rules! log_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

mod addr_book;
mod mempool;
mod peer_book;
mod store;
mod validation;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use bchd_consensus::params::Network;
use bchd_consensus::protocol::SMALLEST_MAX_BLOOM_FILTER_SIZE;
use bchd_consensus::{hash256_from_hex, Hash256};
use bchd_net::context::{Collaborators, Config, MainState, NodeContext};
use bchd_net::dispatcher;
use bchd_net::external::{Coin, CoinView, UiInterface};
use bchd_net::peer::Peer;
use bchd_net::send_pump;
use bchd_primitives::BlockHeader;
use tokio::net::{TcpListener, TcpStream};

use crate::addr_book::AddrBook;
use crate::mempool::NodeMempool;
use crate::peer_book::BanBook;
use crate::store::MemoryBlockStore;
use crate::validation::NodeValidator;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_MAX_OUTBOUND: usize = 8;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const OUTBOUND_REFILL_SECS: u64 = 10;
const PARTITION_CHECK_SECS: u64 = 10 * 60;
const ADMISSION_DRAIN_MILLIS: u64 = 100;
const RELAY_EXPIRE_SECS: u64 = 60;
const PEERS_PERSIST_INTERVAL_SECS: u64 = 60;
const PEERS_FILE_NAME: &str = "peers.dat";
const BANLIST_FILE_NAME: &str = "banlist.dat";

struct NodeOptions {
    config: Config,
    datadir: PathBuf,
    listen_addr: Option<SocketAddr>,
    connect_only: Vec<SocketAddr>,
    add_nodes: Vec<SocketAddr>,
    whitelist: Vec<IpAddr>,
    load_blocks: Vec<PathBuf>,
    max_outbound: usize,
    debug: bool,
}

struct NullCoinView;

impl CoinView for NullCoinView {
    fn lookup(&self, _txid: &Hash256) -> Option<Coin> {
        None
    }
}

struct NodeUi;

impl UiInterface for NodeUi {
    fn thread_safe_message_box(&self, message: &str) {
        eprintln!("{message}");
    }

    fn notify_alert_changed(&self) {}

    fn start_shutdown(&self) {
        log_warn!("shutdown requested");
    }

    fn run_alert_command(&self, command: &str) {
        let command = command.to_string();
        std::thread::spawn(move || {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status();
            if let Err(err) = status {
                log_warn!("alertnotify command failed: {err}");
            }
        });
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let options = parse_args()?;
    init_logger(options.debug);

    std::fs::create_dir_all(&options.datadir)
        .map_err(|err| format!("failed to create {}: {err}", options.datadir.display()))?;

    let store = Arc::new(MemoryBlockStore::new());
    let node_mempool = Arc::new(NodeMempool::new());
    let validator = Arc::new(NodeValidator::new(
        Arc::clone(&store),
        Arc::clone(&node_mempool),
    ));
    let addrman = Arc::new(AddrBook::new());
    let dosman = Arc::new(BanBook::new());

    let ctx = Arc::new(NodeContext::new(
        options.config.clone(),
        Collaborators {
            validator: Arc::clone(&validator) as _,
            coins: Arc::new(NullCoinView),
            block_store: Arc::clone(&store) as _,
            mempool: Arc::clone(&node_mempool) as _,
            addrman: Arc::clone(&addrman) as _,
            dosman: Arc::clone(&dosman) as _,
            ui: Arc::new(NodeUi),
            observer: Arc::new(bchd_net::external::NullObserver),
        },
    ));
    validator.attach_context(Arc::clone(&ctx));
    node_mempool.attach_context(Arc::clone(&ctx));

    seed_genesis(&ctx)?;

    // import externally produced block files before going online
    if !options.load_blocks.is_empty() {
        ctx.importing.store(true, AtomicOrdering::Relaxed);
        for path in &options.load_blocks {
            match std::fs::File::open(path) {
                Ok(mut file) => {
                    match bchd_net::reindex::load_external_block_file(&ctx, &mut file) {
                        Ok(loaded) => {
                            log_info!("imported {loaded} blocks from {}", path.display())
                        }
                        Err(err) => log_warn!("import of {} failed: {err}", path.display()),
                    }
                }
                Err(err) => log_warn!("cannot open {}: {err}", path.display()),
            }
        }
        ctx.importing.store(false, AtomicOrdering::Relaxed);
    }

    let peers_path = options.datadir.join(PEERS_FILE_NAME);
    match addrman.load_file(&peers_path) {
        Ok(count) if count > 0 => log_info!("loaded {count} addresses from peers file"),
        Ok(_) => {}
        Err(err) => log_warn!("{err}"),
    }
    load_banlist(&dosman, &options.datadir.join(BANLIST_FILE_NAME));

    if let Some(listen_addr) = options.listen_addr {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|err| format!("failed to bind p2p listener {listen_addr}: {err}"))?;
        let local = listener
            .local_addr()
            .map_err(|err| format!("listener address: {err}"))?;
        log_info!("P2P listening on {local}");
        *ctx.local_address.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        tokio::spawn(accept_loop(Arc::clone(&ctx), listener));
    } else {
        ctx.listening.store(false, AtomicOrdering::Relaxed);
    }

    tokio::spawn(outbound_loop(
        Arc::clone(&ctx),
        Arc::clone(&addrman),
        options.connect_only.clone(),
        options.add_nodes.clone(),
        options.whitelist.clone(),
        options.max_outbound,
    ));
    tokio::spawn(admission_loop(
        Arc::clone(&ctx),
        Arc::clone(&node_mempool),
    ));
    tokio::spawn(partition_loop(Arc::clone(&ctx)));
    tokio::spawn(relay_expire_loop(Arc::clone(&ctx)));
    tokio::spawn(persist_loop(
        Arc::clone(&addrman),
        Arc::clone(&dosman),
        options.datadir.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("signal handler: {err}"))?;
    log_info!("shutting down");
    ctx.cancel.cancel();

    if let Err(err) = addrman.save_file(&peers_path) {
        log_warn!("{err}");
    }
    save_banlist(&dosman, &options.datadir.join(BANLIST_FILE_NAME));
    Ok(())
}

fn init_logger(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();
}

/// Every network needs its genesis header in the index before sync can
/// anchor anything.
fn seed_genesis(ctx: &NodeContext) -> Result<(), String> {
    let merkle_root =
        hash256_from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
            .ok_or_else(|| "bad genesis merkle constant".to_string())?;
    let header = match ctx.params.network {
        Network::Main => BlockHeader {
            version: 1,
            prev_block: [0; 32],
            merkle_root,
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        },
        Network::Testnet => BlockHeader {
            version: 1,
            prev_block: [0; 32],
            merkle_root,
            time: 1_296_688_602,
            bits: 0x1d00ffff,
            nonce: 414_098_458,
        },
        Network::Regtest => BlockHeader {
            version: 1,
            prev_block: [0; 32],
            merkle_root,
            time: 1_296_688_602,
            bits: 0x207fffff,
            nonce: 2,
        },
    };
    if header.hash() != ctx.params.consensus.hash_genesis_block {
        return Err("genesis header does not match chain params".to_string());
    }
    let mut main = ctx.main();
    let id = main
        .block_index
        .insert_header(header)
        .ok_or_else(|| "failed to index genesis header".to_string())?;
    main.block_index.set_status(
        id,
        bchd_net::chain::STATUS_VALID_TREE
            | bchd_net::chain::STATUS_VALID_SCRIPTS
            | bchd_net::chain::STATUS_HAVE_DATA,
    );
    let MainState {
        active, block_index, ..
    } = &mut *main;
    active.set_tip(block_index, id);
    main.best_header = Some(id);
    Ok(())
}

async fn accept_loop(ctx: Arc<NodeContext>, listener: TcpListener) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("p2p accept failed: {err}");
                continue;
            }
        };
        if ctx.cancel.is_cancelled() {
            return;
        }
        if ctx.dosman.is_banned(remote_addr.ip()) {
            log_debug!("rejecting connection from banned {remote_addr}");
            continue;
        }
        spawn_peer(Arc::clone(&ctx), stream, remote_addr, true, false);
    }
}

fn spawn_peer(
    ctx: Arc<NodeContext>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    inbound: bool,
    whitelisted: bool,
) {
    let id = ctx.peers.next_id();
    let (peer, outbound_rx) = Peer::new(
        id,
        remote_addr,
        inbound,
        whitelisted,
        bchd_net::context::now_secs(),
    );
    dispatcher::initialize_peer(&ctx, &peer);

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(dispatcher::run_writer(
        Arc::clone(&ctx),
        Arc::clone(&peer),
        write_half,
        outbound_rx,
    ));
    tokio::spawn(send_pump::run_send_pump(
        Arc::clone(&ctx),
        Arc::clone(&peer),
    ));
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(read_half);
        if let Err(err) = dispatcher::run_receive_pump(&ctx, &peer, &mut reader).await {
            log_debug!("peer {remote_addr} closed: {err}");
        }
        peer.set_disconnect();
        dispatcher::finalize_peer(&ctx, &peer);
    });
}

async fn outbound_loop(
    ctx: Arc<NodeContext>,
    addrman: Arc<AddrBook>,
    connect_only: Vec<SocketAddr>,
    add_nodes: Vec<SocketAddr>,
    whitelist: Vec<IpAddr>,
    max_outbound: usize,
) {
    let mut seeded = false;
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let outbound_now = ctx
            .peers
            .snapshot()
            .into_iter()
            .filter(|peer| !peer.inbound)
            .count();
        if outbound_now < max_outbound {
            let mut candidates: Vec<SocketAddr> = if !connect_only.is_empty() {
                connect_only.clone()
            } else {
                let mut candidates = add_nodes.clone();
                candidates.extend(addrman.sample(max_outbound * 2));
                if candidates.is_empty() && !seeded {
                    seeded = true;
                    candidates = resolve_seed_addresses(&ctx).await;
                }
                candidates
            };
            let connected: Vec<SocketAddr> = ctx
                .peers
                .snapshot()
                .iter()
                .map(|peer| peer.addr)
                .collect();
            candidates.retain(|addr| {
                !connected.contains(addr) && !ctx.dosman.is_banned(addr.ip())
            });
            candidates.truncate(max_outbound - outbound_now);
            for addr in candidates {
                addrman.record_attempt(addr);
                let connect = tokio::time::timeout(
                    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
                    TcpStream::connect(addr),
                )
                .await;
                match connect {
                    Ok(Ok(stream)) => {
                        log_info!("connected to {addr}");
                        let whitelisted = whitelist.contains(&addr.ip());
                        spawn_peer(Arc::clone(&ctx), stream, addr, false, whitelisted);
                    }
                    Ok(Err(err)) => {
                        log_debug!("connect to {addr} failed: {err}");
                        addrman.record_failure(addr);
                    }
                    Err(_) => {
                        log_debug!("connect to {addr} timed out");
                        addrman.record_failure(addr);
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(OUTBOUND_REFILL_SECS)).await;
    }
}

async fn resolve_seed_addresses(ctx: &NodeContext) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    let port = ctx.params.default_port;
    for seed in ctx.params.dns_seeds {
        match tokio::net::lookup_host((*seed, port)).await {
            Ok(resolved) => addrs.extend(resolved),
            Err(err) => log_debug!("dns seed {seed} failed: {err}"),
        }
    }
    log_info!("resolved {} addresses from dns seeds", addrs.len());
    addrs
}

async fn admission_loop(ctx: Arc<NodeContext>, mempool: Arc<NodeMempool>) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        mempool.drain_admission_queue();
        tokio::time::sleep(Duration::from_millis(ADMISSION_DRAIN_MILLIS)).await;
    }
}

async fn partition_loop(ctx: Arc<NodeContext>) {
    loop {
        tokio::time::sleep(Duration::from_secs(PARTITION_CHECK_SECS)).await;
        if ctx.cancel.is_cancelled() {
            return;
        }
        bchd_net::partition::partition_check(&ctx);
    }
}

async fn relay_expire_loop(ctx: Arc<NodeContext>) {
    loop {
        tokio::time::sleep(Duration::from_secs(RELAY_EXPIRE_SECS)).await;
        if ctx.cancel.is_cancelled() {
            return;
        }
        let mut pool = ctx
            .relay_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pool.expire(bchd_net::context::now_secs());
    }
}

async fn persist_loop(addrman: Arc<AddrBook>, dosman: Arc<BanBook>, datadir: PathBuf) {
    loop {
        tokio::time::sleep(Duration::from_secs(PEERS_PERSIST_INTERVAL_SECS)).await;
        if let Err(err) = addrman.save_file(&datadir.join(PEERS_FILE_NAME)) {
            log_warn!("{err}");
        }
        save_banlist(&dosman, &datadir.join(BANLIST_FILE_NAME));
    }
}

fn load_banlist(dosman: &BanBook, path: &Path) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    match serde_json::from_slice::<Vec<(IpAddr, peer_book::BanEntry)>>(&bytes) {
        Ok(entries) => dosman.load_entries(entries),
        Err(err) => log_warn!("failed to parse {}: {err}", path.display()),
    }
}

fn save_banlist(dosman: &BanBook, path: &Path) {
    let entries = dosman.banned_peers();
    match serde_json::to_vec(&entries) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(path, bytes) {
                log_warn!("failed to write {}: {err}", path.display());
            }
        }
        Err(err) => log_warn!("failed to encode banlist: {err}"),
    }
}

fn parse_args() -> Result<NodeOptions, String> {
    let mut network = Network::Main;
    let mut config_overrides: HashMap<String, String> = HashMap::new();
    let mut datadir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut listen = true;
    let mut listen_addr: Option<SocketAddr> = None;
    let mut connect_only = Vec::new();
    let mut add_nodes = Vec::new();
    let mut whitelist = Vec::new();
    let mut load_blocks = Vec::new();
    let mut max_outbound = DEFAULT_MAX_OUTBOUND;
    let mut debug = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (name, inline_value) = match arg.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value_for = |flag: &str| -> Result<String, String> {
            match &inline_value {
                Some(value) => Ok(value.clone()),
                None => args.next().ok_or_else(|| format!("{flag} requires a value")),
            }
        };
        match name.as_str() {
            "-testnet" => network = Network::Testnet,
            "-regtest" => network = Network::Regtest,
            "-datadir" => datadir = PathBuf::from(value_for("-datadir")?),
            "-listen" => listen = value_for("-listen")? != "0",
            "-port" => {
                config_overrides.insert("port".to_string(), value_for("-port")?);
            }
            "-connect" => {
                connect_only.push(parse_addr_arg(&value_for("-connect")?, network)?);
            }
            "-addnode" => {
                add_nodes.push(parse_addr_arg(&value_for("-addnode")?, network)?);
            }
            "-whitelist" => {
                let value = value_for("-whitelist")?;
                whitelist.push(
                    value
                        .parse::<IpAddr>()
                        .map_err(|err| format!("bad -whitelist value {value}: {err}"))?,
                );
            }
            "-loadblock" => {
                load_blocks.push(PathBuf::from(value_for("-loadblock")?));
            }
            "-maxoutbound" => {
                max_outbound = value_for("-maxoutbound")?
                    .parse()
                    .map_err(|err| format!("bad -maxoutbound: {err}"))?;
            }
            "-maxblocksintransit" => {
                config_overrides.insert(
                    "maxblocksintransit".to_string(),
                    value_for("-maxblocksintransit")?,
                );
            }
            "-blockdownloadwindow" => {
                config_overrides.insert(
                    "blockdownloadwindow".to_string(),
                    value_for("-blockdownloadwindow")?,
                );
            }
            "-xthinbloomfiltersize" => {
                config_overrides.insert(
                    "xthinbloomfiltersize".to_string(),
                    value_for("-xthinbloomfiltersize")?,
                );
            }
            "-blocksonly" => {
                config_overrides.insert("blocksonly".to_string(), "1".to_string());
            }
            "-whitelistrelay" => {
                config_overrides
                    .insert("whitelistrelay".to_string(), value_for("-whitelistrelay")?);
            }
            "-limitfreerelay" => {
                config_overrides
                    .insert("limitfreerelay".to_string(), value_for("-limitfreerelay")?);
            }
            "-dropmessagestest" => {
                config_overrides.insert(
                    "dropmessagestest".to_string(),
                    value_for("-dropmessagestest")?,
                );
            }
            "-testsafemode" => {
                config_overrides.insert("testsafemode".to_string(), "1".to_string());
            }
            "-alertnotify" => {
                config_overrides.insert("alertnotify".to_string(), value_for("-alertnotify")?);
            }
            "-use-thinblocks" => {
                config_overrides.insert("thinblocks".to_string(), value_for("-use-thinblocks")?);
            }
            "-use-grapheneblocks" => {
                config_overrides.insert(
                    "grapheneblocks".to_string(),
                    value_for("-use-grapheneblocks")?,
                );
            }
            "-expeditedblock" => {
                config_overrides.insert("expedited".to_string(), "1".to_string());
            }
            "-maxuploadtarget" => {
                config_overrides
                    .insert("maxuploadtarget".to_string(), value_for("-maxuploadtarget")?);
            }
            "-debug" => debug = true,
            "-help" | "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other}\n{}", usage())),
        }
    }

    let mut config = Config::default_for(network);
    if let Some(port) = config_overrides.get("port") {
        config.listen_port = port.parse().map_err(|err| format!("bad -port: {err}"))?;
    }
    if let Some(value) = config_overrides.get("maxblocksintransit") {
        config.max_blocks_in_transit_per_peer = value
            .parse()
            .map_err(|err| format!("bad -maxblocksintransit: {err}"))?;
    }
    if let Some(value) = config_overrides.get("blockdownloadwindow") {
        config.block_download_window = value
            .parse()
            .map_err(|err| format!("bad -blockdownloadwindow: {err}"))?;
    }
    if let Some(value) = config_overrides.get("xthinbloomfiltersize") {
        let size: u32 = value
            .parse()
            .map_err(|err| format!("bad -xthinbloomfiltersize: {err}"))?;
        if size < SMALLEST_MAX_BLOOM_FILTER_SIZE {
            return Err(format!(
                "-xthinbloomfiltersize must be at least {SMALLEST_MAX_BLOOM_FILTER_SIZE}"
            ));
        }
        config.xthin_bloom_filter_size = size;
    }
    if config_overrides.contains_key("blocksonly") {
        config.blocks_only = true;
    }
    if let Some(value) = config_overrides.get("whitelistrelay") {
        config.whitelist_relay = value != "0";
    }
    if let Some(value) = config_overrides.get("limitfreerelay") {
        config.limit_free_relay = value
            .parse()
            .map_err(|err| format!("bad -limitfreerelay: {err}"))?;
    }
    if let Some(value) = config_overrides.get("dropmessagestest") {
        config.drop_messages_test = value
            .parse()
            .map_err(|err| format!("bad -dropmessagestest: {err}"))?;
    }
    if config_overrides.contains_key("testsafemode") {
        config.test_safe_mode = true;
    }
    if let Some(value) = config_overrides.get("alertnotify") {
        config.alert_notify = Some(value.clone());
    }
    if let Some(value) = config_overrides.get("thinblocks") {
        config.thin_blocks_enabled = value != "0";
    }
    if let Some(value) = config_overrides.get("grapheneblocks") {
        config.graphene_enabled = value != "0";
    }
    if config_overrides.contains_key("expedited") {
        config.expedited_blocks = true;
    }
    if let Some(value) = config_overrides.get("maxuploadtarget") {
        let mib: u64 = value
            .parse()
            .map_err(|err| format!("bad -maxuploadtarget: {err}"))?;
        config.max_outbound_bytes = mib * 1024 * 1024;
    }

    if listen {
        listen_addr = Some(SocketAddr::new(
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            config.listen_port,
        ));
    }

    Ok(NodeOptions {
        config,
        datadir,
        listen_addr,
        connect_only,
        add_nodes,
        whitelist,
        load_blocks,
        max_outbound,
        debug,
    })
}

fn parse_addr_arg(value: &str, network: Network) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse() {
        return Ok(addr);
    }
    let default_port = bchd_consensus::params::chain_params(network).default_port;
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(format!("bad peer address {value}"))
}

fn usage() -> String {
    [
        "bchd-node [options]",
        "",
        "  -testnet | -regtest        select network (default: main)",
        "  -datadir <dir>             data directory (default: data)",
        "  -listen <0|1>              accept inbound connections (default: 1)",
        "  -port <port>               listen port",
        "  -connect <addr>            connect only to these peers",
        "  -addnode <addr>            also connect to this peer",
        "  -whitelist <ip>            whitelist this address",
        "  -loadblock <file>          import a block file on startup",
        "  -maxoutbound <n>           outbound connection target (default: 8)",
        "  -maxblocksintransit <n>    per-peer block download cap",
        "  -blockdownloadwindow <n>   download look-ahead window",
        "  -xthinbloomfiltersize <n>  xthin bloom filter ceiling in bytes",
        "  -blocksonly                do not relay loose transactions",
        "  -whitelistrelay <0|1>      relay from whitelisted peers in blocksonly",
        "  -limitfreerelay <n>        free transaction allowance (0 disables)",
        "  -dropmessagestest <n>      drop 1/n received messages (testing)",
        "  -testsafemode              enable safe mode for testing",
        "  -alertnotify <cmd>         shell command run on alerts (%s = message)",
        "  -use-thinblocks <0|1>      enable thin block relay (default: 1)",
        "  -use-grapheneblocks <0|1>  enable graphene relay (default: 1)",
        "  -expeditedblock            request expedited blocks from peers",
        "  -maxuploadtarget <MiB>     outbound bandwidth target (0: unlimited)",
        "  -debug                     verbose logging",
    ]
    .join("\n")
}
