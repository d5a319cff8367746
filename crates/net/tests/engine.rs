//! End-to-end engine scenarios driven through the dispatcher with mock
//! collaborators.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use bchd_consensus::params::Network;
use bchd_consensus::protocol::{
    NODE_BLOOM, NODE_NETWORK, NODE_XTHIN, PROTOCOL_VERSION, SMALLEST_MAX_BLOOM_FILTER_SIZE,
    UNCONNECTED_HEADERS_TIMEOUT,
};
use bchd_consensus::{Hash256, ZERO_HASH};
use bchd_net::block_service::serving_policy_allows;
use bchd_net::chain::{STATUS_EXCESSIVE, STATUS_HAVE_DATA, STATUS_VALID_SCRIPTS, STATUS_VALID_TREE};
use bchd_net::context::{now_secs, Collaborators, Config, MainState, NodeContext};
use bchd_net::dispatcher::{self, process_message};
use bchd_net::external::{
    AddrManager, BanManager, BlockStore, BlockValidator, Coin, CoinView, Mempool, NullObserver,
    TxInputData, UiInterface, ValidationFailure,
};
use bchd_net::header_ingest::handle_headers;
use bchd_net::inv::{Inv, MSG_BLOCK, MSG_THINBLOCK, MSG_TX};
use bchd_net::message::{NetAddress, NetMessage, TimedNetAddress, VersionPayload};
use bchd_net::peer::{OutboundMessage, Peer, PeerId};
use bchd_primitives::{Block, BlockHeader, Transaction};
use tokio::sync::mpsc::UnboundedReceiver;

// ---- mock collaborators -------------------------------------------------

#[derive(Default)]
struct MockValidator {
    processed: Mutex<Vec<Hash256>>,
}

impl BlockValidator for MockValidator {
    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ValidationFailure> {
        if header.bits == 0 {
            return Err(ValidationFailure::new("bad-diffbits", 0x10, 50));
        }
        Ok(())
    }

    fn process_new_block(
        &self,
        block: Block,
        _source_peer: PeerId,
        _force: bool,
    ) -> Result<(), ValidationFailure> {
        self.processed.lock().unwrap().push(block.hash());
        Ok(())
    }
}

struct MockCoins;

impl CoinView for MockCoins {
    fn lookup(&self, _txid: &Hash256) -> Option<Coin> {
        None
    }
}

#[derive(Default)]
struct MockStore {
    blocks: Mutex<std::collections::HashMap<Hash256, Block>>,
}

impl MockStore {
    fn insert(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.hash(), block);
    }
}

impl BlockStore for MockStore {
    fn read_block(&self, hash: &Hash256) -> Option<Block> {
        self.blocks.lock().unwrap().get(hash).cloned()
    }
}

#[derive(Default)]
struct MockMempool {
    txs: Mutex<std::collections::HashMap<Hash256, Arc<Transaction>>>,
    enqueued: Mutex<Vec<Hash256>>,
}

impl Mempool for MockMempool {
    fn get(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.txs.lock().unwrap().get(txid).cloned()
    }

    fn contains(&self, txid: &Hash256) -> bool {
        self.txs.lock().unwrap().contains_key(txid)
    }

    fn query_hashes(&self) -> Vec<Hash256> {
        self.txs.lock().unwrap().keys().copied().collect()
    }

    fn enqueue_tx_for_admission(&self, tx: TxInputData) {
        self.enqueued.lock().unwrap().push(tx.tx.txid());
    }
}

#[derive(Default)]
struct MockAddrman {
    added: Mutex<Vec<TimedNetAddress>>,
    evictions: Mutex<Vec<IpAddr>>,
}

impl AddrManager for MockAddrman {
    fn add(&self, addrs: Vec<TimedNetAddress>, _source: IpAddr, _penalty_secs: i64) {
        self.added.lock().unwrap().extend(addrs);
    }

    fn good(&self, _addr: IpAddr) {}

    fn get_addrs(&self) -> Vec<TimedNetAddress> {
        Vec::new()
    }

    fn size(&self) -> usize {
        0
    }

    fn record_eviction(&self, addr: IpAddr) {
        self.evictions.lock().unwrap().push(addr);
    }
}

#[derive(Default)]
struct MockBan {
    bans: Mutex<Vec<(IpAddr, i64)>>,
}

impl BanManager for MockBan {
    fn misbehaving(&self, peer: &Peer, score: i32) {
        let total = peer.misbehavior.fetch_add(score, Ordering::Relaxed) + score;
        if total >= 100 {
            peer.set_disconnect();
        }
    }

    fn ban(&self, addr: IpAddr, _reason: &str, seconds: i64) {
        self.bans.lock().unwrap().push((addr, seconds));
    }

    fn is_banned(&self, addr: IpAddr) -> bool {
        self.bans.lock().unwrap().iter().any(|(banned, _)| *banned == addr)
    }
}

struct MockUi;

impl UiInterface for MockUi {
    fn thread_safe_message_box(&self, _message: &str) {}
    fn notify_alert_changed(&self) {}
    fn start_shutdown(&self) {}
    fn run_alert_command(&self, _command: &str) {}
}

struct Harness {
    ctx: Arc<NodeContext>,
    validator: Arc<MockValidator>,
    store: Arc<MockStore>,
    mempool: Arc<MockMempool>,
    addrman: Arc<MockAddrman>,
    dosman: Arc<MockBan>,
}

fn harness(network: Network) -> Harness {
    let validator = Arc::new(MockValidator::default());
    let store = Arc::new(MockStore::default());
    let mempool = Arc::new(MockMempool::default());
    let addrman = Arc::new(MockAddrman::default());
    let dosman = Arc::new(MockBan::default());
    let mut config = Config::default_for(network);
    config.services = NODE_NETWORK | NODE_BLOOM | NODE_XTHIN;
    let ctx = Arc::new(NodeContext::new(
        config,
        Collaborators {
            validator: validator.clone() as _,
            coins: Arc::new(MockCoins),
            block_store: store.clone() as _,
            mempool: mempool.clone() as _,
            addrman: addrman.clone() as _,
            dosman: dosman.clone() as _,
            ui: Arc::new(MockUi),
            observer: Arc::new(NullObserver),
        },
    ));
    Harness {
        ctx,
        validator,
        store,
        mempool,
        addrman,
        dosman,
    }
}

fn add_peer(
    harness: &Harness,
    id: PeerId,
    inbound: bool,
) -> (Arc<Peer>, UnboundedReceiver<OutboundMessage>) {
    let addr = format!("10.0.0.{}:8333", id + 1).parse().unwrap();
    let (peer, rx) = Peer::new(id, addr, inbound, false, now_secs());
    dispatcher::initialize_peer(&harness.ctx, &peer);
    (peer, rx)
}

fn drain_commands(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<String> {
    let mut commands = Vec::new();
    while let Ok(message) = rx.try_recv() {
        commands.push(message.command);
    }
    commands
}

fn drain_messages(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<NetMessage> {
    let mut messages = Vec::new();
    while let Ok(OutboundMessage { command, payload }) = rx.try_recv() {
        messages.push(NetMessage::decode(&command, &payload).expect("decodable outbound"));
    }
    messages
}

/// A chain of headers recent enough that the node is not in IBD.
fn recent_headers(count: usize, prev: Hash256) -> Vec<BlockHeader> {
    let base = (now_secs() - count as i64 * 600) as u32;
    let mut headers = Vec::with_capacity(count);
    let mut prev_hash = prev;
    for i in 0..count {
        let header = BlockHeader {
            version: 4,
            prev_block: prev_hash,
            merkle_root: [i as u8 + 1; 32],
            time: base + i as u32 * 600,
            bits: 0x207fffff,
            nonce: i as u32,
        };
        prev_hash = header.hash();
        headers.push(header);
    }
    headers
}

/// Index a recent chain and make it active, marking data present.
fn seed_chain(harness: &Harness, count: usize) -> Vec<Hash256> {
    let headers = recent_headers(count, ZERO_HASH);
    let mut hashes = Vec::new();
    let mut main = harness.ctx.main();
    let mut tip = None;
    for header in headers {
        let id = main.block_index.insert_header(header).unwrap();
        main.block_index
            .set_status(id, STATUS_VALID_TREE | STATUS_VALID_SCRIPTS | STATUS_HAVE_DATA);
        hashes.push(header.hash());
        tip = Some(id);
    }
    let tip = tip.unwrap();
    let MainState {
        active, block_index, ..
    } = &mut *main;
    active.set_tip(block_index, tip);
    main.best_header = Some(tip);
    hashes
}

fn version_message(nonce: u64, services: u64) -> NetMessage {
    let addr = NetAddress::new("10.0.0.2:8333".parse().unwrap(), services);
    NetMessage::Version(Box::new(VersionPayload {
        version: PROTOCOL_VERSION,
        services,
        timestamp: now_secs(),
        addr_recv: addr,
        addr_from: addr,
        nonce,
        user_agent: "/other:1.0/".to_string(),
        start_height: 100,
        relay: true,
    }))
}

// ---- scenarios ----------------------------------------------------------

#[test]
fn s1_outbound_handshake_message_sequence() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, false);

    // our VERSION goes out as soon as the outbound peer registers
    assert_eq!(drain_commands(&mut rx), vec!["version"]);

    process_message(
        &harness.ctx,
        &peer,
        version_message(77, NODE_NETWORK | NODE_XTHIN),
        0,
    )
    .unwrap();
    let after_version = drain_commands(&mut rx);
    assert_eq!(after_version[0], "verack");

    process_message(&harness.ctx, &peer, NetMessage::Verack, 0).unwrap();
    let after_verack = drain_commands(&mut rx);
    assert_eq!(
        after_verack,
        vec!["sendheaders", "filtersizext", "buversion"]
    );
    assert!(peer.successfully_connected.load(Ordering::Relaxed));

    // BU handshake completes with BUVERSION/BUVERACK both ways
    process_message(
        &harness.ctx,
        &peer,
        NetMessage::BuVersion {
            addr_from_port: 8333,
        },
        0,
    )
    .unwrap();
    assert_eq!(drain_commands(&mut rx), vec!["buverack"]);
    process_message(&harness.ctx, &peer, NetMessage::BuVerack, 0).unwrap();
}

#[test]
fn s1b_duplicate_version_disconnects() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, false);
    process_message(&harness.ctx, &peer, version_message(77, NODE_NETWORK), 0).unwrap();
    let result = process_message(&harness.ctx, &peer, version_message(77, NODE_NETWORK), 0);
    assert!(result.is_err());
    assert!(peer.is_disconnecting());
    let commands = drain_commands(&mut rx);
    assert_eq!(commands.iter().filter(|c| *c == "verack").count(), 1);
    assert!(commands.contains(&"reject".to_string()));
}

#[test]
fn s2_self_connect_disconnects_without_verack() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, false);
    drain_commands(&mut rx); // our version

    let nonce = harness.ctx.local_nonce;
    process_message(&harness.ctx, &peer, version_message(nonce, NODE_NETWORK), 0).unwrap();
    assert!(peer.is_disconnecting());
    assert!(!drain_commands(&mut rx).contains(&"verack".to_string()));
}

#[test]
fn s3_block_inv_requests_header_not_body() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 4);
    let (peer, mut rx) = add_peer(&harness, 0, true);
    drain_commands(&mut rx);

    let unknown = [0xabu8; 32];
    process_message(
        &harness.ctx,
        &peer,
        NetMessage::Inv(vec![Inv::new(MSG_BLOCK, unknown)]),
        0,
    )
    .unwrap();

    let messages = drain_messages(&mut rx);
    let mut saw_getheaders = false;
    for message in &messages {
        match message {
            NetMessage::GetHeaders { locator, stop } => {
                saw_getheaders = true;
                assert_eq!(*stop, unknown);
                assert!(!locator.is_empty());
            }
            NetMessage::GetData(_) => panic!("block body must not be requested from an inv"),
            _ => {}
        }
    }
    assert!(saw_getheaders);
}

#[test]
fn s4_out_of_order_headers_are_parked_then_spliced() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 1);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let headers = recent_headers(6, hashes[0]);
    let batch1: Vec<_> = headers[0..3].to_vec();
    let batch2: Vec<_> = headers[3..6].to_vec();

    // batch 2 first: nothing connects, everything parks
    handle_headers(&harness.ctx, &peer, batch2.clone()).unwrap();
    {
        let main = harness.ctx.main();
        assert_eq!(main.unconnected_headers.len(), 3);
        assert_eq!(main.block_index.len(), 1);
    }

    // batch 1 arrives and pulls the parked headers in behind it
    handle_headers(&harness.ctx, &peer, batch1).unwrap();
    {
        let main = harness.ctx.main();
        assert!(main.unconnected_headers.is_empty());
        assert_eq!(main.block_index.len(), 7);
        let last_hash = headers[5].hash();
        assert!(main.block_index.lookup(&last_hash).is_some());
    }
}

#[test]
fn s4b_unconnected_headers_expire() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 1);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let headers = recent_headers(6, hashes[0]);
    handle_headers(&harness.ctx, &peer, headers[3..6].to_vec()).unwrap();
    {
        let mut main = harness.ctx.main();
        assert_eq!(main.unconnected_headers.len(), 3);
        // age the parked entries past the TTL
        for (_, arrival) in main.unconnected_headers.values_mut() {
            *arrival -= UNCONNECTED_HEADERS_TIMEOUT + 1;
        }
    }
    // an unrelated connecting batch triggers the expiry sweep
    handle_headers(&harness.ctx, &peer, headers[0..1].to_vec()).unwrap();
    {
        let main = harness.ctx.main();
        assert!(main.unconnected_headers.is_empty());
        assert_eq!(main.block_index.len(), 2);
    }
}

#[test]
fn headers_batches_are_idempotent() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 1);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let headers = recent_headers(5, hashes[0]);
    handle_headers(&harness.ctx, &peer, headers.clone()).unwrap();
    let (len_first, best_first) = {
        let main = harness.ctx.main();
        (
            main.block_index.len(),
            main.peer_state(0).unwrap().best_known_block,
        )
    };
    handle_headers(&harness.ctx, &peer, headers).unwrap();
    let main = harness.ctx.main();
    assert_eq!(main.block_index.len(), len_first);
    assert_eq!(main.peer_state(0).unwrap().best_known_block, best_first);
}

#[test]
fn headers_with_most_work_trigger_direct_fetch() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, true);
    drain_commands(&mut rx);

    // a fork with more work than our 2-block chain
    let fork = recent_headers(4, hashes[0]);
    handle_headers(&harness.ctx, &peer, fork.clone()).unwrap();

    let messages = drain_messages(&mut rx);
    let mut fetched = Vec::new();
    for message in messages {
        if let NetMessage::GetData(invs) = message {
            fetched.extend(invs);
        }
    }
    assert!(!fetched.is_empty(), "direct fetch expected");
    // oldest first
    assert_eq!(fetched[0].hash, fork[0].hash());
    assert!(fetched.iter().all(|inv| inv.inv_type == MSG_BLOCK));
}

#[test]
fn s5_excessive_off_chain_block_is_not_served() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 4);
    let (peer, _rx) = add_peer(&harness, 0, true);

    // a fork block off the active chain, fully valid but excessive
    let fork_header = BlockHeader {
        version: 4,
        prev_block: hashes[1],
        merkle_root: [0xcc; 32],
        time: (now_secs() - 600) as u32,
        bits: 0x207fffff,
        nonce: 9_999,
    };
    let fork_id = {
        let mut main = harness.ctx.main();
        let id = main.block_index.insert_header(fork_header).unwrap();
        main.block_index.set_status(
            id,
            STATUS_VALID_TREE | STATUS_VALID_SCRIPTS | STATUS_HAVE_DATA | STATUS_EXCESSIVE,
        );
        id
    };
    let main = harness.ctx.main();
    assert!(!serving_policy_allows(&harness.ctx, &main, &peer, fork_id));
}

#[test]
fn s6_old_off_chain_block_is_not_served() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 4);
    let (peer, mut rx) = add_peer(&harness, 0, true);
    drain_commands(&mut rx);

    // 40 days older than the best header, on a fork
    let old_header = BlockHeader {
        version: 4,
        prev_block: hashes[1],
        merkle_root: [0xdd; 32],
        time: (now_secs() - 40 * 24 * 60 * 60) as u32,
        bits: 0x207fffff,
        nonce: 10_000,
    };
    let old_block = Block {
        header: old_header,
        txs: Vec::new(),
    };
    harness.store.insert(old_block.clone());
    let (old_id, old_hash) = {
        let mut main = harness.ctx.main();
        let id = main.block_index.insert_header(old_header).unwrap();
        main.block_index
            .set_status(id, STATUS_VALID_TREE | STATUS_VALID_SCRIPTS | STATUS_HAVE_DATA);
        (id, old_header.hash())
    };
    {
        let main = harness.ctx.main();
        assert!(!serving_policy_allows(&harness.ctx, &main, &peer, old_id));
    }

    // and the full getdata path stays silent for it
    process_message(
        &harness.ctx,
        &peer,
        NetMessage::GetData(vec![Inv::new(MSG_BLOCK, old_hash)]),
        0,
    )
    .unwrap();
    let messages = drain_messages(&mut rx);
    assert!(messages
        .iter()
        .all(|message| !matches!(message, NetMessage::Block(_))));

    // while a recent active-chain block is served
    let active_block = Block {
        header: {
            let main = harness.ctx.main();
            let id = main.block_index.lookup(&hashes[3]).unwrap();
            main.block_index.get(id).header
        },
        txs: Vec::new(),
    };
    harness.store.insert(active_block);
    process_message(
        &harness.ctx,
        &peer,
        NetMessage::GetData(vec![Inv::new(MSG_BLOCK, hashes[3])]),
        0,
    )
    .unwrap();
    let messages = drain_messages(&mut rx);
    assert!(messages
        .iter()
        .any(|message| matches!(message, NetMessage::Block(_))));
}

#[tokio::test]
async fn s7_bad_magic_bans_for_four_hours() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let frame = bchd_net::frame::build_frame([0xde, 0xad, 0xbe, 0xef], "ping", &[0u8; 8]);
    let (mut client, server) = tokio::io::duplex(4096);
    tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
        .await
        .unwrap();
    drop(client);

    let mut reader = server;
    let result = dispatcher::run_receive_pump(&harness.ctx, &peer, &mut reader).await;
    assert!(result.is_err());
    assert!(peer.is_disconnecting());
    let bans = harness.dosman.bans.lock().unwrap();
    assert_eq!(bans.len(), 1);
    assert_eq!(bans[0].0, peer.addr.ip());
    assert_eq!(bans[0].1, 4 * 60 * 60);
}

#[test]
fn s8_get_xthin_rate_limit_disconnects_on_mainnet() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);
    peer.services
        .store(NODE_NETWORK | NODE_XTHIN, Ordering::Relaxed);

    let block = Block {
        header: {
            let main = harness.ctx.main();
            let id = main.block_index.lookup(&hashes[1]).unwrap();
            main.block_index.get(id).header
        },
        txs: Vec::new(),
    };
    harness.store.insert(block);

    for _ in 0..25 {
        let _ = process_message(
            &harness.ctx,
            &peer,
            NetMessage::GetData(vec![Inv::new(MSG_THINBLOCK, hashes[1])]),
            0,
        );
        if peer.is_disconnecting() {
            break;
        }
    }
    assert!(peer.misbehavior.load(Ordering::Relaxed) >= 50);
    assert!(peer.is_disconnecting());
}

#[test]
fn invariants_hold_across_peer_lifecycle() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (first, _rx1) = add_peer(&harness, 0, false);
    let (second, _rx2) = add_peer(&harness, 1, false);
    first.services.store(NODE_NETWORK, Ordering::Relaxed);
    second.services.store(NODE_NETWORK, Ordering::Relaxed);

    {
        let mut main = harness.ctx.main();
        main.update_preferred_download(&first);
        main.update_preferred_download(&second);
        assert_eq!(main.preferred_download_count, 2);
    }

    // put blocks in flight from both peers
    let inv_a = Inv::new(MSG_BLOCK, [0xaa; 32]);
    let inv_b = Inv::new(MSG_BLOCK, [0xbb; 32]);
    harness.ctx.requester.ask_for(&inv_a, &first, 1_000);
    harness.ctx.requester.ask_for(&inv_b, &second, 1_000);

    // every in-flight entry references a registered peer
    for (_, peers) in harness.ctx.requester.in_flight_peers() {
        for id in peers {
            assert!(harness.ctx.peers.contains(id));
        }
    }

    dispatcher::finalize_peer(&harness.ctx, &first);
    {
        let main = harness.ctx.main();
        assert_eq!(main.preferred_download_count, 1);
    }
    assert_eq!(harness.ctx.requester.num_blocks_in_flight(0), 0);

    // removing the last peer leaves no residue
    dispatcher::finalize_peer(&harness.ctx, &second);
    {
        let main = harness.ctx.main();
        assert_eq!(main.preferred_download_count, 0);
        assert!(main.peer_states.is_empty());
    }
    assert!(harness.ctx.requester.blocks_in_flight_is_empty());
}

#[test]
fn tx_inv_schedules_fetch_outside_ibd() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, true);
    drain_commands(&mut rx);

    let txid = [0x42u8; 32];
    process_message(
        &harness.ctx,
        &peer,
        NetMessage::Inv(vec![Inv::new(MSG_TX, txid)]),
        0,
    )
    .unwrap();
    let messages = drain_messages(&mut rx);
    assert!(messages.iter().any(|message| matches!(
        message,
        NetMessage::GetData(invs) if invs == &vec![Inv::new(MSG_TX, txid)]
    )));
}

#[test]
fn oversized_and_empty_invs_are_misbehavior() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);

    assert!(process_message(&harness.ctx, &peer, NetMessage::Inv(Vec::new()), 0).is_err());
    assert_eq!(peer.misbehavior.load(Ordering::Relaxed), 20);
}

#[test]
fn tx_message_lands_on_admission_queue() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let tx = Transaction {
        version: 1,
        inputs: Vec::new(),
        outputs: Vec::new(),
        lock_time: 0,
    };
    let txid = tx.txid();
    process_message(&harness.ctx, &peer, NetMessage::Tx(tx), 0).unwrap();
    assert_eq!(*harness.mempool.enqueued.lock().unwrap(), vec![txid]);
}

#[test]
fn blocks_only_drops_loose_transactions() {
    let mut harness = harness(Network::Main);
    let ctx = Arc::get_mut(&mut harness.ctx).unwrap();
    ctx.config.blocks_only = true;
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let tx = Transaction {
        version: 1,
        inputs: Vec::new(),
        outputs: Vec::new(),
        lock_time: 0,
    };
    process_message(&harness.ctx, &peer, NetMessage::Tx(tx), 0).unwrap();
    assert!(harness.mempool.enqueued.lock().unwrap().is_empty());
}

#[test]
fn block_receipt_flows_to_validator_and_clears_flight() {
    let harness = harness(Network::Main);
    let hashes = seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);

    let header = recent_headers(1, hashes[1]).remove(0);
    let block = Block {
        header,
        txs: Vec::new(),
    };
    let hash = block.hash();
    harness
        .ctx
        .requester
        .ask_for(&Inv::new(MSG_BLOCK, hash), &peer, 1_000);
    assert_eq!(harness.ctx.requester.num_blocks_in_flight(0), 1);

    process_message(&harness.ctx, &peer, NetMessage::Block(block), 0).unwrap();
    assert_eq!(harness.ctx.requester.num_blocks_in_flight(0), 0);
    assert_eq!(*harness.validator.processed.lock().unwrap(), vec![hash]);
    let main = harness.ctx.main();
    assert!(main.already_have_block(&hash));
}

#[test]
fn verack_before_version_disconnects() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);
    // inbound peer: we have not sent VERSION yet
    assert!(process_message(&harness.ctx, &peer, NetMessage::Verack, 0).is_err());
    assert!(peer.is_disconnecting());
}

#[test]
fn getaddr_is_inbound_only_and_once() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);

    let (outbound, mut out_rx) = add_peer(&harness, 0, false);
    drain_commands(&mut out_rx);
    process_message(&harness.ctx, &outbound, NetMessage::GetAddr, 0).unwrap();
    assert!(!outbound.sent_addr.load(Ordering::Relaxed));

    let (inbound, _rx) = add_peer(&harness, 1, true);
    process_message(&harness.ctx, &inbound, NetMessage::GetAddr, 0).unwrap();
    assert!(inbound.sent_addr.load(Ordering::Relaxed));
}

#[test]
fn filter_lifecycle_enforces_rules() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, true);
    peer.proto_version.store(PROTOCOL_VERSION, Ordering::Relaxed);

    // filteradd without a loaded filter is abusive
    assert!(process_message(&harness.ctx, &peer, NetMessage::FilterAdd(vec![1]), 0).is_err());
    assert_eq!(peer.misbehavior.load(Ordering::Relaxed), 100);
    assert!(peer.is_disconnecting());

    // a fresh peer loading a sane filter starts receiving tx relay
    let (peer2, _rx2) = add_peer(&harness, 1, true);
    peer2.proto_version.store(PROTOCOL_VERSION, Ordering::Relaxed);
    let filter = bchd_net::bloom::BloomFilter::new(10, 0.01, 0, 1);
    process_message(&harness.ctx, &peer2, NetMessage::FilterLoad(filter), 0).unwrap();
    assert!(peer2.relay_txes.load(Ordering::Relaxed));
    assert!(peer2.filter.lock().unwrap().is_some());

    // oversized filteradd element
    assert!(process_message(
        &harness.ctx,
        &peer2,
        NetMessage::FilterAdd(vec![0u8; 521]),
        0
    )
    .is_err());
}

#[test]
fn filtersizexthin_below_minimum_disconnects() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, mut rx) = add_peer(&harness, 0, true);
    peer.services.store(NODE_XTHIN, Ordering::Relaxed);

    assert!(process_message(
        &harness.ctx,
        &peer,
        NetMessage::FilterSizeXthin(SMALLEST_MAX_BLOOM_FILTER_SIZE - 1),
        0
    )
    .is_err());
    assert!(peer.is_disconnecting());
    assert!(drain_commands(&mut rx).contains(&"reject".to_string()));
}

#[test]
fn verack_timeout_records_eviction() {
    let harness = harness(Network::Main);
    seed_chain(&harness, 2);
    let (peer, _rx) = add_peer(&harness, 0, false);
    // pretend the version went out long ago
    peer.version_sent_at
        .store(now_secs() - 120, Ordering::Relaxed);
    bchd_net::send_pump::send_messages(&harness.ctx, &peer);
    assert!(peer.is_disconnecting());
    assert_eq!(
        *harness.addrman.evictions.lock().unwrap(),
        vec![peer.addr.ip()]
    );
}
