use std::sync::Arc;

use anyhow::Result;
use codec::{BLOCK_DATA, Key, PeerId, client::SearchStart, wrapper::fold_hash};
use gap_server::{Node, config::Routing, search, store};
use parking_lot::Mutex;
use routing::{
    BlockValue, Topology, Transport,
    engine::GetOutcome,
    manager::{ClientId, ResponseSink},
    now_ms,
};

fn peer(fill: u8) -> PeerId {
    PeerId([fill; 64])
}

#[derive(Default)]
struct RecordingTransport {
    connected: Mutex<Vec<PeerId>>,
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl Transport for RecordingTransport {
    fn unicast(&self, peer: &PeerId, bytes: &[u8], _priority: u32, _deadline: i64) {
        self.sent.lock().push((*peer, bytes.to_vec()));
    }

    fn for_each_connected(&self, callback: &mut dyn FnMut(&PeerId)) {
        for it in self.connected.lock().clone() {
            callback(&it);
        }
    }
}

struct FixedTopology(u32);

impl Topology for FixedTopology {
    fn estimate_network_size(&self) -> u32 {
        self.0
    }
}

/// Collects everything the node would have written to client sockets.
#[derive(Default)]
struct TestSink {
    delivered: Mutex<Vec<(ClientId, Key, BlockValue)>>,
}

impl ResponseSink for TestSink {
    fn deliver(&self, client: ClientId, key: &Key, value: &BlockValue) {
        self.delivered.lock().push((client, *key, value.clone()));
    }
}

fn node() -> (Node<TestSink>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let node = Node::new(
        peer(0xaa),
        &Routing::default(),
        transport.clone(),
        Arc::new(FixedTopology(1)),
        TestSink::default(),
    );

    (node, transport)
}

fn search_request(key: Key) -> SearchStart {
    SearchStart {
        block_type: BLOCK_DATA,
        anonymity: 0,
        priority: 10,
        expiration: now_ms() + 5_000,
        target: PeerId::ZERO,
        keys: vec![key],
    }
}

#[test]
fn test_search_without_peers_stays_local() -> Result<()> {
    let (node, transport) = node();
    let outcome = search::start_search(
        &node.engine,
        &node.manager,
        &node.observer,
        &node.lookup,
        ClientId(1),
        &search_request(Key([0xcd; 64])),
    )?;

    assert_eq!(outcome, GetOutcome::Local);
    assert!(transport.sent.lock().is_empty());
    assert_eq!(node.stats.slots_used.get(), 0);
    Ok(())
}

#[test]
fn test_search_cache_hit_is_answered_directly() -> Result<()> {
    let (node, _transport) = node();
    let data = b"hello".as_ref();
    let key = fold_hash(data);

    node.observer
        .insert(
            &key,
            store::block(BLOCK_DATA, 0, now_ms() + 3_600_000, data),
            10,
        )
        .expect("valid block");

    let outcome = search::start_search(
        &node.engine,
        &node.manager,
        &node.observer,
        &node.lookup,
        ClientId(1),
        &search_request(key),
    )?;

    assert_eq!(outcome, GetOutcome::Local);

    let delivered = node.manager.sink().delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, ClientId(1));
    assert_eq!(delivered[0].1, key);
    assert_eq!(delivered[0].2.data.as_ref(), data);
    Ok(())
}

#[test]
fn test_search_forwards_to_connected_peer() -> Result<()> {
    let (node, transport) = node();
    let b = peer(1);
    transport.connected.lock().push(b);

    let outcome = search::start_search(
        &node.engine,
        &node.manager,
        &node.observer,
        &node.lookup,
        ClientId(1),
        &search_request(Key([0xcd; 64])),
    )?;

    assert_eq!(outcome, GetOutcome::Routed);
    assert_eq!(node.stats.slots_used.get(), 1);

    let sent = transport.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, b);
    // one key: the frame is exactly the fixed query size
    assert_eq!(sent[0].1.len(), 144);
    Ok(())
}

#[test]
fn test_client_exit_stops_tracking() -> Result<()> {
    let (node, _transport) = node();
    let key = Key([0x42; 64]);

    search::start_search(
        &node.engine,
        &node.manager,
        &node.observer,
        &node.lookup,
        ClientId(9),
        &search_request(key),
    )?;

    assert_eq!(node.stats.queries_tracked.get(), 1);
    node.manager.client_exit(ClientId(9));
    assert_eq!(node.stats.queries_tracked.get(), 0);

    // a response arriving now goes nowhere
    node.manager.process_response(
        &key,
        &BlockValue {
            block_type: BLOCK_DATA,
            anonymity: 0,
            expiration: now_ms() + 1_000,
            data: b"late".as_ref().into(),
        },
    );

    assert!(node.manager.sink().delivered.lock().is_empty());
    Ok(())
}
