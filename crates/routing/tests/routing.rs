use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use codec::{
    BLOCK_ANY, BLOCK_DATA, Key, PeerId,
    message::{Query, Reply},
    wrapper::{Wrapper, fold_hash},
};
use gap_server_routing::{
    Blockstore, Identity, LoadMonitor, TTL_DECREMENT, Topology, Traffic, Transport, now_ms,
    engine::{Engine, EngineOptions, GetOutcome},
    pid::PidTable,
    stats::EngineStats,
    table::{IndirectionTable, RouteContext},
};
use parking_lot::Mutex;

fn peer(fill: u8) -> PeerId {
    PeerId([fill; 64])
}

/// A block store over plain wrapper payloads, validating data blocks by
/// their content hash.
#[derive(Default)]
struct MemBlockstore {
    blocks: Mutex<ahash::AHashMap<Key, Vec<Vec<u8>>>>,
}

impl MemBlockstore {
    fn preload(&self, key: Key, payload: Vec<u8>) {
        self.blocks.lock().entry(key).or_default().push(payload);
    }
}

impl Blockstore for MemBlockstore {
    fn put(&self, key: &Key, payload: &[u8], _priority: u32) -> Result<(), ()> {
        let wrapper = Wrapper::decode(payload).map_err(|_| ())?;
        if wrapper.block_type == BLOCK_DATA && &wrapper.content_hash() != key {
            return Err(());
        }

        let mut blocks = self.blocks.lock();
        let entry = blocks.entry(*key).or_default();
        if !entry.iter().any(|it| it == payload) {
            entry.push(payload.to_vec());
        }

        Ok(())
    }

    fn get(
        &self,
        block_type: u32,
        _priority: u32,
        keys: &[Key],
        callback: &mut dyn FnMut(&Key, &[u8]) -> bool,
    ) -> usize {
        let blocks = self.blocks.lock();
        let Some(entry) = keys.first().and_then(|key| blocks.get(key)) else {
            return 0;
        };

        let mut count = 0;
        for payload in entry {
            if let Ok(wrapper) = Wrapper::decode(payload) {
                if block_type != BLOCK_ANY && wrapper.block_type != block_type {
                    continue;
                }
            }

            count += 1;
            if !callback(&keys[0], payload) {
                break;
            }
        }

        count
    }

    fn fast_get(&self, key: &Key) -> bool {
        self.blocks.lock().contains_key(key)
    }

    fn is_unique_reply(&self, payload: &[u8], block_type: u32, key: &Key) -> bool {
        let Ok(wrapper) = Wrapper::decode(payload) else {
            return false;
        };

        if block_type != BLOCK_ANY && wrapper.block_type != block_type {
            return false;
        }

        wrapper.block_type == BLOCK_DATA && &wrapper.content_hash() == key
    }

    fn reply_hash(&self, payload: &[u8]) -> Key {
        match Wrapper::decode(payload) {
            Ok(wrapper) => wrapper.content_hash(),
            Err(_) => fold_hash(payload),
        }
    }
}

#[derive(Default)]
struct RecordingTransport {
    connected: Mutex<Vec<PeerId>>,
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl RecordingTransport {
    fn connect(&self, peer: PeerId) {
        self.connected.lock().push(peer);
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn sent_to(&self, peer: &PeerId) -> usize {
        self.sent.lock().iter().filter(|(to, _)| to == peer).count()
    }
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

struct OpenTrust;

impl Identity for OpenTrust {
    fn change_trust(&self, _: &PeerId, delta: i32) -> i32 {
        delta
    }
}

struct FixedTopology(u32);

impl Topology for FixedTopology {
    fn estimate_network_size(&self) -> u32 {
        self.0
    }
}

struct Idle;

impl LoadMonitor for Idle {
    fn cpu_load(&self) -> Option<u32> {
        None
    }

    fn upload_load(&self) -> Option<u32> {
        None
    }

    fn download_load(&self) -> Option<u32> {
        None
    }
}

struct AlwaysCover;

impl Traffic for AlwaysCover {
    fn has_sufficient_cover(&self, _: u32) -> bool {
        true
    }
}

struct Harness {
    engine: Arc<Engine>,
    blockstore: Arc<MemBlockstore>,
    transport: Arc<RecordingTransport>,
}

fn harness(my_id: PeerId, traffic: Option<Arc<dyn Traffic>>) -> Harness {
    let blockstore = Arc::new(MemBlockstore::default());
    let transport = Arc::new(RecordingTransport::default());
    let engine = Engine::new(EngineOptions {
        my_id,
        table_size: 1024,
        bitmap_keep_chance: 4,
        hard_cpu_limit: 0,
        hard_upload_limit: 0,
        blockstore: blockstore.clone(),
        transport: transport.clone(),
        identity: Arc::new(OpenTrust),
        topology: Arc::new(FixedTopology(4)),
        traffic,
        load: Arc::new(Idle),
        stats: Arc::new(EngineStats::default()),
    });

    Harness {
        engine,
        blockstore,
        transport,
    }
}

fn data_payload(data: &[u8]) -> (Key, Vec<u8>) {
    let mut bytes = BytesMut::new();
    Wrapper {
        block_type: BLOCK_DATA,
        expiration: now_ms() + 60_000,
        data,
    }
    .encode(&mut bytes);

    (fold_hash(data), bytes.to_vec())
}

fn reply_frame(key: &Key, payload: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    Reply::encode(key, payload, &mut bytes).unwrap();
    bytes.to_vec()
}

fn query_frame(key: Key, return_to: PeerId, priority: u32, ttl: i32) -> Vec<u8> {
    Query {
        block_type: BLOCK_DATA,
        priority,
        ttl,
        return_to,
        keys: vec![key],
    }
    .to_bytes()
    .to_vec()
}

#[test]
fn test_local_search_without_peers_stays_local() -> Result<()> {
    let h = harness(peer(0xaa), None);
    let outcome = h.engine.get_start(
        None,
        BLOCK_DATA,
        0,
        &[Key([0xcd; 64])],
        now_ms() + 5_000,
        10,
    )?;

    assert_eq!(outcome, GetOutcome::Local);
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(h.engine.stats().slots_used.get(), 0);
    Ok(())
}

#[test]
fn test_local_search_forwards_once() -> Result<()> {
    let h = harness(peer(0xaa), None);
    let b = peer(1);
    h.transport.connect(b);

    let key = Key([0xcd; 64]);
    let outcome = h
        .engine
        .get_start(None, BLOCK_DATA, 0, &[key], now_ms() + 5_000, 5)?;

    assert_eq!(outcome, GetOutcome::Routed);
    assert_eq!(h.transport.sent_to(&b), 1);
    assert_eq!(h.engine.stats().slots_used.get(), 1);

    // the bitmap is the authority: B already has the query, so the fill
    // callback writes nothing for it
    let mut buf = [0u8; 1200];
    assert_eq!(h.engine.fill(&b, &mut buf), 0);

    // a peer that never saw the query gets it once, then never again
    let d = peer(2);
    let first = h.engine.fill(&d, &mut buf);
    assert_eq!(first, 144);
    assert_eq!(h.engine.fill(&d, &mut buf), 0);
    Ok(())
}

#[test]
fn test_cover_traffic_required_for_anonymity() {
    let h = harness(peer(0xaa), None);
    let result = h
        .engine
        .get_start(None, BLOCK_DATA, 1, &[Key([1; 64])], now_ms() + 5_000, 1);

    assert!(result.is_err());

    let h = harness(peer(0xaa), Some(Arc::new(AlwaysCover)));
    assert!(
        h.engine
            .get_start(None, BLOCK_DATA, 1, &[Key([1; 64])], now_ms() + 5_000, 1)
            .is_ok()
    );
}

#[test]
fn test_routing_loop_is_dropped() -> Result<()> {
    let me = peer(0xaa);
    let h = harness(me, None);
    let b = peer(1);
    h.transport.connect(b);

    // a query whose return-to is our own identity has looped
    h.engine
        .handle_query(&b, &query_frame(Key([7; 64]), me, 10, 30_000))?;

    assert_eq!(h.engine.stats().protocol_violations.get(), 1);
    assert_eq!(h.engine.stats().requests_total.get(), 0);
    assert_eq!(h.engine.stats().slots_used.get(), 0);
    assert_eq!(h.transport.sent_count(), 0);
    Ok(())
}

#[test]
fn test_duplicate_reply_is_dropped() -> Result<()> {
    let me = peer(0xaa);
    let h = harness(me, None);
    let b = peer(1);
    let c = peer(2);
    h.transport.connect(b);
    h.transport.connect(c);

    let (key, payload) = data_payload(b"the content");

    // B asks us; the query is forwarded to C
    h.engine
        .handle_query(&b, &query_frame(key, b, 0, 30_000))?;
    assert_eq!(h.transport.sent_to(&c), 1);

    // C answers; the reply travels back to B
    let frame = reply_frame(&key, &payload);
    h.engine.handle_reply(Some(&c), &frame)?;
    assert_eq!(h.transport.sent_to(&b), 1);
    assert_eq!(h.engine.stats().response_count.get(), 1);

    // the same reply again is a duplicate: dropped, nothing forwarded
    h.engine.handle_reply(Some(&c), &frame)?;
    assert_eq!(h.engine.stats().reply_dups.get(), 1);
    assert_eq!(h.transport.sent_to(&b), 1);
    assert_eq!(h.engine.stats().response_count.get(), 1);
    Ok(())
}

#[test]
fn test_local_reply_serves_waiters_without_accounting() -> Result<()> {
    let me = peer(0xaa);
    let h = harness(me, None);
    let b = peer(1);
    h.transport.connect(b);

    let (key, payload) = data_payload(b"locally found");
    h.engine
        .handle_query(&b, &query_frame(key, b, 0, 30_000))?;

    let before = h.transport.sent_to(&b);
    h.engine.handle_reply(None, &reply_frame(&key, &payload))?;

    // the waiter is served, but a local answer earns nobody trust or
    // hot-path weight
    assert_eq!(h.transport.sent_to(&b), before + 1);
    assert_eq!(h.engine.stats().response_count.get(), 0);
    Ok(())
}

#[test]
fn test_invalid_content_is_rejected() {
    let me = peer(0xaa);
    let h = harness(me, None);
    let c = peer(2);
    h.transport.connect(c);

    // data block whose content hash does not match the key
    let (_, payload) = data_payload(b"the content");
    let frame = reply_frame(&Key([0x11; 64]), &payload);

    assert!(h.engine.handle_reply(Some(&c), &frame).is_err());
    assert_eq!(h.engine.stats().successes.get(), 0);
}

#[test]
fn test_remote_query_with_cached_answer_stops_forwarding() -> Result<()> {
    let me = peer(0xaa);
    let h = harness(me, None);
    let b = peer(1);
    let c = peer(2);
    h.transport.connect(b);
    h.transport.connect(c);

    let (key, payload) = data_payload(b"already here");
    h.blockstore.preload(key, payload);

    // we hold the unique answer, so nothing goes to C; the reply will
    // reach B through the delay loop instead
    h.engine
        .handle_query(&b, &query_frame(key, b, 0, 30_000))?;

    assert_eq!(h.transport.sent_to(&c), 0);
    assert_eq!(h.engine.stats().local_results.get(), 1);
    Ok(())
}

#[test]
fn test_priority_displacement_case() {
    let pids = PidTable::default();
    let stats = EngineStats::default();
    let ctx = RouteContext {
        pids: &pids,
        stats: &stats,
        network_size: 4,
    };

    // a one-slot table makes every key collide
    let mut table = IndirectionTable::new(1, 0);
    let sender = pids.intern(&peer(1));

    let k1 = Key([1; 64]);
    let k2 = Key([2; 64]);

    let first = table.needs_forwarding(&ctx, &k1, BLOCK_DATA, 1_000, 1, sender);
    assert_eq!(first.case, 21);
    assert!(first.routed && first.forward);

    // cross-multiplication: 1000 * 50 > 10 * (100 * 1), so the high
    // priority query takes the slot despite its shorter ttl
    let second = table.needs_forwarding(&ctx, &k2, BLOCK_DATA, 100, 50, sender);
    assert_eq!(second.case, 17);
    assert!(second.routed && second.forward);
    assert_eq!(second.dequeue, Some(k1));
}

#[test]
fn test_negative_ttl_taps_pending_request() {
    let pids = PidTable::default();
    let stats = EngineStats::default();
    let ctx = RouteContext {
        pids: &pids,
        stats: &stats,
        network_size: 4,
    };

    let mut table = IndirectionTable::new(1, 0);
    let key = Key([3; 64]);
    let one = pids.intern(&peer(1));
    let two = pids.intern(&peer(2));

    table.needs_forwarding(&ctx, &key, BLOCK_DATA, 30_000, 1, one);

    // an expired query for the same key joins the waiters but neither
    // routes locally nor forwards
    let decision = table.needs_forwarding(&ctx, &key, BLOCK_DATA, -1, 1, two);
    assert_eq!(decision.case, 0);
    assert!(!decision.routed && !decision.forward);
    assert_eq!(table.slot(&key).destinations.len(), 2);
    assert_eq!(pids.total_refs(), 4);
}

#[test]
fn test_dead_slot_boundary_ttl() {
    let pids = PidTable::default();
    let stats = EngineStats::default();
    let ctx = RouteContext {
        pids: &pids,
        stats: &stats,
        network_size: 4,
    };

    let mut table = IndirectionTable::new(1, 0);
    let key = Key([4; 64]);
    let sender = pids.intern(&peer(1));

    table.needs_forwarding(&ctx, &key, BLOCK_DATA, 30_000, 1, sender);

    // age the slot far past the dead-slot threshold
    table.slot_mut(&key).ttl = now_ms() - 11 * TTL_DECREMENT;

    // exactly -5 TTL_DECREMENT takes the dead-slot branch
    let decision = table.needs_forwarding(&ctx, &key, BLOCK_DATA, -5 * TTL_DECREMENT, 1, sender);
    assert_eq!(decision.case, 21);

    // one millisecond worse only taps the pending request
    table.slot_mut(&key).ttl = now_ms() - 11 * TTL_DECREMENT;
    let decision =
        table.needs_forwarding(&ctx, &key, BLOCK_DATA, -5 * TTL_DECREMENT - 1, 1, sender);
    assert_eq!(decision.case, 0);
}

#[test]
fn test_same_query_lower_ttl_just_waits() {
    let pids = PidTable::default();
    let stats = EngineStats::default();
    let ctx = RouteContext {
        pids: &pids,
        stats: &stats,
        network_size: 4,
    };

    let mut table = IndirectionTable::new(1, 0);
    let key = Key([5; 64]);
    let one = pids.intern(&peer(1));
    let two = pids.intern(&peer(2));

    table.needs_forwarding(&ctx, &key, BLOCK_DATA, 60_000, 1, one);

    // same query, shorter ttl, fresh sender: routed through the existing
    // slot, never forwarded again
    let decision = table.needs_forwarding(&ctx, &key, BLOCK_DATA, 10_000, 1, two);
    assert_eq!(decision.case, 6);
    assert!(decision.routed && !decision.forward);

    // the same sender repeating itself cannot even do that
    let repeat = table.needs_forwarding(&ctx, &key, BLOCK_DATA, 10_000, 1, two);
    assert_eq!(repeat.case, 7);
    assert!(!repeat.routed && !repeat.forward);
}
