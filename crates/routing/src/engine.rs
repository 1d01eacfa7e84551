use crate::{
    BASE_QUERY_PRIORITY, BASE_REPLY_PRIORITY, Blockstore, CONTENT_BANDWIDTH_VALUE,
    IDLE_LOAD_THRESHOLD, Identity, LoadMonitor, MAX_SEEN_VALUES, MIN_TABLE_SIZE, Policy,
    QUERY_BANDWIDTH_VALUE, TTL_DECREMENT, Topology, Traffic, Transport, now_ms,
    pid::{Pid, PidTable},
    query::{OutboundQueries, StoredQuery, bit_index},
    reward::RewardRing,
    stats::EngineStats,
    table::{IndirectionTable, RouteContext, retire},
    track::ReplyTracks,
};

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use codec::{
    Key, MAX_FRAME_SIZE, PeerId,
    message::{QUERY_FIXED_SIZE, Query, Reply},
};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

#[derive(Debug)]
pub enum Error {
    Malformed(codec::Error),
    InvalidContent,
    InsufficientCover,
    TooManyKeys,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Malformed(value)
    }
}

/// What a local search request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// No network action: the unique answer was local, or there was
    /// nobody worth asking.
    Local,
    /// The query went out to at least one peer.
    Routed,
}

pub struct EngineOptions {
    pub my_id: PeerId,
    /// Indirection table size; rounded up to `MIN_TABLE_SIZE` and must be
    /// a power of two.
    pub table_size: usize,
    /// On a repeated outbound query, keep the transmit bitmap with
    /// probability `1/bitmap_keep_chance` (and re-broadcast otherwise).
    /// Live policy knob; the historical value migrated from 64 to 4.
    pub bitmap_keep_chance: u32,
    /// Hard limits in percent; zero disables the check.
    pub hard_cpu_limit: u32,
    pub hard_upload_limit: u32,
    pub blockstore: Arc<dyn Blockstore>,
    pub transport: Arc<dyn Transport>,
    pub identity: Arc<dyn Identity>,
    pub topology: Arc<dyn Topology>,
    pub traffic: Option<Arc<dyn Traffic>>,
    pub load: Arc<dyn LoadMonitor>,
    /// The counter surface, shared with whatever else reports into it
    /// (the query manager, the migration pusher).
    pub stats: Arc<EngineStats>,
}

/// State guarded by the coarse engine lock.
#[derive(Default)]
struct Shared {
    queries: OutboundQueries,
    tracks: ReplyTracks,
    rewards: RewardRing,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Delayed {
    fire_at: i64,
    seq: u64,
    bytes: Bytes,
}

#[derive(Default)]
struct Mixer {
    queue: Mutex<BinaryHeap<Reverse<Delayed>>>,
    signal: Condvar,
}

/// How often the reply-track ager runs, in seconds.
const AGER_INTERVAL: u64 = 120;

/// The GAP routing engine.
///
/// Owns the indirection table, the outbound query ring, the reply-track
/// weights, the reward ring and the peer intern table, and glues them to
/// the injected collaborators. All entry points are callable from any
/// thread.
///
/// Locks: `shared` is the coarse engine lock (outbound queries, reply
/// tracks, rewards); `table` is the finer lookup-exclusion lock guarding
/// indirection slots and the datastore lookups launched from them. The
/// two are never held at the same time; decisions that affect both hand
/// work across via `Decision::dequeue`.
pub struct Engine {
    my_id: PeerId,
    bitmap_keep_chance: u32,
    hard_cpu_limit: u32,
    hard_upload_limit: u32,
    blockstore: Arc<dyn Blockstore>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn Identity>,
    topology: Arc<dyn Topology>,
    traffic: Option<Arc<dyn Traffic>>,
    load: Arc<dyn LoadMonitor>,
    stats: Arc<EngineStats>,
    pids: PidTable,
    shared: Mutex<Shared>,
    table: Mutex<IndirectionTable>,
    mixer: Mixer,
    mixer_seq: AtomicU64,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Arc<Self> {
        let size = options.table_size.max(MIN_TABLE_SIZE).next_power_of_two();
        let selector = rand::rng().random_range(0..0xFFFFu32);

        let this = Arc::new(Self {
            my_id: options.my_id,
            bitmap_keep_chance: options.bitmap_keep_chance.max(1),
            hard_cpu_limit: options.hard_cpu_limit,
            hard_upload_limit: options.hard_upload_limit,
            blockstore: options.blockstore,
            transport: options.transport,
            identity: options.identity,
            topology: options.topology,
            traffic: options.traffic,
            load: options.load,
            stats: options.stats,
            pids: PidTable::default(),
            shared: Mutex::new(Shared::default()),
            table: Mutex::new(IndirectionTable::new(size, selector)),
            mixer: Mixer::default(),
            mixer_seq: AtomicU64::new(0),
        });

        // The reply-track ager. Hot-path weights halve every couple of
        // minutes so stale reputations fade; the thread dies with the
        // engine.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            let mut tick = 0u64;
            while let Some(this) = this_.upgrade() {
                tick += 1;
                if tick % AGER_INTERVAL == 0 {
                    this.shared.lock().tracks.age(&this.pids, &this.stats);
                }

                drop(this);
                thread::sleep(Duration::from_secs(1));
            }
        });

        // The mixing loop. Locally found replies re-enter the engine
        // here after a random delay so that local and remote answers have
        // indistinguishable latency profiles.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            loop {
                let Some(this) = this_.upgrade() else {
                    break;
                };

                let mut due = Vec::new();
                {
                    let mut queue = this.mixer.queue.lock();
                    let now = now_ms();
                    while queue.peek().map(|it| it.0.fire_at <= now).unwrap_or(false) {
                        due.push(queue.pop().unwrap().0);
                    }

                    if due.is_empty() {
                        let wait = queue
                            .peek()
                            .map(|it| (it.0.fire_at - now).clamp(10, 1_000))
                            .unwrap_or(1_000);

                        let _ = this
                            .mixer
                            .signal
                            .wait_for(&mut queue, Duration::from_millis(wait as u64));
                    }
                }

                for it in due {
                    // Against now-empty tables this is a no-op; a fired
                    // reply after shutdown must have no side effects.
                    let _ = this.handle_reply(None, &it.bytes);
                }
            }
        });

        this
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Sum of peer intern reference counts; structural tables must
    /// account for every single one.
    pub fn total_pid_refs(&self) -> u64 {
        self.pids.total_refs()
    }

    fn load_too_high(&self) -> bool {
        (self.hard_cpu_limit > 0
            && self.load.cpu_load().map(|it| it >= self.hard_cpu_limit).unwrap_or(false))
            || (self.hard_upload_limit > 0
                && self
                    .load
                    .upload_load()
                    .map(|it| it >= self.hard_upload_limit)
                    .unwrap_or(false))
    }

    /// Bound the ttl by the priority: nobody rides first class on a
    /// third class ticket.
    fn adjust_ttl(ttl: i32, priority: u32) -> i32 {
        let bound = (priority as i64 + 3) * TTL_DECREMENT;
        if ttl > 0 && (ttl as i64) > bound {
            bound as i32
        } else {
            ttl
        }
    }

    /// The admission policy: how much may this query cost us?
    ///
    /// The priority is capped by what the sender's trust actually
    /// covers; an arbitrary number from a malicious peer buys nothing.
    fn evaluate_query(&self, sender: &PeerId, priority: &mut u32) -> Policy {
        let load = match self.load.upload_load() {
            Some(it) => it,
            // Unknown load counts as idle.
            None => 0,
        };

        if load < IDLE_LOAD_THRESHOLD {
            *priority = 0;
            return Policy::ALL;
        }

        // Charge the sender; keep only what was actually collected.
        *priority = (-self.identity.change_trust(sender, -(*priority as i32))) as u32;
        if load < IDLE_LOAD_THRESHOLD + *priority {
            Policy::ALL
        } else if load < 90 + 10 * *priority {
            Policy::ANSWER | Policy::FORWARD
        } else if load < 100 {
            Policy::ANSWER
        } else {
            Policy::EMPTY
        }
    }

    /// A query has arrived from a peer.
    pub fn handle_query(&self, from: &PeerId, bytes: &[u8]) -> Result<(), Error> {
        if self.load_too_high() {
            return Ok(());
        }

        let mut query = match Query::decode(bytes) {
            Ok(it) => it,
            Err(e) => {
                self.stats.protocol_violations.add(1);
                return Err(e.into());
            }
        };

        if query.return_to == self.my_id {
            // A sent to B, B to C without source rewriting, C back to A:
            // the cycle ends here. Well-behaved peers never do this.
            self.stats.protocol_violations.add(1);
            return Ok(());
        }

        self.stats.requests_total.add(1);

        // Decrement the ttl (always). The randomized component makes hop
        // counting harder.
        let decrement =
            2 * TTL_DECREMENT as i32 + rand::rng().random_range(0..TTL_DECREMENT as i32);
        let ttl = query.ttl.wrapping_sub(decrement);
        if query.ttl < 0 && ttl > 0 {
            // Signed underflow; should be very rare.
            self.stats.direct_drops.add(1);
            return Ok(());
        }

        let mut priority = query.priority;
        let policy = self.evaluate_query(from, &mut priority);
        if !policy.any() {
            // The peer is too busy to even look at this.
            self.stats.direct_drops.add(1);
            return Ok(());
        }

        let mut preference = priority as f64;
        if policy.indirects() {
            query.return_to = self.my_id;
        } else {
            // We preserve the original source, so we cannot benefit:
            // kill the priority.
            priority = 0;
        }

        if preference < QUERY_BANDWIDTH_VALUE {
            preference = QUERY_BANDWIDTH_VALUE;
        }

        self.transport.prefer_traffic_from(from, preference);
        query.priority = priority;
        query.ttl = Self::adjust_ttl(ttl, priority);

        let ttl = (query.ttl.max(0)) as i64;
        self.exec_query(Some(from), None, priority, policy, ttl, &query);
        Ok(())
    }

    /// Execute a single query: decide routing, look up local content,
    /// feed the delay loop, and maybe forward.
    ///
    /// Returns whether the query was forwarded and to how many peers.
    fn exec_query(
        &self,
        sender: Option<&PeerId>,
        target: Option<&PeerId>,
        priority: u32,
        policy: Policy,
        ttl: i64,
        query: &Query,
    ) -> (bool, usize) {
        if self.load_too_high() {
            return (false, 0);
        }

        let sender_pid = self.pids.intern_opt(sender);
        let key = *query.primary_key();
        let mut deferred_dequeue = None;
        let mut add_reward = false;
        let routed;
        let mut forward;
        {
            let mut table = self.table.lock();
            let ctx = RouteContext {
                pids: &self.pids,
                stats: &self.stats,
                network_size: self.topology.estimate_network_size(),
            };

            let decided = if sender.is_some() {
                if policy.answers() && (policy.indirects() || self.blockstore.fast_get(&key)) {
                    let decision = table.needs_forwarding(
                        &ctx,
                        &key,
                        query.block_type,
                        ttl,
                        priority,
                        sender_pid,
                    );

                    log::debug!(
                        "executing request for {:?}: routed={} forward={} (case {})",
                        key,
                        decision.routed,
                        decision.forward,
                        decision.case
                    );

                    deferred_dequeue = decision.dequeue;
                    (decision.routed, decision.forward)
                } else {
                    if policy.answers() {
                        self.stats.no_route_policy.add(1);
                    } else {
                        self.stats.no_answer_policy.add(1);
                    }

                    (false, false)
                }
            } else {
                add_reward = true;
                (true, true)
            };

            routed = decided.0;
            forward = decided.1;

            if !policy.forwards() {
                forward = false;
            }

            if routed || forward {
                self.stats.processed.add(1);
            }

            // Local lookup, still under lookup-exclusion: concurrent
            // lookups for the same slot must not race the delay loop.
            if routed && policy.answers() {
                let mut values: Vec<Bytes> = Vec::new();
                self.blockstore
                    .get(query.block_type, priority, &query.keys, &mut |_, payload| {
                        if values.len() > MAX_SEEN_VALUES
                            && rand::rng().random_range(0..values.len()) > 8
                        {
                            // Statistical drop, too many replies to hold.
                            return true;
                        }

                        if values.iter().any(|it| it.as_ref() == payload) {
                            // Duplicate entry in the store.
                            return true;
                        }

                        values.push(Bytes::copy_from_slice(payload));
                        true
                    });

                if !values.is_empty() {
                    // A uniform random permutation; which replies go out
                    // first must not leak store ordering.
                    for i in (1..values.len()).rev() {
                        values.swap(i, rand::rng().random_range(0..=i));
                    }

                    let max = {
                        let load = self.load.download_load().unwrap_or(50).min(100);
                        ((1 + (10 - load / 10)) as usize).min(values.len())
                    };

                    let slot = table.slot_mut(&key);
                    for (i, value) in values.iter().enumerate() {
                        if i == 0 && self.blockstore.put(&key, value, slot.priority).is_err() {
                            log::warn!("local store rejected its own content for {:?}", key);
                            continue;
                        }

                        if i < max
                            && sender.is_some()
                            && self.queue_reply(slot, &key, value)
                        {
                            self.stats.local_results.add(1);
                        }

                        if self
                            .blockstore
                            .is_unique_reply(value, slot.block_type, &key)
                        {
                            // The one and only answer: no need to bother
                            // the network.
                            forward = false;
                        }
                    }
                }
            }
        }

        if add_reward {
            self.shared
                .lock()
                .rewards
                .add(&self.stats, &key, priority);
        }

        if let Some(old) = deferred_dequeue {
            self.shared.lock().queries.dequeue(&old);
        }

        let mut sent = 0;
        if forward {
            sent = self.forward_query(query, target, sender);
        }

        self.pids.change_rc(sender_pid, -1);
        (forward, sent)
    }

    /// Put a locally found reply into the delay loop.
    ///
    /// The delay makes locally cached and remotely fetched replies
    /// indistinguishable by latency. Called with the slot's lock section
    /// held; the in-flight flag guards against a concurrent lookup
    /// queueing the same reply twice.
    fn queue_reply(&self, slot: &mut crate::table::Slot, key: &Key, payload: &[u8]) -> bool {
        if &slot.key != key {
            // The routing table no longer has a query associated with
            // this reply.
            return false;
        }

        if slot.local_lookup_in_flight {
            return false;
        }

        let mut bytes = BytesMut::with_capacity(Reply::frame_size(payload.len()));
        if Reply::encode(key, payload, &mut bytes).is_err() {
            return false;
        }

        slot.local_lookup_in_flight = true;
        let delayed = Delayed {
            fire_at: now_ms() + rand::rng().random_range(0..TTL_DECREMENT),
            seq: self.mixer_seq.fetch_add(1, Ordering::Relaxed),
            bytes: bytes.freeze(),
        };

        self.mixer.queue.lock().push(Reverse(delayed));
        self.mixer.signal.notify_one();
        true
    }

    /// Take a query and hand it to the appropriate number of peers.
    fn forward_query(&self, query: &Query, target: Option<&PeerId>, exclude: Option<&PeerId>) -> usize {
        let bytes = query.to_bytes();
        let now = now_ms();
        let expiration = now + query.ttl as i64;

        let mut shared = self.shared.lock();
        let (slot, noclear) =
            shared
                .queries
                .find_slot(&bytes, expiration, self.bitmap_keep_chance);

        // No slot means everything in the ring outlives this query; it
        // is still sent once, through a throwaway record.
        let mut record = match slot {
            Some(index) => shared.queries.take(index),
            None => Default::default(),
        };

        if !noclear {
            record.clear_bitmap();
        }

        record.expires = expiration;
        record.transmission_count = 0;
        record.msg = Some(StoredQuery {
            bytes: bytes.clone(),
            primary_key: *query.primary_key(),
            return_to: query.return_to,
        });

        if !record.no_target.is_local() {
            self.pids.change_rc(record.no_target, -1);
        }

        record.no_target = match exclude {
            Some(peer) => self.pids.intern(peer),
            None => self.pids.intern(&self.my_id),
        };

        // Ranking pass: prefer peers that historically answered this
        // origin's queries, mix in proximity and plain chance.
        let mut rankings = [0u64; 128];
        {
            let tracks = &shared.tracks;
            let no_target = record.no_target;
            self.transport.for_each_connected(&mut |peer| {
                let id = self.pids.intern(peer);
                let mut ranking = match tracks.response_count(no_target, id) {
                    0 => 0u64,
                    count if count < 0xFFFF => 0x7FFF * count as u64,
                    _ => 0x7FFFFFF,
                };

                let distance = (query.primary_key().distance(peer) >> 10).max(1) as u64;
                // Zero to twenty "response equivalents" for proximity,
                // plus up to two for everyone.
                ranking += rand::rng().random_range(0..1 + 0xFFFF * 10 / (1 + distance));
                ranking += rand::rng().random_range(0..0xFFFF);
                if id == no_target {
                    ranking = 0;
                }

                rankings[bit_index(peer)] = ranking;
                self.pids.change_rc(id, -1);
            });
        }

        // Select up to four peers, weighted sampling without
        // replacement.
        let mut ranking_sum: u64 = rankings.iter().sum();
        for _ in 0..4 {
            if ranking_sum == 0 {
                break;
            }

            let selected = rand::rng().random_range(0..ranking_sum);
            let mut position = 0;
            for (i, it) in rankings.iter_mut().enumerate() {
                position += *it;
                if position > selected {
                    record.set_bit(i);
                    ranking_sum -= *it;
                    *it = 0;
                    break;
                }
            }
        }

        if let Some(peer) = target {
            record.set_bit(bit_index(peer));
        }

        // Send pass: everyone whose bit is set, except the peer we route
        // replies to and the excluded one.
        let mut sent = 0;
        {
            let no_target = record.no_target;
            let record = &record;
            self.transport.for_each_connected(&mut |peer| {
                if *peer == query.return_to {
                    return;
                }

                if self.load_too_high() {
                    return;
                }

                let id = self.pids.intern(peer);
                if id != no_target && record.get_bit(bit_index(peer)) {
                    self.stats.forwards.add(1);
                    self.transport.unicast(
                        peer,
                        &bytes,
                        BASE_QUERY_PRIORITY * query.priority * 2,
                        TTL_DECREMENT,
                    );

                    sent += 1;
                }

                self.pids.change_rc(id, -1);
            });
        }

        match slot {
            Some(index) => shared.queries.put_back(index, record),
            None => {
                // Throwaway record: release its exclusion reference.
                self.pids.change_rc(record.no_target, -1);
            }
        }

        sent
    }

    /// Content has arrived, from a peer or from our own delay loop.
    ///
    /// Forwards it to whoever is waiting, de-duplicating against the
    /// slot's seen set, and settles all accounting: rewards, trust,
    /// hot-path weights, traffic preference.
    pub fn handle_reply(&self, from: Option<&PeerId>, bytes: &[u8]) -> Result<(), Error> {
        let reply = match Reply::decode(bytes) {
            Ok(it) => it,
            Err(e) => {
                self.stats.protocol_violations.add(1);
                return Err(e.into());
            }
        };

        let key = reply.primary_key;
        let content_hash = self.blockstore.reply_hash(reply.payload);

        // FIRST: is the content even valid? Priority zero means
        // "validate only".
        if self.blockstore.put(&key, reply.payload, 0).is_err() {
            log::warn!(
                "received invalid content from {}",
                from.map(|it| it.to_string()).unwrap_or_else(|| "myself".into())
            );

            return Err(Error::InvalidContent);
        }

        // SECOND: have we routed this exact reply before?
        {
            let mut table = self.table.lock();
            let slot = table.slot_mut(&key);
            slot.local_lookup_in_flight = false;
            if slot.seen.contains(&content_hash) {
                self.stats.reply_dups.add(1);
                return Ok(());
            }
        }

        // THIRD: route it to the waiters and account the seen set.
        let host_pid = self.pids.intern_opt(from);
        let mut priority = 0;
        let slot_type;
        let mut waiters = Vec::new();
        {
            let mut table = self.table.lock();
            let ctx = RouteContext {
                pids: &self.pids,
                stats: &self.stats,
                network_size: self.topology.estimate_network_size(),
            };

            let slot = table.slot_mut(&key);
            slot_type = slot.block_type;
            if slot.key == key {
                priority = slot.priority;
                slot.priority = 0;

                // The responder stops being a waiter; this is what makes
                // "a reply reaches a waiter at most once" hold.
                if !host_pid.is_local() {
                    while let Some(position) =
                        slot.destinations.iter().position(|it| *it == host_pid)
                    {
                        slot.destinations.swap_remove(position);
                        self.pids.change_rc(host_pid, -1);
                        self.stats.memory_destinations.add(-1);
                    }
                }

                self.stats.memory_seen.add(1);
                slot.seen.push(content_hash);
                slot.seen_reply_was_unique = if slot.seen.len() == 1 {
                    self.blockstore
                        .is_unique_reply(reply.payload, slot.block_type, &key)
                } else {
                    false
                };

                self.stats.successes.add(1);
                let now = now_ms();
                let deadline = if now < slot.ttl {
                    slot.ttl - now
                } else {
                    TTL_DECREMENT
                };

                for it in &slot.destinations {
                    if let Some(peer) = self.pids.resolve(*it) {
                        log::debug!("routing reply for {:?} to {:?}", key, peer);
                        self.transport.unicast(
                            &peer,
                            bytes,
                            BASE_REPLY_PRIORITY * (slot.priority + 5),
                            deadline,
                        );
                    }
                }

                if slot.seen.len() > MAX_SEEN_VALUES * 2 {
                    // So many distinct replies that tracking them all is
                    // unaffordable; the request is deemed satisfied.
                    retire(slot, &ctx);
                }

                waiters = slot.destinations.clone();
            } else {
                self.stats.reply_drops.add(1);
            }
        }

        // Pending rewards for this key are paid through the store.
        priority += self.shared.lock().rewards.claim(&self.stats, &key);
        if priority > 0 {
            let _ = self.blockstore.put(&key, reply.payload, priority);
        }

        // The unique answer ends the outbound query.
        if self.blockstore.is_unique_reply(reply.payload, slot_type, &key) {
            self.shared.lock().queries.dequeue(&key);
        }

        // Credit the responder. Local replies never touch trust or the
        // hot-path weights.
        if let Some(host) = from {
            self.identity.change_trust(host, priority as i32);
            {
                let mut shared = self.shared.lock();
                let Shared { tracks, .. } = &mut *shared;
                for it in &waiters {
                    tracks.update(&self.pids, &self.stats, *it, host_pid);
                }
            }

            self.transport
                .prefer_traffic_from(host, (priority as f64).max(CONTENT_BANDWIDTH_VALUE));
        }

        self.pids.change_rc(host_pid, -1);
        Ok(())
    }

    /// Start a search on behalf of the local node.
    ///
    /// `expiration` is absolute; the relative ttl is derived and bounded
    /// by the priority. With an anonymity level above zero the query only
    /// goes out when enough cover traffic has been observed.
    pub fn get_start(
        &self,
        target: Option<&PeerId>,
        block_type: u32,
        anonymity: u32,
        keys: &[Key],
        expiration: i64,
        priority: u32,
    ) -> Result<GetOutcome, Error> {
        if keys.is_empty() {
            return Err(Error::Malformed(codec::Error::UnderLength));
        }

        if QUERY_FIXED_SIZE + keys.len() * 64 > MAX_FRAME_SIZE {
            return Err(Error::TooManyKeys);
        }

        if anonymity > 0 {
            let level = anonymity - 1;
            match &self.traffic {
                None => {
                    log::error!(
                        "cover traffic requested but no traffic collaborator present, rejecting request"
                    );

                    return Err(Error::InsufficientCover);
                }
                Some(traffic) if !traffic.has_sufficient_cover(level) => {
                    log::warn!("cannot satisfy desired level of anonymity, ignoring request");
                    return Err(Error::InsufficientCover);
                }
                _ => {}
            }
        }

        let now = now_ms();
        let relative = (expiration - now).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let query = Query {
            block_type,
            priority,
            ttl: Self::adjust_ttl(relative, priority),
            return_to: self.my_id,
            keys: keys.to_vec(),
        };

        let (forward, sent) =
            self.exec_query(None, target, priority, Policy::ALL, expiration - now, &query);

        if forward && sent > 0 {
            // Register interest so the replies coming back for our own
            // query are de-duplicated and credited here.
            let mut table = self.table.lock();
            let ctx = RouteContext {
                pids: &self.pids,
                stats: &self.stats,
                network_size: self.topology.estimate_network_size(),
            };

            table.install_local(&ctx, &keys[0], block_type, expiration - now, priority);
            Ok(GetOutcome::Routed)
        } else {
            Ok(GetOutcome::Local)
        }
    }

    /// Stop sending out queries for a key. Happens automatically at some
    /// point, this just makes it early.
    pub fn get_stop(&self, keys: &[Key]) -> bool {
        match keys.first() {
            Some(key) => self.shared.lock().queries.dequeue(key),
            None => false,
        }
    }

    /// Transmit-fill: the transport has `buf` spare bytes in an outgoing
    /// packet for this peer. Returns how many were written.
    pub fn fill(&self, peer: &PeerId, buf: &mut [u8]) -> usize {
        let receiver = self.pids.intern(peer);
        let written = self.shared.lock().queries.fill(peer, receiver, buf);
        self.pids.change_rc(receiver, -1);
        written
    }

    /// Fit a piece of migrating content into the remaining bytes of an
    /// outgoing packet. Returns the encoded size, or zero if it does not
    /// fit.
    pub fn try_migrate(&self, key: &Key, payload: &[u8], buf: &mut [u8]) -> usize {
        let size = Reply::frame_size(payload.len());
        if size > buf.len() || size > MAX_FRAME_SIZE {
            return 0;
        }

        let mut bytes = BytesMut::with_capacity(size);
        if Reply::encode(key, payload, &mut bytes).is_err() {
            return 0;
        }

        buf[..size].copy_from_slice(&bytes);
        size
    }

    /// Average priority of routing slots that still await their first
    /// reply; a coarse measure of how contended this node is.
    pub fn avg_priority(&self) -> u32 {
        let table = self.table.lock();
        let mut total: u64 = 0;
        let mut active: u64 = 0;
        for slot in table.slots() {
            if !slot.destinations.is_empty() && slot.seen.is_empty() {
                total += slot.priority as u64;
                active += 1;
            }
        }

        if active == 0 { 0 } else { (total / active) as u32 }
    }
}
