use crate::{
    BlockValue, MAX_MIGRATION_EXP, Traffic, engine::Engine, now_ms, query::bit_index,
    stats::EngineStats,
};

use std::sync::Arc;

use bytes::BytesMut;
use codec::{
    BLOCK_ON_DEMAND, PeerId,
    message::REPLY_FIXED_SIZE,
    wrapper::{WRAPPER_FIXED_SIZE, Wrapper},
};
use parking_lot::Mutex;
use rand::Rng;

/// To how many peers the same block may migrate before it is retired.
/// Higher values mean less IO but quickly less effective migration:
/// everyone ends up with the same content.
pub const MAX_RECEIVERS: usize = 16;

/// How many blocks are cached for migration at a time. Each is up to
/// roughly 32k, so 64 records use about 2 MB.
pub const MAX_RECORDS: usize = 64;

/// How often the datastore is polled for fresh content, at most.
pub const MAX_POLL_FREQUENCY: i64 = 250;

/// Where migration content comes from.
pub trait ContentSource: Send + Sync {
    /// A random block from the local store.
    fn random_block(&self) -> Option<(codec::Key, BlockValue)>;

    /// Turn an on-demand marker into transmittable content.
    fn materialize(&self, key: &codec::Key, value: &BlockValue) -> Option<BlockValue>;
}

#[derive(Default)]
struct MigrationRecord {
    key: codec::Key,
    value: Option<BlockValue>,
    receivers: [usize; MAX_RECEIVERS],
    sent_count: usize,
}

#[derive(Default)]
struct State {
    records: Vec<MigrationRecord>,
    discard_time: i64,
}

/// Fills spare bandwidth with cached or random content.
///
/// The transport calls `fill` whenever an outgoing datagram has bytes to
/// spare; content migrating through idle bandwidth is what gives every
/// peer plausible possession of blocks it never asked for.
pub struct MigrationPusher {
    state: Mutex<State>,
    source: Arc<dyn ContentSource>,
    traffic: Option<Arc<dyn Traffic>>,
    stats: Arc<EngineStats>,
}

impl MigrationPusher {
    pub fn new(
        source: Arc<dyn ContentSource>,
        traffic: Option<Arc<dyn Traffic>>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                records: (0..MAX_RECORDS).map(|_| MigrationRecord::default()).collect(),
                discard_time: 0,
            }),
            source,
            traffic,
            stats,
        }
    }

    /// Push one block toward `receiver` into the remaining `buf` bytes.
    /// Returns how many bytes were written.
    pub fn fill(&self, engine: &Engine, receiver: &PeerId, buf: &mut [u8]) -> usize {
        let index = bit_index(receiver);
        let now = now_ms();
        let mut state = self.state.lock();

        let mut entry = None;
        let mut discard_entry = None;
        let mut discard_match = -1i64;
        for i in 0..MAX_RECORDS {
            if state.records[i].value.is_none() {
                if state.discard_time >= now - MAX_POLL_FREQUENCY {
                    continue;
                }

                state.discard_time = now;
                match self.source.random_block() {
                    Some((key, value)) => {
                        self.stats.migration_fetches.add(1);
                        state.records[i].key = key;
                        state.records[i].value = Some(value);
                        state.records[i].sent_count = 0;
                    }
                    None => continue,
                }
            }

            let record = &state.records[i];
            let value = record.value.as_ref().unwrap();

            // A record counts as "served" for this receiver when the
            // receiver already got it, or when it cannot fit anyway.
            let fits = wire_size(value) <= buf.len();
            let served =
                !fits || record.receivers[..record.sent_count].contains(&index);

            if !served {
                // The walk order is fixed, so the first unserved block
                // wins; lower indices are favoured over actual key
                // proximity.
                entry = Some(i);
                break;
            }

            if record.sent_count as i64 > discard_match {
                discard_match = record.sent_count as i64;
                discard_entry = Some(i);
            }
        }

        // Nothing unserved: recycle the most-served block, at most once
        // per poll interval.
        if entry.is_none() {
            if let Some(i) = discard_entry {
                if discard_match > (MAX_RECEIVERS / 2) as i64
                    && state.discard_time < now - MAX_POLL_FREQUENCY
                {
                    state.discard_time = now;
                    state.records[i].value = None;
                    state.records[i].sent_count = 0;
                    match self.source.random_block() {
                        Some((key, value)) => {
                            self.stats.migration_fetches.add(1);
                            state.records[i].key = key;
                            state.records[i].value = Some(value);
                        }
                        None => discard_entry = None,
                    }
                }
            }

            entry = discard_entry;
        }

        let Some(entry) = entry else {
            return 0;
        };

        let key = state.records[entry].key;
        let Some(mut value) = state.records[entry].value.clone() else {
            return 0;
        };

        if wire_size(&value) > buf.len() {
            return 0;
        }

        // On-demand markers hold no transmittable bytes yet.
        if value.block_type == BLOCK_ON_DEMAND {
            match self.source.materialize(&key, &value) {
                Some(it) => {
                    self.stats.on_demand_migrations.add(1);
                    state.records[entry].value = Some(it.clone());
                    value = it;
                }
                None => {
                    state.records[entry].value = None;
                    return 0;
                }
            }

            if wire_size(&value) > buf.len() {
                return 0;
            }
        }

        // Normalise the advertised expiration and randomize it below the
        // bound; the true expiration must not be traceable across hops.
        let mut expiration = value.expiration;
        if expiration > now {
            let mut remaining = (expiration - now) % MAX_MIGRATION_EXP;
            if remaining > 0 {
                remaining = rand::rng().random_range(0..remaining);
            }

            expiration = now + remaining;
        }

        let anonymity = value.anonymity.max(1);
        if !self.cover_ok(anonymity) {
            return 0;
        }

        let mut payload = BytesMut::with_capacity(WRAPPER_FIXED_SIZE + value.data.len());
        Wrapper {
            block_type: value.block_type,
            expiration,
            data: &value.data,
        }
        .encode(&mut payload);

        let written = engine.try_migrate(&key, &payload, buf);
        if written > 0 {
            let record = &mut state.records[entry];
            if record.sent_count == MAX_RECEIVERS {
                record.value = None;
                record.sent_count = 0;
            } else {
                record.receivers[record.sent_count] = index;
                record.sent_count += 1;
            }

            self.stats.blocks_migrated.add(1);
        }

        written
    }

    fn cover_ok(&self, level: u32) -> bool {
        if level == 0 {
            return true;
        }

        match &self.traffic {
            Some(traffic) => traffic.has_sufficient_cover(level),
            None => false,
        }
    }
}

fn wire_size(value: &BlockValue) -> usize {
    REPLY_FIXED_SIZE + WRAPPER_FIXED_SIZE + value.data.len()
}
