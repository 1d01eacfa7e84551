use crate::store::MemoryDatastore;

use std::{collections::VecDeque, sync::Arc};

use ahash::AHashMap;
use bytes::BytesMut;
use codec::{
    BLOCK_ANY, BLOCK_DATA, Key, PeerId,
    wrapper::{Wrapper, fold_hash},
};
use parking_lot::Mutex;
use rand::Rng;
use routing::{
    BlockValue, Blockstore, Identity, LoadMonitor, MAX_MIGRATION_EXP, Traffic,
    manager::{QueryManager, ResponseSink},
    now_ms,
};

/// How long an observed frame counts as cover traffic.
const TRAFFIC_WINDOW: i64 = 300_000;

/// Observed inbound traffic, the basis of every cover-traffic decision.
///
/// The receive path records each query frame here; a request that demands
/// anonymity is only satisfied when enough foreign traffic exists for our
/// own to hide in.
#[derive(Default)]
pub struct TrafficMonitor {
    window: Mutex<VecDeque<(i64, PeerId)>>,
}

impl TrafficMonitor {
    pub fn record(&self, peer: &PeerId) {
        let now = now_ms();
        let mut window = self.window.lock();
        window.push_back((now, *peer));
        while window
            .front()
            .map(|(at, _)| *at < now - TRAFFIC_WINDOW)
            .unwrap_or(false)
        {
            window.pop_front();
        }
    }
}

impl Traffic for TrafficMonitor {
    /// Levels above 1000 additionally demand `level / 1000` distinct
    /// peers; the remainder is the message count requirement.
    fn has_sufficient_cover(&self, level: u32) -> bool {
        if level == 0 {
            return true;
        }

        let now = now_ms();
        let window = self.window.lock();
        let recent = window.iter().filter(|(at, _)| *at >= now - TRAFFIC_WINDOW);

        if level > 1000 {
            let mut peers: Vec<&PeerId> = Vec::new();
            let mut count = 0u32;
            for (_, peer) in recent {
                count += 1;
                if !peers.contains(&peer) {
                    peers.push(peer);
                }
            }

            peers.len() as u32 >= level / 1000 && count >= level % 1000
        } else {
            recent.count() as u32 >= level
        }
    }
}

/// In-memory trust ledger.
///
/// Trust never goes negative: charging a peer collects at most what it
/// has, and the applied delta is reported back so the routing policy can
/// cap priorities at what was actually paid.
#[derive(Default)]
pub struct TrustTable {
    trusts: Mutex<AHashMap<PeerId, u32>>,
}

impl Identity for TrustTable {
    fn change_trust(&self, peer: &PeerId, delta: i32) -> i32 {
        let mut trusts = self.trusts.lock();
        let current = trusts.entry(*peer).or_insert(0);
        let applied = if delta < 0 {
            -((*current).min(delta.unsigned_abs()) as i32)
        } else {
            delta
        };

        *current = current.checked_add_signed(applied).unwrap_or(0);
        applied
    }
}

impl TrustTable {
    pub fn get(&self, peer: &PeerId) -> u32 {
        self.trusts.lock().get(peer).copied().unwrap_or(0)
    }
}

/// Load is a transport concern this node does not measure; unknown load
/// reads as idle everywhere.
pub struct IdleLoad;

impl LoadMonitor for IdleLoad {
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

/// The file-sharing layer as the routing engine sees it.
///
/// Implements the block store contract over the in-memory datastore:
/// validates content against its key, bounds expirations, refuses to
/// surrender anonymity-requiring blocks without cover, and forwards every
/// accepted value to the query manager so waiting clients hear about it.
pub struct Observer<T> {
    store: Arc<MemoryDatastore>,
    manager: Arc<QueryManager<T>>,
    traffic: Arc<TrafficMonitor>,
}

impl<T> Observer<T>
where
    T: ResponseSink,
{
    pub fn new(
        store: Arc<MemoryDatastore>,
        manager: Arc<QueryManager<T>>,
        traffic: Arc<TrafficMonitor>,
    ) -> Self {
        Self {
            store,
            manager,
            traffic,
        }
    }

    /// Validate and store a block handed in by a local client.
    pub fn insert(&self, key: &Key, value: BlockValue, priority: u32) -> Result<(), ()> {
        if value.block_type == BLOCK_DATA && &fold_hash(&value.data) != key {
            return Err(());
        }

        self.store.put(key, value, priority);
        Ok(())
    }

}

/// Unpack a reply payload into a stored-block shape, bounding the
/// advertised expiration.
pub fn payload_to_value(payload: &[u8]) -> Option<BlockValue> {
    let wrapper = Wrapper::decode(payload).ok()?;
    let now = now_ms();
    let mut expiration = wrapper.expiration;
    if expiration > now {
        expiration = now + (expiration - now) % MAX_MIGRATION_EXP;
    }

    Some(BlockValue {
        block_type: wrapper.block_type,
        anonymity: 0,
        expiration,
        data: bytes::Bytes::copy_from_slice(wrapper.data),
    })
}

impl<T> Blockstore for Observer<T>
where
    T: ResponseSink + 'static,
{
    fn put(&self, key: &Key, payload: &[u8], priority: u32) -> Result<(), ()> {
        let value = payload_to_value(payload).ok_or(())?;

        // Data blocks are content addressed; anything else carries its
        // own validation with it (out of our hands here).
        if value.block_type == BLOCK_DATA && &fold_hash(&value.data) != key {
            return Err(());
        }

        if value.expiration < now_ms() {
            // Expired content is not stored, except that pure data one of
            // our clients asked for is still delivered.
            if value.block_type == BLOCK_DATA {
                self.manager.process_response(key, &value);
            }

            return Ok(());
        }

        self.manager.process_response(key, &value);
        self.store.put(key, value, priority);
        Ok(())
    }

    fn get(
        &self,
        block_type: u32,
        _priority: u32,
        keys: &[Key],
        callback: &mut dyn FnMut(&Key, &[u8]) -> bool,
    ) -> usize {
        let Some(key) = keys.first() else {
            return 0;
        };

        let now = now_ms();
        let mut count = 0;
        self.store.for_each(key, &mut |value| {
            if value.expiration <= now && value.block_type != BLOCK_DATA {
                return true;
            }

            if block_type != BLOCK_ANY && value.block_type != block_type {
                return true;
            }

            // Never hand out data that requires anonymity we cannot
            // provide.
            if !self.traffic.has_sufficient_cover(value.anonymity) {
                log::debug!("withholding block for {:?}, insufficient cover traffic", key);
                return true;
            }

            // Advertised expiration is normalized and randomized so the
            // true value cannot be traced across hops.
            let mut expiration = value.expiration;
            if expiration > now {
                let mut remaining = (expiration - now) % MAX_MIGRATION_EXP;
                if remaining > 0 {
                    remaining = rand::rng().random_range(0..remaining);
                }

                expiration = now + remaining;
            }

            let mut payload = BytesMut::with_capacity(12 + value.data.len());
            Wrapper {
                block_type: value.block_type,
                expiration,
                data: &value.data,
            }
            .encode(&mut payload);

            count += 1;
            callback(key, &payload)
        });

        count
    }

    fn fast_get(&self, key: &Key) -> bool {
        self.store.contains(key)
    }

    fn is_unique_reply(&self, payload: &[u8], block_type: u32, key: &Key) -> bool {
        let Ok(wrapper) = Wrapper::decode(payload) else {
            return false;
        };

        if block_type != BLOCK_ANY && wrapper.block_type != block_type {
            return false;
        }

        // Only content-addressed data has a one-and-only answer.
        wrapper.block_type == BLOCK_DATA && &wrapper.content_hash() == key
    }

    fn reply_hash(&self, payload: &[u8]) -> Key {
        match Wrapper::decode(payload) {
            Ok(wrapper) => wrapper.content_hash(),
            Err(_) => fold_hash(payload),
        }
    }
}
