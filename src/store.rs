use ahash::AHashMap;
use bytes::Bytes;
use codec::Key;
use parking_lot::RwLock;
use rand::Rng;
use routing::{BlockValue, migration::ContentSource, now_ms};

struct StoredBlock {
    value: BlockValue,
    priority: u32,
}

/// The in-memory key-value datastore.
///
/// Durable, quota-managed storage is a separate concern; this store keeps
/// everything resident and is good enough for a node that treats cached
/// content as disposable.
pub struct MemoryDatastore {
    entries: RwLock<AHashMap<Key, Vec<StoredBlock>>>,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(AHashMap::with_capacity(1024)),
        }
    }
}

impl MemoryDatastore {
    /// Store a block, or bump the priority of an identical one already
    /// present.
    pub fn put(&self, key: &Key, value: BlockValue, priority: u32) {
        let mut entries = self.entries.write();
        let blocks = entries.entry(*key).or_default();
        for it in blocks.iter_mut() {
            if it.value.data == value.data {
                it.priority = it.priority.saturating_add(priority);
                if it.value.expiration < value.expiration {
                    it.value.expiration = value.expiration;
                }

                return;
            }
        }

        blocks.push(StoredBlock { value, priority });
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Walk every live block under a key. The callback returns `false`
    /// to stop.
    pub fn for_each(&self, key: &Key, callback: &mut dyn FnMut(&BlockValue) -> bool) -> usize {
        let entries = self.entries.read();
        let Some(blocks) = entries.get(key) else {
            return 0;
        };

        let mut count = 0;
        for it in blocks {
            count += 1;
            if !callback(&it.value) {
                break;
            }
        }

        count
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentSource for MemoryDatastore {
    fn random_block(&self) -> Option<(Key, BlockValue)> {
        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }

        let nth = rand::rng().random_range(0..entries.len());
        let (key, blocks) = entries.iter().nth(nth)?;
        let block = blocks.get(rand::rng().random_range(0..blocks.len()))?;
        Some((*key, block.value.clone()))
    }

    fn materialize(&self, _: &Key, _: &BlockValue) -> Option<BlockValue> {
        // On-demand encoding exists for disk-indexed stores; an in-memory
        // store never produces such markers.
        None
    }
}

/// A convenience constructor for blocks inserted by local clients.
pub fn block(block_type: u32, anonymity: u32, expiration: i64, data: impl Into<Bytes>) -> BlockValue {
    BlockValue {
        block_type,
        anonymity,
        expiration: if expiration <= 0 { now_ms() + 3_600_000 } else { expiration },
        data: data.into(),
    }
}
