use crate::{BlockValue, now_ms, stats::EngineStats};

use std::sync::Arc;

use codec::{BLOCK_ANY, BLOCK_DATA, Key};
use parking_lot::Mutex;

/// Opaque handle of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Where matching replies are delivered. The sink is called with the
/// query-manager lock held and must not block.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, client: ClientId, key: &Key, value: &BlockValue);
}

struct TrackRecord {
    key: Key,
    block_type: u32,
    client: ClientId,
}

/// Tracks which client is waiting for answers to which query.
///
/// The table is a plain array walked in full for every response; n is
/// bounded by the number of concurrently outstanding client searches.
/// Storage grows by doubling and shrinks by halving once it is no more
/// than a quarter full, never below 64 entries.
///
/// # Test
///
/// ```
/// use std::sync::Arc;
/// use gap_server_routing::manager::{ClientId, QueryManager, ResponseSink};
/// use gap_server_routing::{now_ms, stats::EngineStats, BlockValue};
/// use codec::{Key, BLOCK_DATA};
/// use parking_lot::Mutex;
///
/// #[derive(Default)]
/// struct Sink(Mutex<Vec<ClientId>>);
///
/// impl ResponseSink for Sink {
///     fn deliver(&self, client: ClientId, _: &Key, _: &BlockValue) {
///         self.0.lock().push(client);
///     }
/// }
///
/// let stats = Arc::new(EngineStats::default());
/// let manager = QueryManager::new(Sink::default(), stats.clone());
/// let key: Key = [1u8; 64].into();
///
/// manager.track(&key, BLOCK_DATA, ClientId(7));
/// assert_eq!(stats.queries_tracked.get(), 1);
///
/// manager.process_response(&key, &BlockValue {
///     block_type: BLOCK_DATA,
///     anonymity: 0,
///     expiration: now_ms() + 10_000,
///     data: b"hello".as_ref().into(),
/// });
///
/// assert_eq!(manager.sink().0.lock().as_slice(), &[ClientId(7)]);
///
/// manager.untrack(&key, ClientId(7));
/// assert_eq!(stats.queries_tracked.get(), 0);
/// ```
pub struct QueryManager<T> {
    records: Mutex<Vec<TrackRecord>>,
    sink: T,
    stats: Arc<EngineStats>,
}

impl<T> QueryManager<T>
where
    T: ResponseSink,
{
    pub fn new(sink: T, stats: Arc<EngineStats>) -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(64)),
            sink,
            stats,
        }
    }

    pub fn sink(&self) -> &T {
        &self.sink
    }

    /// Keep track of a query; matching responses go to the client.
    pub fn track(&self, key: &Key, block_type: u32, client: ClientId) {
        self.records.lock().push(TrackRecord {
            key: *key,
            block_type,
            client,
        });

        self.stats.queries_tracked.add(1);
    }

    /// Stop tracking one (key, client) pair.
    pub fn untrack(&self, key: &Key, client: ClientId) {
        let mut records = self.records.lock();
        if let Some(position) = records
            .iter()
            .rposition(|it| it.client == client && &it.key == key)
        {
            records.swap_remove(position);
            self.stats.queries_tracked.add(-1);
            shrink(&mut records);
        }
    }

    /// A client disconnected; drop everything it was waiting for.
    pub fn client_exit(&self, client: ClientId) {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|it| it.client != client);
        self.stats.queries_tracked.add(records.len() as i64 - before as i64);
        shrink(&mut records);
    }

    /// A response is available; hand it to every client whose tracked
    /// (key, type) matches. Type `BLOCK_ANY` matches everything.
    ///
    /// Expired responses are silently dropped here, except data blocks:
    /// a client that asked for data gets it regardless.
    pub fn process_response(&self, key: &Key, value: &BlockValue) {
        if value.expiration < now_ms() && value.block_type != BLOCK_DATA {
            return;
        }

        let records = self.records.lock();
        for it in records.iter() {
            if &it.key == key
                && (it.block_type == BLOCK_ANY || it.block_type == value.block_type)
            {
                self.stats.replies_to_clients.add(1);
                self.sink.deliver(it.client, key, value);
            }
        }
    }
}

fn shrink(records: &mut Vec<TrackRecord>) {
    if records.capacity() > 64 && records.capacity() >= 4 * records.len() {
        records.shrink_to(records.capacity() / 2);
    }
}
