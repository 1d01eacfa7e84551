//! ## GAP routing core
//!
//! The routing engine of an anonymous content distribution overlay.
//! Queries travel outward hop by hop; replies travel back along the exact
//! path the queries took, so no peer other than the originator can tell
//! whether its upstream neighbour is the requester or merely a forwarder.
//!
//! The code falls into two main functionality groups:
//!
//! - keeping track of queries that have been routed, sending replies back
//!   along the path, and deciding which old queries to drop from the
//!   routing table;
//! - deciding when to forward which query to which set of peers,
//!   including tracking from where we receive responses to make an
//!   educated guess ("hot path" routing).
//!
//! Everything a node collaborates with (the block store, the transport,
//! trust, topology, cover traffic, load) is injected through the traits
//! below; the engine itself owns only tables and locks.

pub mod engine;
pub mod lookup;
pub mod manager;
pub mod migration;
pub mod pid;
pub mod query;
pub mod reward;
pub mod stats;
pub mod table;
pub mod track;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use codec::{Key, PeerId};

/// Amount the TTL drops per hop of forwarding, in milliseconds. Also the
/// upper bound of the delay inserted before locally found replies are
/// sent (the mixing loop), and the transmit deadline for forwards.
pub const TTL_DECREMENT: i64 = 5_000;

/// Until which upload load the peer is considered idle and queries are
/// not charged at all.
pub const IDLE_LOAD_THRESHOLD: u32 = 50;

/// How many peers may wait for a reply on one routing slot; crossing the
/// threshold resets the waiting list.
pub const MAX_HOSTS_WAITING: usize = 16;

/// Soft cap on the seen set of one routing slot. Beyond twice this value
/// the slot is retired outright.
pub const MAX_SEEN_VALUES: usize = 32;

/// Bytes in the per-query transmit bitmap; 16 bytes = 128 bit slots.
pub const BITMAP_SIZE: usize = 16;

/// Of how many outbound queries we simultaneously keep track.
pub const QUERY_RECORD_COUNT: usize = 512;

/// Base transport priority of a query, per key.
pub const BASE_QUERY_PRIORITY: u32 = 20;

/// Base transport priority of a reply. Replies are roughly a kilobyte and
/// strongly preferred over queries.
pub const BASE_REPLY_PRIORITY: u32 = 4092;

/// Minimum indirection table size; the configured size must be a power of
/// two at least this large.
pub const MIN_TABLE_SIZE: usize = 1024;

/// Two peers can interlock such that each holds the slot the other needs.
/// With probability 1/TIE_BREAKER_CHANCE a colliding query takes the slot
/// anyway and breaks the cycle.
pub const TIE_BREAKER_CHANCE: u32 = 4;

/// For how many local requests we track pending reward priorities.
pub const MAX_REWARD_TRACKS: usize = 128;

/// Priority used for local datastore probes; local lookups must never
/// starve behind remote traffic.
pub const EXTREME_PRIORITY: u32 = 0xFFFFFF;

/// Bandwidth preference of an effectively zero-priority query.
pub const QUERY_BANDWIDTH_VALUE: f64 = 0.001;

/// Bandwidth preference of zero-priority content. Content is much larger
/// and much more valuable than queries.
pub const CONTENT_BANDWIDTH_VALUE: f64 = 0.8;

/// Migrated content never advertises an expiration further out than this
/// (one month in milliseconds).
pub const MAX_MIGRATION_EXP: i64 = 30 * 24 * 3_600 * 1_000;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as i64)
        .unwrap_or(0)
}

/// What the admission policy allows for one inbound query.
///
/// # Test
///
/// ```
/// use gap_server_routing::Policy;
///
/// let policy = Policy::ANSWER | Policy::FORWARD;
///
/// assert!(policy.answers());
/// assert!(policy.forwards());
/// assert!(!policy.indirects());
/// assert!(!Policy::EMPTY.any());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy(u32);

impl Policy {
    /// Answer from local storage if we have a match.
    pub const ANSWER: Policy = Policy(1);
    /// Forward the query, leaving the source untouched.
    pub const FORWARD: Policy = Policy(2);
    /// Indirect the query: rewrite the source to ourselves and collect
    /// the reward when the reply comes back.
    pub const INDIRECT: Policy = Policy(4);
    pub const EMPTY: Policy = Policy(0);
    pub const ALL: Policy = Policy(7);

    pub fn answers(&self) -> bool {
        self.0 & Self::ANSWER.0 != 0
    }

    pub fn forwards(&self) -> bool {
        self.0 & Self::FORWARD.0 != 0
    }

    pub fn indirects(&self) -> bool {
        self.0 & Self::INDIRECT.0 != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }
}

impl std::ops::BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Policy) -> Policy {
        Policy(self.0 | rhs.0)
    }
}

/// A stored block as the file sharing layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValue {
    pub block_type: u32,
    pub anonymity: u32,
    /// Absolute milliseconds since the unix epoch.
    pub expiration: i64,
    pub data: Bytes,
}

/// The block store contract.
///
/// `put` with priority zero is a "validate only" marker: the store checks
/// the content against the key and reports whether it would accept it.
/// The engine never interprets payloads itself.
pub trait Blockstore: Send + Sync {
    /// Store (or re-prioritise) content. An error signals invalid
    /// content and the reply carrying it is dropped.
    fn put(&self, key: &Key, payload: &[u8], priority: u32) -> Result<(), ()>;

    /// Look content up locally, handing each match to the callback. The
    /// callback returns `false` to stop the iteration.
    fn get(
        &self,
        block_type: u32,
        priority: u32,
        keys: &[Key],
        callback: &mut dyn FnMut(&Key, &[u8]) -> bool,
    ) -> usize;

    /// Cheap bloom-filter probe; must not do IO.
    fn fast_get(&self, key: &Key) -> bool;

    /// Is this payload the one and only possible answer for its type?
    fn is_unique_reply(&self, payload: &[u8], block_type: u32, key: &Key) -> bool;

    /// Content-addressed hash of the payload portion of a reply.
    fn reply_hash(&self, payload: &[u8]) -> Key;
}

/// The transport contract.
///
/// Callbacks handed to `for_each_connected` are invoked serially.
/// `unicast` may be called while engine locks are held and must not
/// block.
pub trait Transport: Send + Sync {
    fn unicast(&self, peer: &PeerId, bytes: &[u8], priority: u32, deadline: i64);

    fn for_each_connected(&self, callback: &mut dyn FnMut(&PeerId));

    /// Ask the scheduler to prefer traffic from this peer.
    #[allow(unused_variables)]
    fn prefer_traffic_from(&self, peer: &PeerId, preference: f64) {}
}

/// Trust accounting. `change_trust` returns the delta actually applied,
/// which may be smaller in magnitude than requested when the peer has
/// little trust left to charge.
pub trait Identity: Send + Sync {
    fn change_trust(&self, peer: &PeerId, delta: i32) -> i32;
}

pub trait Topology: Send + Sync {
    fn estimate_network_size(&self) -> u32;
}

/// Cover traffic probe. An absent implementation means no anonymity
/// level above zero can ever be satisfied.
pub trait Traffic: Send + Sync {
    fn has_sufficient_cover(&self, level: u32) -> bool;
}

/// Load figures in percent; `None` means unknown, which the policy
/// treats as idle.
pub trait LoadMonitor: Send + Sync {
    fn cpu_load(&self) -> Option<u32>;
    fn upload_load(&self) -> Option<u32>;
    fn download_load(&self) -> Option<u32>;
}
