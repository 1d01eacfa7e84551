use std::sync::atomic::{AtomicI64, Ordering};

/// A single signed counter.
///
/// # Test
///
/// ```
/// use gap_server_routing::stats::Count;
///
/// let count = Count::default();
///
/// count.add(2);
/// assert_eq!(count.get(), 2);
///
/// count.add(-1);
/// assert_eq!(count.get(), 1);
/// ```
#[derive(Default)]
pub struct Count(AtomicI64);

impl Count {
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The engine's counter surface.
///
/// Counters are plain atomics; reading them never takes a lock, and the
/// routing paths only pay a relaxed add. Several of the protocol's
/// observable behaviours (duplicate drops, collisions, loop detection)
/// are distinguishable only through these.
#[derive(Default)]
pub struct EngineStats {
    /// Requests received in total.
    pub requests_total: Count,
    /// Requests dropped before evaluation (load, policy, ttl underflow).
    pub direct_drops: Count,
    /// Requests the policy refused to route.
    pub no_route_policy: Count,
    /// Requests the policy refused to answer.
    pub no_answer_policy: Count,
    /// Requests that attempted a routing table add.
    pub processed: Count,
    /// Local datastore results queued for delayed delivery.
    pub local_results: Count,
    /// Replies actually routed back to a waiter.
    pub successes: Count,
    /// Requests dropped because their slot was busy.
    pub collisions: Count,
    /// Query transmissions to individual peers.
    pub forwards: Count,
    /// Requests already pending in the routing table.
    pub request_duplicates: Count,
    /// Pending requests that were re-issued anyway.
    pub request_repeat: Count,
    /// Cumulative ttl gain of re-issued requests.
    pub request_repeat_dttl: Count,
    /// Replies dropped as already seen.
    pub reply_dups: Count,
    /// Replies dropped with no matching route.
    pub reply_drops: Count,
    /// Routing slots currently in use.
    pub slots_used: Count,
    /// Seen hashes currently tracked.
    pub memory_seen: Count,
    /// Waiter entries currently tracked.
    pub memory_destinations: Count,
    /// Reward priority currently pending.
    pub pending_rewards: Count,
    /// Response weights currently tracked for hot-path routing.
    pub response_count: Count,
    /// Frames that violated the protocol (impossible sizes, routing
    /// loops).
    pub protocol_violations: Count,
    /// Client queries currently tracked.
    pub queries_tracked: Count,
    /// Replies passed to local clients.
    pub replies_to_clients: Count,
    /// Blocks pushed to other peers.
    pub blocks_migrated: Count,
    /// Blocks fetched from the datastore for migration.
    pub migration_fetches: Count,
    /// On-demand blocks materialised for migration.
    pub on_demand_migrations: Count,
}
