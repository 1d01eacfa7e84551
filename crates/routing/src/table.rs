use crate::{
    MAX_HOSTS_WAITING, MAX_SEEN_VALUES, TIE_BREAKER_CHANCE, TTL_DECREMENT, now_ms,
    pid::{Pid, PidTable},
    stats::EngineStats,
};

use codec::Key;
use rand::Rng;

/// One row of the indirection table: what we are waiting for, who is
/// waiting with us, and how long we keep looking.
///
/// A slot is in use iff `ttl != 0`; clearing one must reset the waiting
/// list, the seen set, the priority, the type and the ttl together.
#[derive(Default)]
pub struct Slot {
    pub key: Key,
    pub block_type: u32,
    /// The trust-adjusted worth of an answer, NOT the inbound priority.
    pub priority: u32,
    /// Absolute expiration in milliseconds; zero marks a free slot.
    pub ttl: i64,
    /// Content hashes of replies already forwarded through this slot.
    pub seen: Vec<Key>,
    /// Meaningful only while `seen.len() == 1`.
    pub seen_reply_was_unique: bool,
    /// Peers waiting for an answer to this query.
    pub destinations: Vec<Pid>,
    /// A locally found response is sitting in the delay loop; do not look
    /// the content up again before it leaves.
    pub local_lookup_in_flight: bool,
}

impl Slot {
    pub fn in_use(&self) -> bool {
        self.ttl != 0
    }
}

/// What the admission function decided for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Replies can be routed back through the slot.
    pub routed: bool,
    /// The query should go out to other peers.
    pub forward: bool,
    /// Which rule fired, for diagnostics and tests.
    pub case: u32,
    /// An outbound query that must be cancelled because its slot was
    /// taken over. The caller performs the cancellation after releasing
    /// the table lock.
    pub dequeue: Option<Key>,
}

impl Decision {
    fn new(routed: bool, forward: bool, case: u32, dequeue: Option<Key>) -> Self {
        Self {
            routed,
            forward,
            case,
            dequeue,
        }
    }
}

/// Shared context for admission decisions.
pub struct RouteContext<'a> {
    pub pids: &'a PidTable,
    pub stats: &'a EngineStats,
    pub network_size: u32,
}

enum Mode {
    Replace,
    Grow,
}

fn reset_seen(slot: &mut Slot, stats: &EngineStats) {
    stats.memory_seen.add(-(slot.seen.len() as i64));
    slot.seen.clear();
}

fn reset_destinations(slot: &mut Slot, ctx: &RouteContext) {
    ctx.pids.decrement_rcs(&slot.destinations);
    ctx.stats
        .memory_destinations
        .add(-(slot.destinations.len() as i64));
    slot.destinations.clear();
}

/// Retire a slot entirely; the request it carried is deemed satisfied.
pub fn retire(slot: &mut Slot, ctx: &RouteContext) {
    reset_destinations(slot, ctx);
    reset_seen(slot, ctx.stats);
    slot.seen_reply_was_unique = false;
    slot.priority = 0;
    slot.block_type = 0;
    slot.ttl = 0;
    ctx.stats.slots_used.add(-1);
}

/// Install a query into a slot, either replacing its content or growing
/// the waiting list of the query already there.
///
/// Returns an error when the sender is already waiting; the caller treats
/// that as success, it just means the request is already in flight for
/// this waiter.
fn add_to_slot(
    slot: &mut Slot,
    mode: Mode,
    ctx: &RouteContext,
    key: &Key,
    block_type: u32,
    ttl: i64,
    priority: u32,
    sender: Pid,
    dequeue: &mut Option<Key>,
) -> Result<(), ()> {
    debug_assert!(!sender.is_local(), "local clients never enter the routing table");
    let now = now_ms();
    if !slot.in_use() {
        ctx.stats.slots_used.add(1);
    }

    match mode {
        Mode::Replace => {
            reset_seen(slot, ctx.stats);
            slot.seen_reply_was_unique = false;
            if &slot.key == key {
                slot.ttl = now + ttl;
                slot.priority += priority;
                if slot.destinations.contains(&sender) {
                    return Err(());
                }

                if slot.destinations.len() >= MAX_HOSTS_WAITING {
                    reset_destinations(slot, ctx);
                }
            } else {
                slot.local_lookup_in_flight = false;
                // Different request: flush its pending outbound queries.
                *dequeue = Some(slot.key);
                slot.key = *key;
                slot.block_type = block_type;
                reset_destinations(slot, ctx);
                slot.ttl = now + ttl;
                slot.priority = priority;
            }
        }
        Mode::Grow => {
            debug_assert_eq!(&slot.key, key);
            if slot.ttl < now + ttl {
                slot.ttl = now + ttl;
            }

            slot.priority += priority;
            if slot.destinations.contains(&sender) {
                return Err(());
            }
        }
    }

    ctx.stats.memory_destinations.add(1);
    slot.destinations.push(sender);
    ctx.pids.change_rc(sender, 1);

    // A new listener must be able to receive replies the previous
    // waiters already saw: flush the seen list.
    reset_seen(slot, ctx.stats);
    slot.seen_reply_was_unique = false;
    Ok(())
}

/// The hash-addressed table of routing slots.
pub struct IndirectionTable {
    slots: Vec<Slot>,
    mask: usize,
    selector: u32,
}

impl IndirectionTable {
    /// `size` must be a power of two. The selector randomizes index
    /// construction per process so remote peers cannot aim queries at
    /// chosen slots.
    pub fn new(size: usize, selector: u32) -> Self {
        assert!(size.is_power_of_two());
        Self {
            slots: (0..size).map(|_| Slot::default()).collect(),
            mask: size - 1,
            selector,
        }
    }

    pub fn index(&self, key: &Key) -> usize {
        (key.first_word() ^ (key.second_word() / (1 + self.selector))) as usize & self.mask
    }

    pub fn slot_mut(&mut self, key: &Key) -> &mut Slot {
        let index = self.index(key);
        &mut self.slots[index]
    }

    pub fn slot(&self, key: &Key) -> &Slot {
        &self.slots[self.index(key)]
    }

    /// The routing admission function: should this query be routed, and
    /// should it be forwarded?
    ///
    /// This heuristic attempts to route queries without creating cycles,
    /// without forwarding a query and then dropping its slot before the
    /// response returns, and without ever blocking a genuinely new reply.
    /// The rules fire in order; the first match wins.
    pub fn needs_forwarding(
        &mut self,
        ctx: &RouteContext,
        key: &Key,
        block_type: u32,
        ttl: i64,
        priority: u32,
        sender: Pid,
    ) -> Decision {
        let now = now_ms();
        let slot = {
            let index = self.index(key);
            &mut self.slots[index]
        };

        let equal = &slot.key == key;
        if equal {
            ctx.stats.request_duplicates.add(1);
        }

        let new_ttl = now + ttl;
        let mut dequeue = None;

        // Dead slot: long expired, and the query is not hopeless.
        if slot.ttl < now && slot.ttl < now - 10 * TTL_DECREMENT && ttl >= -5 * TTL_DECREMENT {
            let _ = add_to_slot(
                slot,
                Mode::Replace,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(true, true, 21, dequeue);
        }

        // The ttl is "expired" but exactly this query is pending: route
        // replies to the sender too, but do NOT forward again. No local
        // lookup either: the seen list is not reset, so anything we would
        // find is blocked from being sent anyway.
        if ttl < 0 && equal {
            let _ = add_to_slot(
                slot,
                Mode::Grow,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(false, false, 0, dequeue);
        }

        // Expired, and significantly longer expired than the new query
        // will last: start using the slot, killing the old seen list.
        if slot.ttl < new_ttl
            && slot.ttl + TTL_DECREMENT * (ctx.network_size as i64) < new_ttl
            && slot.ttl + 10 * TTL_DECREMENT < new_ttl
            && slot.ttl < now
        {
            reset_seen(slot, ctx.stats);
            slot.seen_reply_was_unique = false;
            if equal && slot.local_lookup_in_flight {
                let _ = add_to_slot(
                    slot,
                    Mode::Grow,
                    ctx,
                    key,
                    block_type,
                    ttl,
                    priority,
                    sender,
                    &mut dequeue,
                );

                return Decision::new(false, false, 1, dequeue);
            }

            if equal {
                ctx.stats.request_repeat.add(1);
                if slot.ttl != 0 {
                    ctx.stats.request_repeat_dttl.add(new_ttl - slot.ttl);
                }
            }

            let _ = add_to_slot(
                slot,
                Mode::Replace,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(true, true, 2, dequeue);
        }

        if equal {
            if slot.seen.is_empty() {
                if slot.ttl < new_ttl && slot.ttl + TTL_DECREMENT < new_ttl {
                    // The new ttl is SIGNIFICANTLY longer: query again,
                    // unless a local lookup is already in flight.
                    if slot.local_lookup_in_flight {
                        let _ = add_to_slot(
                            slot,
                            Mode::Replace,
                            ctx,
                            key,
                            block_type,
                            ttl,
                            priority,
                            sender,
                            &mut dequeue,
                        );

                        return Decision::new(false, false, 3, dequeue);
                    }

                    ctx.stats.request_repeat.add(1);
                    if slot.ttl != 0 {
                        ctx.stats.request_repeat_dttl.add(new_ttl - slot.ttl);
                    }

                    let _ = add_to_slot(
                        slot,
                        Mode::Replace,
                        ctx,
                        key,
                        block_type,
                        ttl,
                        priority,
                        sender,
                        &mut dequeue,
                    );

                    return Decision::new(true, true, 4, dequeue);
                }

                // New ttl is lower: just wait for the reply that may
                // still come back.
                return match add_to_slot(
                    slot,
                    Mode::Grow,
                    ctx,
                    key,
                    block_type,
                    ttl,
                    priority,
                    sender,
                    &mut dequeue,
                ) {
                    Ok(()) if slot.local_lookup_in_flight => Decision::new(false, false, 5, dequeue),
                    Ok(()) => Decision::new(true, false, 6, dequeue),
                    // The same query with a higher ttl has already been
                    // processed for this very sender; not again.
                    Err(()) => Decision::new(false, false, 7, dequeue),
                };
            }

            if slot.seen_reply_was_unique {
                // The answer is effectively known.
                if slot.ttl < new_ttl {
                    reset_seen(slot, ctx.stats);
                    slot.seen_reply_was_unique = false;
                    if slot.local_lookup_in_flight {
                        let _ = add_to_slot(
                            slot,
                            Mode::Replace,
                            ctx,
                            key,
                            block_type,
                            ttl,
                            priority,
                            sender,
                            &mut dequeue,
                        );

                        return Decision::new(false, false, 8, dequeue);
                    }

                    // Forward only if the gain is significant.
                    let forward = slot.ttl + TTL_DECREMENT < new_ttl;
                    if forward {
                        ctx.stats.request_repeat.add(1);
                        if slot.ttl != 0 {
                            ctx.stats.request_repeat_dttl.add(new_ttl - slot.ttl);
                        }
                    }

                    let _ = add_to_slot(
                        slot,
                        Mode::Replace,
                        ctx,
                        key,
                        block_type,
                        ttl,
                        priority,
                        sender,
                        &mut dequeue,
                    );

                    return Decision::new(true, forward, 9, dequeue);
                }

                return match add_to_slot(
                    slot,
                    Mode::Grow,
                    ctx,
                    key,
                    block_type,
                    ttl,
                    priority,
                    sender,
                    &mut dequeue,
                ) {
                    Ok(()) if slot.local_lookup_in_flight => {
                        Decision::new(false, false, 10, dequeue)
                    }
                    Ok(()) => Decision::new(true, false, 11, dequeue),
                    Err(()) => Decision::new(false, false, 12, dequeue),
                };
            }

            // A pending query that can have multiple replies. Never
            // re-issue, just forward the answers that arrive from now on
            // to the additional receiver.
            let is_ttl_higher = slot.ttl >= new_ttl;
            return match add_to_slot(
                slot,
                Mode::Grow,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            ) {
                Ok(()) => Decision::new(true, false, 13, dequeue),
                Err(()) => Decision::new(is_ttl_higher, false, 14, dequeue),
            };
        }

        // A different query holds the slot, but it has already received
        // its unique response: the request is satisfied completely, throw
        // it out early.
        if slot.ttl + TTL_DECREMENT < new_ttl && slot.ttl < now && slot.seen_reply_was_unique {
            let _ = add_to_slot(
                slot,
                Mode::Replace,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(true, true, 15, dequeue);
        }

        // Another still-valid query is using the slot. From here on we
        // need a really good reason to discard it.
        if ttl < 0 {
            ctx.stats.collisions.add(1);
            return Decision::new(false, false, 16, dequeue);
        }

        // A low ttl with a high priority should win, so cross-multiply.
        // The factor of 10 damps churn: without it query A could replace
        // query B could replace query A so quickly that no response to
        // either ever makes it through.
        if (slot.ttl - now) * priority as i64 > 10 * (ttl * slot.priority as i64) {
            let _ = add_to_slot(
                slot,
                Mode::Replace,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(true, true, 17, dequeue);
        }

        // Two peers can each hold the slot the other needs, blocked
        // exactly until the other gives in. This is the probability that
        // one will.
        if rand::rng().random_range(0..TIE_BREAKER_CHANCE) == 0 {
            let _ = add_to_slot(
                slot,
                Mode::Replace,
                ctx,
                key,
                block_type,
                ttl,
                priority,
                sender,
                &mut dequeue,
            );

            return Decision::new(true, true, 20, dequeue);
        }

        // The slot is busy with something else; we cannot even add
        // ourselves to the reply set.
        ctx.stats.collisions.add(1);
        Decision::new(false, false, 18, dequeue)
    }

    /// Register local interest in a key so that replies coming back for
    /// our own forwarded query are de-duplicated and accounted here.
    ///
    /// Local queries never add a waiter (replies reach local clients
    /// through the block store), so this only claims free or expired
    /// slots and backs off from any live collision.
    pub fn install_local(
        &mut self,
        ctx: &RouteContext,
        key: &Key,
        block_type: u32,
        ttl: i64,
        priority: u32,
    ) -> bool {
        let now = now_ms();
        let slot = {
            let index = self.index(key);
            &mut self.slots[index]
        };

        if slot.in_use() && slot.ttl >= now {
            if &slot.key != key {
                return false;
            }

            // Already routed for someone else; extend, keep the waiters.
            slot.ttl = slot.ttl.max(now + ttl.max(TTL_DECREMENT));
            slot.priority += priority;
            return true;
        }

        if !slot.in_use() {
            ctx.stats.slots_used.add(1);
        }

        reset_seen(slot, ctx.stats);
        reset_destinations(slot, ctx);
        slot.seen_reply_was_unique = false;
        slot.local_lookup_in_flight = false;
        slot.key = *key;
        slot.block_type = block_type;
        slot.priority = priority;
        slot.ttl = now + ttl.max(TTL_DECREMENT);
        true
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Drop every slot, releasing the peer references.
    pub fn clear(&mut self, ctx: &RouteContext) {
        for slot in self.slots.iter_mut() {
            if slot.in_use() {
                retire(slot, ctx);
            } else {
                reset_seen(slot, ctx.stats);
                reset_destinations(slot, ctx);
            }
        }
    }
}
