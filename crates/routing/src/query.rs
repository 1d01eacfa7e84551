use crate::{
    BITMAP_SIZE, QUERY_RECORD_COUNT, TTL_DECREMENT, now_ms,
    pid::Pid,
};

use bytes::Bytes;
use codec::{Key, PeerId, message::QUERY_FIXED_SIZE};
use rand::Rng;

/// Map a peer identity to a transmit bitmap slot.
///
/// The bitmap has a fixed 128 bit-slots; distinct peers may share a slot,
/// in which case only one of them receives the query.
///
/// # Test
///
/// ```
/// use gap_server_routing::query::bit_index;
/// use codec::PeerId;
///
/// assert!(bit_index(&PeerId([0xffu8; 64])) < 128);
/// assert_eq!(bit_index(&PeerId([0u8; 64])), 0);
/// ```
pub fn bit_index(peer: &PeerId) -> usize {
    peer.first_word() as usize % (8 * BITMAP_SIZE)
}

/// An outbound query held verbatim for retransmission.
pub struct StoredQuery {
    pub bytes: Bytes,
    pub primary_key: Key,
    pub return_to: PeerId,
}

impl StoredQuery {
    /// Two stored queries match when they ask for exactly the same key
    /// list; the mutable prefix (priority, ttl, source) does not count.
    fn matches(&self, bytes: &[u8]) -> bool {
        self.bytes.len() == bytes.len()
            && self.bytes[QUERY_FIXED_SIZE..] == bytes[QUERY_FIXED_SIZE..]
    }
}

/// One slot of the outbound ring.
#[derive(Default)]
pub struct QueryRecord {
    /// Absolute time until which this query is worth forwarding.
    pub expires: i64,
    pub send_count: u32,
    pub transmission_count: u32,
    pub msg: Option<StoredQuery>,
    pub no_target: Pid,
    pub bitmap: [u8; BITMAP_SIZE],
}

impl QueryRecord {
    pub fn set_bit(&mut self, bit: usize) {
        self.bitmap[bit >> 3] |= 1 << (bit & 7);
    }

    pub fn get_bit(&self, bit: usize) -> bool {
        self.bitmap[bit >> 3] & (1 << (bit & 7)) != 0
    }

    pub fn clear_bitmap(&mut self) {
        self.bitmap = [0u8; BITMAP_SIZE];
    }

    pub fn is_live(&self, now: i64) -> bool {
        self.expires > now && self.msg.is_some()
    }
}

/// The ring of currently-propagating outbound queries.
///
/// Slots are replaced oldest-first when a new query arrives; the
/// transmit-fill callback walks the ring from a persistent cursor and
/// copies live queries into outgoing packets with spare room.
pub struct OutboundQueries {
    records: Vec<QueryRecord>,
    cursor: usize,
}

impl Default for OutboundQueries {
    fn default() -> Self {
        Self {
            records: (0..QUERY_RECORD_COUNT).map(|_| QueryRecord::default()).collect(),
            cursor: 0,
        }
    }
}

impl OutboundQueries {
    /// Pick the slot for a new outbound query.
    ///
    /// A slot already holding exactly this query wins outright; otherwise
    /// the oldest slot that would expire before the new query does. When
    /// everything outlives the new query there is no slot at all and the
    /// caller works on a throwaway record.
    ///
    /// On a matching slot the transmit bitmap survives only with
    /// probability `1/keep_chance`; most repeats clear it. Clients retry
    /// with exponential back-off, so a repeat request must eventually
    /// reach peers the first transmission already covered.
    pub fn find_slot(
        &mut self,
        bytes: &[u8],
        expiration: i64,
        keep_chance: u32,
    ) -> (Option<usize>, bool) {
        let now = now_ms();
        let mut oldest: Option<usize> = None;
        let mut oldest_time = expiration;
        for (i, record) in self.records.iter().enumerate() {
            if record.expires < oldest_time {
                oldest_time = record.expires;
                oldest = Some(i);
            }

            let Some(msg) = record.msg.as_ref() else {
                continue;
            };

            if msg.matches(bytes) {
                // Exactly this query is pending already; replace it.
                let noclear = record.expires > now - 4 * TTL_DECREMENT
                    && rand::rng().random_range(0..keep_chance) == 0;

                return (Some(i), noclear);
            }
        }

        (oldest, false)
    }

    /// Take a record out of the ring for reconfiguration, leaving a hole.
    pub fn take(&mut self, index: usize) -> QueryRecord {
        std::mem::take(&mut self.records[index])
    }

    pub fn put_back(&mut self, index: usize, record: QueryRecord) {
        self.records[index] = record;
    }

    /// Stop transmitting a query: we no longer route it, or the one and
    /// only answer has arrived.
    pub fn dequeue(&mut self, key: &Key) -> bool {
        for record in self.records.iter_mut() {
            if let Some(msg) = record.msg.as_ref() {
                if &msg.primary_key == key {
                    record.expires = 0;
                    return true;
                }
            }
        }

        false
    }

    /// Copy pending queries into an outgoing packet with spare room.
    ///
    /// The bitmap is the authority: a peer whose bit is already set never
    /// receives the same query twice through this path. The walk resumes
    /// where the previous fill stopped so all slots get their turn.
    pub fn fill(&mut self, peer: &PeerId, receiver: Pid, buf: &mut [u8]) -> usize {
        let now = now_ms();
        let idx = bit_index(peer);
        let start = self.cursor;
        let mut delta = 0;

        loop {
            let record = &mut self.records[self.cursor];
            if let Some(msg) = record.msg.as_ref() {
                if record.expires > now
                    && !record.get_bit(idx)
                    && receiver != record.no_target
                    && msg.return_to != *peer
                    && buf.len() - delta >= msg.bytes.len()
                {
                    buf[delta..delta + msg.bytes.len()].copy_from_slice(&msg.bytes);
                    delta += msg.bytes.len();
                    record.set_bit(idx);
                    record.send_count += 1;
                }
            }

            self.cursor += 1;
            if self.cursor >= QUERY_RECORD_COUNT {
                self.cursor = 0;
            }

            if self.cursor == start || buf.len() - delta < QUERY_FIXED_SIZE + 64 {
                break;
            }
        }

        delta
    }
}
