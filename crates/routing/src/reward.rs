use crate::{MAX_REWARD_TRACKS, stats::EngineStats};

use codec::Key;

#[derive(Clone, Copy)]
struct RewardEntry {
    key: Key,
    priority: u32,
}

/// Trust bounties for local requests.
///
/// When a local client asks for content at some priority, that priority
/// is remembered here; the peer that eventually brings the matching reply
/// home gets credited with it. The ring has no eviction policy beyond
/// round-robin overwrite, stale rewards simply decay as newer requests
/// take their slots.
///
/// # Test
///
/// ```
/// use gap_server_routing::reward::RewardRing;
/// use gap_server_routing::stats::EngineStats;
///
/// let stats = EngineStats::default();
/// let mut rewards = RewardRing::default();
/// let key = [1u8; 64].into();
///
/// rewards.add(&stats, &key, 10);
/// rewards.add(&stats, &key, 5);
/// assert_eq!(stats.pending_rewards.get(), 15);
///
/// assert_eq!(rewards.claim(&stats, &key), 15);
///
/// // claiming is idempotent on the empty
/// assert_eq!(rewards.claim(&stats, &key), 0);
/// assert_eq!(stats.pending_rewards.get(), 0);
/// ```
pub struct RewardRing {
    entries: Vec<RewardEntry>,
    cursor: usize,
}

impl Default for RewardRing {
    fn default() -> Self {
        Self {
            entries: vec![
                RewardEntry {
                    key: Key::ZERO,
                    priority: 0,
                };
                MAX_REWARD_TRACKS
            ],
            cursor: 0,
        }
    }
}

impl RewardRing {
    pub fn add(&mut self, stats: &EngineStats, key: &Key, priority: u32) {
        if priority == 0 {
            return;
        }

        let entry = &mut self.entries[self.cursor];
        stats
            .pending_rewards
            .add(priority as i64 - entry.priority as i64);

        entry.key = *key;
        entry.priority = priority;

        self.cursor += 1;
        if self.cursor == self.entries.len() {
            self.cursor = 0;
        }
    }

    /// Collect and zero every pending reward for a key.
    pub fn claim(&mut self, stats: &EngineStats, key: &Key) -> u32 {
        let mut ret = 0;
        for entry in &mut self.entries {
            if &entry.key == key && entry.priority != 0 {
                ret += entry.priority;
                stats.pending_rewards.add(-(entry.priority as i64));
                entry.priority = 0;
            }
        }

        ret
    }
}
