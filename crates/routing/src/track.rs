use crate::{
    now_ms,
    pid::{Pid, PidTable},
    stats::EngineStats,
};

use ahash::{HashMap, HashMapExt};

struct Responder {
    pid: Pid,
    count: u32,
}

struct OriginRecord {
    last_reply: i64,
    responders: Vec<Responder>,
}

/// Origins older than this are wiped wholesale on the next ager pass.
const ORIGIN_IDLE_LIMIT: i64 = 600_000;

/// Per-origin "good replier" weights.
///
/// For each peer that asked us something we remember which peers sent
/// replies for it, and how often. The forwarding heuristic prefers peers
/// that historically answered the same origin's queries (the "hot path").
/// Counts halve on every ager pass so stale reputations fade.
#[derive(Default)]
pub struct ReplyTracks {
    origins: HashMap<Pid, OriginRecord>,
}

impl ReplyTracks {
    /// We routed a reply from `responder` back toward `origin`.
    ///
    /// Local responses are not tracked.
    pub fn update(&mut self, pids: &PidTable, stats: &EngineStats, origin: Pid, responder: Pid) {
        if responder.is_local() {
            return;
        }

        let record = self.origins.entry(origin).or_insert_with(|| {
            pids.change_rc(origin, 1);
            OriginRecord {
                last_reply: 0,
                responders: Vec::new(),
            }
        });

        record.last_reply = now_ms();
        for it in record.responders.iter_mut() {
            if it.pid == responder {
                it.count += 1;
                stats.response_count.add(1);
                return;
            }
        }

        pids.change_rc(responder, 1);
        stats.response_count.add(1);
        record.responders.push(Responder {
            pid: responder,
            count: 1,
        });
    }

    /// How often `responder` answered queries from `origin`.
    pub fn response_count(&self, origin: Pid, responder: Pid) -> u32 {
        self.origins
            .get(&origin)
            .and_then(|record| {
                record
                    .responders
                    .iter()
                    .find(|it| it.pid == responder)
                    .map(|it| it.count)
            })
            .unwrap_or(0)
    }

    /// Age all records: halve counts, reclaim empty rows.
    ///
    /// Runs every two minutes from a background thread.
    pub fn age(&mut self, pids: &PidTable, stats: &EngineStats) {
        let deadline = now_ms() - ORIGIN_IDLE_LIMIT;
        self.origins.retain(|origin, record| {
            // After ten idle minutes, always discard everything.
            if record.last_reply < deadline {
                for it in record.responders.drain(..) {
                    stats.response_count.add(-(it.count as i64));
                    pids.change_rc(it.pid, -1);
                }
            }

            record.responders.retain_mut(|it| {
                stats
                    .response_count
                    .add(-(it.count as i64 - (it.count / 2) as i64));
                it.count /= 2;
                if it.count == 0 {
                    pids.change_rc(it.pid, -1);
                    return false;
                }

                true
            });

            if record.responders.is_empty() {
                pids.change_rc(*origin, -1);
                return false;
            }

            true
        });
    }

    /// Number of tracked origins, for shutdown assertions.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
