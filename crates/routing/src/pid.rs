use std::fmt;

use ahash::{HashMap, HashMapExt};
use codec::PeerId;
use parking_lot::Mutex;

/// A small interned stand-in for a 512-bit peer hash.
///
/// Every structural reference to a peer in the routing tables stores one
/// of these instead of the full hash. Index 0 is reserved for
/// "none/local" and is never allocated.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// The local node (or "no peer").
    pub const LOCAL: Pid = Pid(0);

    pub fn is_local(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid({})", self.0)
    }
}

struct Entry {
    peer: PeerId,
    rc: u32,
}

#[derive(Default)]
struct Inner {
    index: HashMap<PeerId, u32>,
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
}

/// Reference counted peer identity intern table.
///
/// An id is reclaimed when its count reaches zero; reclaimed indices are
/// reused. Underflowing a reference count is a fatal programming error
/// and panics.
///
/// # Test
///
/// ```
/// use gap_server_routing::pid::{Pid, PidTable};
/// use codec::PeerId;
///
/// let table = PidTable::default();
/// let peer = PeerId([1u8; 64]);
///
/// let id = table.intern(&peer);
/// assert!(!id.is_local());
/// assert_eq!(table.resolve(id), Some(peer));
///
/// // interning again bumps the count, not the id
/// assert_eq!(table.intern(&peer), id);
/// assert_eq!(table.total_refs(), 2);
///
/// table.change_rc(id, -2);
/// assert_eq!(table.total_refs(), 0);
///
/// // a fresh intern may reuse the index
/// let other = table.intern(&PeerId([2u8; 64]));
/// assert_eq!(table.resolve(other), Some(PeerId([2u8; 64])));
/// ```
pub struct PidTable {
    inner: Mutex<Inner>,
}

impl Default for PidTable {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                index: HashMap::with_capacity(1024),
                // Index 0 stays empty forever.
                entries: vec![None],
                free: Vec::new(),
            }),
        }
    }
}

impl PidTable {
    /// Find or allocate the id for a peer and take one reference on it.
    pub fn intern(&self, peer: &PeerId) -> Pid {
        let mut lock = self.inner.lock();
        if let Some(id) = lock.index.get(peer).copied() {
            lock.entries[id as usize].as_mut().unwrap().rc += 1;
            return Pid(id);
        }

        let entry = Entry {
            peer: *peer,
            rc: 1,
        };

        let id = if let Some(id) = lock.free.pop() {
            lock.entries[id as usize] = Some(entry);
            id
        } else {
            lock.entries.push(Some(entry));
            (lock.entries.len() - 1) as u32
        };

        lock.index.insert(*peer, id);
        Pid(id)
    }

    /// Interning "no peer" yields the local id without touching the
    /// table.
    pub fn intern_opt(&self, peer: Option<&PeerId>) -> Pid {
        peer.map(|it| self.intern(it)).unwrap_or(Pid::LOCAL)
    }

    pub fn resolve(&self, id: Pid) -> Option<PeerId> {
        if id.is_local() {
            return None;
        }

        let lock = self.inner.lock();
        Some(
            lock.entries[id.0 as usize]
                .as_ref()
                .expect("resolved a reclaimed peer id")
                .peer,
        )
    }

    pub fn change_rc(&self, id: Pid, delta: i32) {
        if id.is_local() {
            return;
        }

        let mut lock = self.inner.lock();
        let entry = lock.entries[id.0 as usize]
            .as_mut()
            .expect("changed refcount of a reclaimed peer id");

        entry.rc = entry
            .rc
            .checked_add_signed(delta)
            .expect("peer id refcount underflow");

        if entry.rc == 0 {
            let peer = entry.peer;
            lock.entries[id.0 as usize] = None;
            lock.index.remove(&peer);
            lock.free.push(id.0);
        }
    }

    pub fn decrement_rcs(&self, ids: &[Pid]) {
        for id in ids {
            self.change_rc(*id, -1);
        }
    }

    /// Sum of all reference counts, for invariant checking.
    pub fn total_refs(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .iter()
            .flatten()
            .map(|it| it.rc as u64)
            .sum()
    }
}
