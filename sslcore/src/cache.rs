use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::{
    session::{Session, SessionId, SessionKey},
    ProtocolVersion,
};

/// Default bound on the number of cached sessions.
pub const SESSION_CACHE_MAX_SIZE_DEFAULT: usize = 1024 * 20;

bitflags! {
    /// Which roles cache sessions, and how.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SessionCacheMode: u32 {
        /// Cache sessions of client connections
        const CLIENT = 0x0001;
        /// Cache sessions of server connections
        const SERVER = 0x0002;
        /// Both roles
        const BOTH = Self::CLIENT.bits() | Self::SERVER.bits();
        /// Never flush automatically
        const NO_AUTO_CLEAR = 0x0080;
        /// Do not look sessions up in the internal cache
        const NO_INTERNAL_LOOKUP = 0x0100;
        /// Do not store sessions in the internal cache
        const NO_INTERNAL_STORE = 0x0200;
        /// Neither lookup nor store
        const NO_INTERNAL = Self::NO_INTERNAL_LOOKUP.bits() | Self::NO_INTERNAL_STORE.bits();
    }
}

impl Default for SessionCacheMode {
    fn default() -> Self {
        Self::SERVER
    }
}

/// Context statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stat {
    /// Client handshakes started
    Connect,
    /// Client handshakes completed
    ConnectGood,
    /// Client renegotiations started
    ConnectRenegotiate,
    /// Server handshakes started
    Accept,
    /// Server handshakes completed
    AcceptGood,
    /// Server renegotiations started
    AcceptRenegotiate,
    /// Sessions resumed from the internal cache
    Hit,
    /// Sessions resumed through the get-session callback
    CbHit,
    /// Offered sessions not found
    Misses,
    /// Offered sessions found but expired
    Timeouts,
    /// Sessions evicted because the cache was full
    CacheFull,
}

const STAT_COUNT: usize = 11;

/// Counters kept per context. Updated without locking.
#[derive(Debug, Default)]
pub struct SessionStats {
    counters: [AtomicU64; STAT_COUNT],
}

impl SessionStats {
    /// Current value of a counter
    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    /// Increments a counter, returning its previous value
    pub(crate) fn incr(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed)
    }
}

struct Entry {
    session: Session,
    seq: u64,
}

struct CacheInner {
    map: HashMap<SessionKey, Entry>,
    // Insertion order, oldest first
    order: BTreeMap<u64, SessionKey>,
    next_seq: u64,
    max_size: usize,
}

impl CacheInner {
    fn remove_key(&mut self, key: &SessionKey) -> Option<Session> {
        let entry = self.map.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry.session)
    }
}

/// Outcome of [`SessionCache::insert`].
#[derive(Debug, Default)]
pub(crate) struct Insertion {
    pub(crate) inserted: bool,
    pub(crate) evicted: Vec<Session>,
}

/// Bounded session store of a context.
///
/// Methods return the sessions that left the cache so callers can notify
/// the remove callback after the lock has been released.
pub(crate) struct SessionCache {
    inner: RwLock<CacheInner>,
}

impl SessionCache {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                max_size,
            }),
        }
    }

    /// Adds `session` unless its id is empty or its key is already
    /// present. Evicts the oldest entries while over the size bound.
    pub(crate) fn insert(&self, session: &Session) -> Insertion {
        if session.id().is_empty() {
            return Insertion::default();
        }
        let key = session.key();
        let mut inner = self.inner.write();
        if inner.map.contains_key(&key) {
            return Insertion::default();
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            key,
            Entry {
                session: session.clone(),
                seq,
            },
        );
        inner.order.insert(seq, key);

        let mut evicted = Vec::new();
        while inner.max_size > 0 && inner.map.len() > inner.max_size {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            if let Some(entry) = inner.map.remove(&oldest) {
                evicted.push(entry.session);
            }
        }
        if !evicted.is_empty() {
            log::debug!("Session cache full, evicted {} sessions", evicted.len());
        }

        Insertion {
            inserted: true,
            evicted,
        }
    }

    /// Finds a session by version and id. The returned handle is a new
    /// reference.
    pub(crate) fn lookup(&self, version: ProtocolVersion, id: &SessionId) -> Option<Session> {
        let key = SessionKey { version, id: *id };
        self.inner.read().map.get(&key).map(|e| e.session.clone())
    }

    pub(crate) fn contains(&self, version: ProtocolVersion, id: &SessionId) -> bool {
        let key = SessionKey { version, id: *id };
        self.inner.read().map.contains_key(&key)
    }

    /// Drops the cache's reference to `session`, if it holds one
    pub(crate) fn remove(&self, session: &Session) -> Option<Session> {
        self.inner.write().remove_key(&session.key())
    }

    /// Removes every session expired at `t`, or all of them when `t` is 0
    pub(crate) fn flush(&self, t: u64) -> Vec<Session> {
        let mut inner = self.inner.write();
        let expired: Vec<SessionKey> = inner
            .map
            .iter()
            .filter(|(_, e)| t == 0 || e.session.is_expired(t))
            .map(|(k, _)| *k)
            .collect();
        let removed: Vec<Session> = expired
            .iter()
            .filter_map(|k| inner.remove_key(k))
            .collect();
        if !removed.is_empty() {
            log::debug!("Flushed {} sessions at {t}", removed.len());
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.inner.read().max_size
    }

    /// Sets the bound, returning the previous one. Takes effect on the
    /// next insertion.
    pub(crate) fn set_max_size(&self, max_size: usize) -> usize {
        std::mem::replace(&mut self.inner.write().max_size, max_size)
    }
}
