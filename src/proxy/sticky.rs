//! Sticky proxy assignments
//!
//! Maps a caller key (service name, worker slot) to the proxy it leased last
//! time. Targets are weak references: a forwarder id or a free-proxy address
//! that may since have been blacklisted. Callers re-resolve the target and
//! treat a vanished one as a cache miss.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::clock::SharedClock;

/// What a sticky key points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StickyTarget {
    Forwarder(u64),
    Free(String),
}

#[derive(Debug, Clone)]
struct StickyAssignment {
    target: StickyTarget,
    expires_at: Instant,
}

/// TTL-bound key -> proxy map shared by every worker
#[derive(Debug)]
pub struct StickyAssignmentRegistry {
    entries: DashMap<String, StickyAssignment>,
    clock: SharedClock,
}

impl StickyAssignmentRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Create or replace the assignment for `key`
    pub fn assign(&self, key: &str, target: StickyTarget, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), StickyAssignment { target, expires_at });
    }

    /// Live target for `key`. Expired entries are removed on lookup.
    pub fn lookup(&self, key: &str) -> Option<StickyTarget> {
        let now = self.clock.now();
        let hit = self.entries.get(key).map(|e| (e.target.clone(), e.expires_at))?;
        if now < hit.1 {
            return Some(hit.0);
        }
        self.entries.remove_if(key, |_, e| now >= e.expires_at);
        None
    }

    /// Forget `key`, returning what it pointed at
    pub fn invalidate(&self, key: &str) -> Option<StickyTarget> {
        self.entries.remove(key).map(|(_, e)| e.target)
    }

    /// Forget every key pointing at `target`
    pub fn invalidate_target(&self, target: &StickyTarget) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.target != *target);
        before.saturating_sub(self.entries.len())
    }

    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
