//! Recently-seen packet cache.
//!
//! Maps packet content hash to the instant it was first seen. An entry counts
//! as present until it is older than the retention window; maintenance prunes
//! expired entries so memory stays bounded by traffic within the window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::packet::PacketHash;

/// Default retention window (24 hours)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub struct DedupCache {
    seen: HashMap<PacketHash, Instant>,
    retention: Duration,
}

impl DedupCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn is_expired(&self, first_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(first_seen) > self.retention
    }

    /// Record `hash` as seen at `now`.
    /// Returns true if it was new (absent or expired), false for a duplicate.
    pub fn check_and_insert(&mut self, hash: PacketHash, now: Instant) -> bool {
        match self.seen.get(&hash) {
            Some(&first_seen) if !self.is_expired(first_seen, now) => false,
            _ => {
                self.seen.insert(hash, now);
                true
            }
        }
    }

    pub fn contains(&self, hash: &PacketHash, now: Instant) -> bool {
        self.seen
            .get(hash)
            .is_some_and(|&first_seen| !self.is_expired(first_seen, now))
    }

    /// Drop entries older than the retention window. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let retention = self.retention;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= retention);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn hash_of(payload: &'static [u8]) -> PacketHash {
        Packet::new(payload).hash()
    }

    #[test]
    fn test_duplicate_detected() {
        let mut cache = DedupCache::default();
        let hash = hash_of(b"test");
        let now = Instant::now();

        assert!(cache.check_and_insert(hash, now));
        assert!(!cache.check_and_insert(hash, now));
        assert!(!cache.check_and_insert(hash, now + Duration::from_secs(60)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_hashes() {
        let mut cache = DedupCache::default();
        let now = Instant::now();

        assert!(cache.check_and_insert(hash_of(b"one"), now));
        assert!(cache.check_and_insert(hash_of(b"two"), now));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_presence_around_retention_boundary() {
        let mut cache = DedupCache::default();
        let hash = hash_of(b"boundary");
        let inserted = Instant::now();
        let epsilon = Duration::from_millis(1);

        cache.check_and_insert(hash, inserted);

        assert!(cache.contains(&hash, inserted + DEFAULT_RETENTION - epsilon));
        assert!(!cache.contains(&hash, inserted + DEFAULT_RETENTION + epsilon));
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let retention = Duration::from_secs(10);
        let mut cache = DedupCache::new(retention);
        let start = Instant::now();
        let old = hash_of(b"old");
        let fresh = hash_of(b"fresh");

        cache.check_and_insert(old, start);
        cache.check_and_insert(fresh, start + Duration::from_secs(5));

        let now = start + retention + Duration::from_millis(1);
        assert_eq!(cache.prune(now), 1);
        assert!(!cache.contains(&old, now));
        assert!(cache.contains(&fresh, now));

        assert_eq!(cache.prune(now), 0);
    }

    #[test]
    fn test_expired_entry_counts_as_new() {
        let retention = Duration::from_secs(1);
        let mut cache = DedupCache::new(retention);
        let hash = hash_of(b"again");
        let start = Instant::now();

        assert!(cache.check_and_insert(hash, start));
        assert!(cache.check_and_insert(hash, start + Duration::from_secs(2)));
        // refreshed at the second insertion
        assert!(!cache.check_and_insert(hash, start + Duration::from_millis(2500)));
    }
}
