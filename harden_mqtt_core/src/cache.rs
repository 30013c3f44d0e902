//! Recently-sent digest cache.
//!
//! The troll publishes onto the same bus it subscribes to, so every
//! republication comes straight back at it. Before publishing it records
//! SHA-256(topic ‖ payload); on receive, a hit means "that was me", the
//! entry is consumed, and the message is skipped. Consuming on hit keeps
//! the suppression to exactly one echo per publication.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_CAPACITY: usize = 4_096;

pub fn message_digest(topic: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

pub struct DigestCache {
    entries: HashMap<[u8; 32], Instant>,
    ttl: Duration,
    capacity: usize,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Records an outbound publication.
    pub fn insert(&mut self, topic: &str, payload: &[u8]) {
        self.insert_at(topic, payload, Instant::now());
    }

    /// Consumes a hit: returns true once per recorded publication.
    pub fn check_and_remove(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.check_and_remove_at(topic, payload, Instant::now())
    }

    fn insert_at(&mut self, topic: &str, payload: &[u8], now: Instant) {
        self.evict(now);
        if self.entries.len() >= self.capacity {
            // Bounded: shed the stalest entry rather than grow.
            if let Some(key) = self
                .entries
                .iter()
                .min_by_key(|(_, inserted)| **inserted)
                .map(|(key, _)| *key)
            {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(message_digest(topic, payload), now);
    }

    fn check_and_remove_at(&mut self, topic: &str, payload: &[u8], now: Instant) -> bool {
        self.evict(now);
        self.entries
            .remove(&message_digest(topic, payload))
            .is_some()
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, inserted| now.duration_since(*inserted) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DigestCache {
    fn default() -> Self {
        Self::new()
    }
}
