// src/core/dedup.rs

//! Content-hash based duplicate suppression.
//!
//! Frames are identified by the SHA-256 of their scope and content. A frame is
//! a duplicate if the same hash was recorded within the configured window. The
//! set of remembered hashes is a bounded LRU, so memory stays flat no matter
//! how many distinct frames pass through.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

type ContentHash = [u8; 32];

#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: Mutex<LruCache<ContentHash, Instant>>,
    suppressed: AtomicU64,
}

impl Deduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            window,
            seen: Mutex::new(LruCache::new(capacity)),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `true` if `content` was already seen under `scope` within the
    /// window. Otherwise records it and returns `false`.
    ///
    /// A duplicate does not refresh the entry: the window is measured from the
    /// first occurrence.
    pub fn check_and_record(&self, scope: &str, content: &[u8]) -> bool {
        let hash = Self::hash(scope, content);
        let now = Instant::now();
        let mut seen = self.seen.lock();

        let within_window = seen
            .get(&hash)
            .is_some_and(|first_seen| now.saturating_duration_since(*first_seen) < self.window);
        if within_window {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        seen.put(hash, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of frames reported as duplicates.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn hash(scope: &str, content: &[u8]) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update((scope.len() as u64).to_le_bytes());
        hasher.update(scope.as_bytes());
        hasher.update(content);
        hasher.finalize().into()
    }
}
