//! Time-bounded presence cache
//!
//! The engine's bridges between DNS answers and later traffic decisions
//! are sets whose members disappear on a deadline: pending DNS queries,
//! allowed IPs, additionally allowed hostnames.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::sync::ShutdownToken;

/// How often the sweeper reclaims entries that expired without being read.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Concurrent set with per-entry absolute expiry.
///
/// Expiry is exact on the read path: `exists` compares against the
/// deadline before answering, so an entry is never observable past it.
/// A background sweeper additionally deletes dead entries that nothing
/// reads, keeping memory bounded.
pub struct TimedCache<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    name: &'static str,
    entries: Arc<DashMap<K, Instant>>,
    shutdown: ShutdownToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K> TimedCache<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    /// Create a cache; `name` tags its log lines.
    pub fn new(name: &'static str) -> Self {
        let entries: Arc<DashMap<K, Instant>> = Arc::new(DashMap::new());
        let shutdown = ShutdownToken::new();

        let sweep_entries = entries.clone();
        let sweep_shutdown = shutdown.clone();
        let sweeper = std::thread::spawn(move || {
            while !sweep_shutdown.wait_timeout(SWEEP_INTERVAL) {
                let now = Instant::now();
                sweep_entries.retain(|key, deadline| {
                    let live = now < *deadline;
                    if !live {
                        debug!(entry = %key, "cache entry expired");
                    }
                    live
                });
            }
        });

        Self {
            name,
            entries,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Add `key` with expiry `now + ttl`.
    ///
    /// If the key already exists its deadline is extended to the later
    /// of the existing and the new one; adding never shortens a
    /// lifetime.
    pub fn add(&self, key: K, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        debug!(cache = self.name, entry = %key, ?ttl, "adding cache entry");
        self.entries
            .entry(key)
            .and_modify(|existing| {
                if deadline > *existing {
                    *existing = deadline;
                }
            })
            .or_insert(deadline);
    }

    /// True iff `key` is present and not expired.
    pub fn exists(&self, key: &K) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < *entry {
                return true;
            }
            // expired but not yet swept
            drop(entry);
            self.entries.remove(key);
        }
        false
    }

    /// Delete `key` immediately; its pending expiry is cancelled.
    pub fn remove(&self, key: &K) {
        debug!(cache = self.name, entry = %key, "removing cache entry");
        self.entries.remove(key);
    }

    /// Number of live entries (expired-but-unswept entries may count).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the sweeper and release its thread. Idempotent; the cache
    /// remains readable afterwards but no longer reclaims in the
    /// background.
    pub fn stop(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<K> Drop for TimedCache<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_exists_remove() {
        let cache = TimedCache::new("test");

        cache.add("foo".to_string(), Duration::from_secs(60));
        assert!(cache.exists(&"foo".to_string()));

        cache.remove(&"foo".to_string());
        assert!(!cache.exists(&"foo".to_string()));

        cache.stop();
    }

    #[test]
    fn test_missing_entry() {
        let cache: TimedCache<String> = TimedCache::new("test");
        assert!(!cache.exists(&"absent".to_string()));
        cache.stop();
    }

    #[test]
    fn test_expiry() {
        let cache = TimedCache::new("test");

        cache.add("foo".to_string(), Duration::from_millis(10));
        assert!(cache.exists(&"foo".to_string()));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.exists(&"foo".to_string()));

        cache.stop();
    }

    #[test]
    fn test_add_extends_deadline() {
        let cache = TimedCache::new("test");

        cache.add("foo".to_string(), Duration::from_millis(10));
        cache.add("foo".to_string(), Duration::from_millis(100));

        std::thread::sleep(Duration::from_millis(20));
        // the longer deadline won
        assert!(cache.exists(&"foo".to_string()));

        cache.stop();
    }

    #[test]
    fn test_add_never_shortens() {
        let cache = TimedCache::new("test");

        cache.add("foo".to_string(), Duration::from_millis(100));
        cache.add("foo".to_string(), Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.exists(&"foo".to_string()));

        cache.stop();
    }

    #[test]
    fn test_sweeper_reclaims_unread_entries() {
        let cache = TimedCache::new("test");

        cache.add("foo".to_string(), Duration::from_millis(10));
        assert_eq!(cache.len(), 1);

        // never read the entry; the sweeper must still drop it
        std::thread::sleep(SWEEP_INTERVAL + Duration::from_millis(200));
        assert_eq!(cache.len(), 0);

        cache.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let cache: TimedCache<String> = TimedCache::new("test");
        cache.stop();
        cache.stop();
    }
}
