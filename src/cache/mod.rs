//! Persisted vault item cache with TTL
//!
//! This module provides a thread-safe cache of item projections that:
//! - Never holds passwords (only [`VaultItem`] metadata)
//! - Expires entries after a fixed TTL, purged lazily on the next touch
//! - Persists the whole map as one JSON snapshot on every change; the
//!   in-memory map only changes once the file write succeeded
//! - Tracks hit/miss statistics for monitoring

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::protocol::VaultItem;
use crate::snapshot;

/// A cached item projection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedItem {
    #[serde(flatten)]
    pub item: VaultItem,
    /// When the item was last written by a live query or sync
    pub cached_at: DateTime<Utc>,
}

impl CachedItem {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.cached_at > ttl
    }

    fn matches(&self, needle: &str) -> bool {
        let item = &self.item;
        item.name.to_lowercase().contains(needle)
            || item
                .username
                .as_deref()
                .is_some_and(|u| u.to_lowercase().contains(needle))
            || item.uris.iter().any(|u| u.to_lowercase().contains(needle))
    }
}

/// Thread-safe item cache backed by a snapshot file
pub struct ItemCache {
    /// id -> cached projection; the file mirrors this map
    entries: Mutex<HashMap<String, CachedItem>>,
    path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ItemCache {
    /// Open the cache, loading the snapshot at `path` if it exists
    pub fn open(path: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let entries: HashMap<String, CachedItem> = snapshot::load(&path);
        tracing::debug!(path = %path.display(), count = entries.len(), "item cache loaded");

        Self {
            entries: Mutex::new(entries),
            path,
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedItem>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True iff at least one entry is within the TTL
    pub fn is_valid(&self) -> bool {
        let now = self.clock.now();
        self.lock().values().any(|e| !e.is_expired(now, self.ttl))
    }

    /// Case-insensitive substring search over name, username and URIs.
    ///
    /// Expired entries are purged first. An empty term matches every live
    /// entry. Results are ordered by name.
    pub fn search(&self, term: &str) -> Vec<VaultItem> {
        let needle = term.trim().to_lowercase();
        let now = self.clock.now();
        let mut entries = self.lock();
        self.purge_expired_locked(&mut entries);

        let mut results: Vec<VaultItem> = entries
            .values()
            .filter(|e| !e.is_expired(now, self.ttl))
            .filter(|e| needle.is_empty() || e.matches(&needle))
            .map(|e| e.item.clone())
            .collect();
        drop(entries);

        results.sort_by_cached_key(|i| i.name.to_lowercase());

        if results.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(term = term, "item cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(term = term, count = results.len(), "item cache hit");
        }
        results
    }

    /// Upsert `items`, stamping each with the current time.
    ///
    /// The snapshot is written first; on error the cache is unchanged.
    pub fn update(&self, items: &[VaultItem]) -> std::io::Result<()> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let mut next = entries.clone();
        for item in items {
            next.insert(
                item.id.clone(),
                CachedItem {
                    item: item.clone(),
                    cached_at: now,
                },
            );
        }
        snapshot::save(&self.path, &next)?;
        *entries = next;
        tracing::debug!(count = items.len(), total = entries.len(), "item cache updated");
        Ok(())
    }

    /// Delete the file, then empty the cache
    pub fn clear(&self) -> std::io::Result<()> {
        let mut entries = self.lock();
        snapshot::remove(&self.path)?;
        let count = entries.len();
        entries.clear();
        tracing::info!(count = count, "item cache cleared");
        Ok(())
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let entries = self.lock().len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries,
            hits,
            misses,
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Drop expired entries (must hold the lock). Kept in memory if the
    /// rewritten snapshot cannot be saved.
    fn purge_expired_locked(&self, entries: &mut HashMap<String, CachedItem>) {
        let now = self.clock.now();
        let live: HashMap<String, CachedItem> = entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now, self.ttl))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        let evicted = entries.len() - live.len();
        if evicted == 0 {
            return;
        }

        match snapshot::save(&self.path, &live) {
            Ok(()) => {
                tracing::debug!(count = evicted, "evicted expired cache entries");
                *entries = live;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to persist item cache");
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of entries currently in cache (expired ones included until purged)
    pub entries: usize,
    /// Searches that returned at least one item
    pub hits: u64,
    /// Searches that returned nothing
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn item(id: &str, name: &str, username: Option<&str>, uris: &[&str]) -> VaultItem {
        VaultItem {
            id: id.to_string(),
            name: name.to_string(),
            username: username.map(str::to_string),
            has_totp: false,
            uris: uris.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn open(dir: &TempDir, clock: &Arc<ManualClock>) -> ItemCache {
        ItemCache::open(dir.path().join("items.json"), Duration::hours(24), clock.clone())
    }

    #[test]
    fn test_search_matches_name_username_and_uri() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache
            .update(&[
                item("1", "GitHub", Some("octo"), &["https://github.com"]),
                item("2", "Mail", Some("me@example.com"), &[]),
                item("3", "Bank", None, &["https://bank.example/login"]),
            ])
            .unwrap();

        assert_eq!(cache.search("GIT").len(), 1);
        assert_eq!(cache.search("example")[0].name, "Bank");
        assert_eq!(cache.search("example").len(), 2);
        assert_eq!(cache.search("OCTO")[0].id, "1");
        assert!(cache.search("nothing").is_empty());

        let all: Vec<_> = cache.search("").into_iter().map(|i| i.name).collect();
        assert_eq!(all, vec!["Bank", "GitHub", "Mail"]);
    }

    #[test]
    fn test_expired_subset_is_evicted() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache.update(&[item("old", "git old", None, &[])]).unwrap();
        clock.advance(Duration::hours(20));
        cache.update(&[item("new", "git new", None, &[])]).unwrap();

        clock.advance(Duration::hours(4) + Duration::seconds(1));
        let ids: Vec<_> = cache.search("git").into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["new"]);
        assert!(cache.is_valid());

        // the purge is persisted
        let reopened = open(&dir, &clock);
        assert_eq!(reopened.stats().entries, 1);

        clock.advance(Duration::hours(21));
        assert!(!cache.is_valid());
        assert!(cache.search("git").is_empty());
    }

    #[test]
    fn test_entry_at_exact_ttl_is_still_valid() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache.update(&[item("1", "a", None, &[])]).unwrap();
        clock.advance(Duration::hours(24));
        assert!(cache.is_valid());
        assert_eq!(cache.search("a").len(), 1);
    }

    #[test]
    fn test_failed_save_leaves_cache_unchanged() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = ItemCache::open(blocker.join("items.json"), Duration::hours(24), clock);

        assert!(cache.update(&[item("1", "GitHub", None, &[])]).is_err());
        assert!(cache.search("git").is_empty());
        assert_eq!(cache.stats().entries, 0);
        assert!(!cache.is_valid());
    }

    #[test]
    fn test_failed_clear_keeps_entries() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);
        cache.update(&[item("1", "GitHub", None, &[])]).unwrap();

        // a directory where the snapshot file should be cannot be removed as a file
        std::fs::remove_file(cache.path()).unwrap();
        std::fs::create_dir(cache.path()).unwrap();

        assert!(cache.clear().is_err());
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.search("git").len(), 1);
    }

    #[test]
    fn test_update_upserts_and_restamps() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache.update(&[item("1", "Old name", None, &[])]).unwrap();
        clock.advance(Duration::hours(23));
        cache.update(&[item("1", "New name", None, &[])]).unwrap();
        clock.advance(Duration::hours(2));

        let found = cache.search("name");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "New name");
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());

        let mut original = item("1", "GitHub", Some("octo"), &["https://github.com"]);
        original.has_totp = true;
        open(&dir, &clock).update(&[original.clone()]).unwrap();

        let reopened = open(&dir, &clock);
        assert_eq!(reopened.search("github"), vec![original]);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache.update(&[item("1", "a", None, &[])]).unwrap();
        assert!(cache.path().exists());

        cache.clear().unwrap();
        assert!(!cache.path().exists());
        assert!(!cache.is_valid());
        cache.clear().unwrap();
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = open(&dir, &clock);

        cache.update(&[item("1", "a", None, &[])]).unwrap();
        cache.search("a");
        cache.search("zzz");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }
}
