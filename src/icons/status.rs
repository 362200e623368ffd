//! Persisted "does this site have an icon" map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::snapshot;

/// Outcome of the last icon lookup for a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconStatusEntry {
    pub exists: bool,
    pub last_checked: DateTime<Utc>,
}

/// URL -> last lookup outcome, mirrored to a snapshot file
pub struct IconStatusCache {
    entries: Mutex<HashMap<String, IconStatusEntry>>,
    path: PathBuf,
    negative_retry: Duration,
    clock: Arc<dyn Clock>,
}

impl IconStatusCache {
    pub fn open(path: impl Into<PathBuf>, negative_retry: Duration, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let entries: HashMap<String, IconStatusEntry> = snapshot::load(&path);
        Self {
            entries: Mutex::new(entries),
            path,
            negative_retry,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IconStatusEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a download for `url` is worth attempting.
    ///
    /// Unknown and known-present URLs are always checked; a negative result
    /// suppresses retries until it is `negative_retry` old.
    pub fn should_check(&self, url: &str) -> bool {
        match self.lock().get(url) {
            None => true,
            Some(entry) if entry.exists => true,
            Some(entry) => self.clock.now() - entry.last_checked >= self.negative_retry,
        }
    }

    pub fn get(&self, url: &str) -> Option<IconStatusEntry> {
        self.lock().get(url).copied()
    }

    /// Record a lookup outcome and rewrite the snapshot.
    pub fn mark(&self, url: &str, exists: bool) {
        let entry = IconStatusEntry {
            exists,
            last_checked: self.clock.now(),
        };
        let mut entries = self.lock();
        entries.insert(url.to_string(), entry);
        if let Err(e) = snapshot::save(&self.path, &*entries) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist icon status");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
