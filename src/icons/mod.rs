//! Icon prefetch
//!
//! Icons are downloaded per domain from a favicon service and stored as
//! files under the cache directory. A global semaphore bounds concurrent
//! downloads across every batch; the [`IconStatusCache`] remembers which
//! sites had no icon so they are not asked again for a while.

mod source;
mod status;

pub use source::{FaviconService, IconError, IconSource};
pub use status::{IconStatusCache, IconStatusEntry};

#[cfg(test)]
pub use source::mock;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use crate::clock::Clock;
use crate::config::Config;
use crate::protocol::VaultItem;
use crate::snapshot;

/// Receives listed items for icon resolution
#[async_trait]
pub trait IconResolver: Send + Sync {
    /// Start resolving icons for `items`. Must not block on the downloads.
    fn resolve(&self, items: &[VaultItem]);

    /// Prefetch after a full sync; see [`IconFetcher::prime_batches`].
    async fn prime(&self, items: &[VaultItem]) -> PrimeReport;
}

/// Resolver used when icons are disabled
pub struct NoopResolver;

#[async_trait]
impl IconResolver for NoopResolver {
    fn resolve(&self, _items: &[VaultItem]) {}

    async fn prime(&self, _items: &[VaultItem]) -> PrimeReport {
        PrimeReport::default()
    }
}

/// Outcome of the synchronous part of [`IconFetcher::prime_batches`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrimeReport {
    pub fetched: usize,
    pub failed: usize,
    /// URLs handed to the background batch
    pub deferred: usize,
}

/// Download settings, resolved from [`crate::config::IconConfig`]
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub dir: PathBuf,
    pub fallback: PathBuf,
    pub concurrency: usize,
    pub initial_batch: usize,
    pub download_timeout: Duration,
    pub file_max_age: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.icon_dir(),
            fallback: config.icons.fallback_icon.clone(),
            concurrency: config.icons.concurrency.max(1),
            initial_batch: config.icons.initial_batch,
            download_timeout: Duration::from_secs(config.icons.download_timeout_secs),
            file_max_age: Duration::from_secs(config.icons.file_max_age_secs),
        }
    }
}

struct FetcherInner {
    source: Arc<dyn IconSource>,
    status: IconStatusCache,
    permits: Semaphore,
    settings: FetchSettings,
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded-concurrency icon downloader. Clones share the pool.
#[derive(Clone)]
pub struct IconFetcher {
    inner: Arc<FetcherInner>,
}

impl IconFetcher {
    pub fn new(settings: FetchSettings, status: IconStatusCache, source: Arc<dyn IconSource>) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                source,
                status,
                permits: Semaphore::new(settings.concurrency),
                settings,
                background: Mutex::new(None),
            }),
        }
    }

    /// Fetcher backed by the configured favicon service
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, IconError> {
        let settings = FetchSettings::from_config(config);
        let source = FaviconService::new(
            config.icons.service_url.clone(),
            config.icons.size,
            settings.download_timeout,
        )?;
        let status = IconStatusCache::open(
            config.icon_status_path(),
            config.icon_negative_retry(),
            clock,
        );
        Ok(Self::new(settings, status, Arc::new(source)))
    }

    pub fn status(&self) -> &IconStatusCache {
        &self.inner.status
    }

    fn icon_path(&self, url: &str) -> Option<PathBuf> {
        domain_of(url).map(|domain| self.inner.settings.dir.join(icon_file_name(&domain)))
    }

    /// Make sure a local icon exists for `url`. Returns whether one does.
    ///
    /// Failures are recorded in the status cache, never raised.
    pub async fn download_and_cache(&self, url: &str) -> bool {
        let Some(domain) = domain_of(url) else {
            tracing::debug!(url = url, "no host in url; skipping icon");
            return false;
        };
        let path = self.inner.settings.dir.join(icon_file_name(&domain));

        if is_fresh(&path, self.inner.settings.file_max_age) {
            return true;
        }
        if !self.inner.status.should_check(url) {
            return false;
        }

        let Ok(_permit) = self.inner.permits.acquire().await else {
            return false;
        };

        let fetched = match timeout(self.inner.settings.download_timeout, self.inner.source.fetch(&domain)).await {
            Ok(result) => result,
            Err(_) => Err(IconError::Timeout),
        };
        let stored = fetched.and_then(|bytes| snapshot::write_bytes(&path, &bytes).map_err(IconError::from));

        match stored {
            Ok(()) => {
                tracing::debug!(domain = %domain, "icon cached");
                self.inner.status.mark(url, true);
                true
            }
            Err(e) => {
                tracing::debug!(domain = %domain, error = %e, "icon unavailable");
                self.inner.status.mark(url, false);
                false
            }
        }
    }

    /// Local icon for `url`, or the fallback asset. Only checks existence.
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.icon_path(url)
            .filter(|p| p.exists())
            .unwrap_or_else(|| self.inner.settings.fallback.clone())
    }

    /// Prefetch icons for a freshly listed vault.
    ///
    /// The first `initial_batch` items by name are awaited; the rest are
    /// fetched by a background task that replaces any previous one.
    pub async fn prime_batches(&self, items: &[VaultItem]) -> PrimeReport {
        let mut sorted: Vec<&VaultItem> = items.iter().collect();
        sorted.sort_by_cached_key(|i| i.name.to_lowercase());

        let mut urls: Vec<String> = sorted
            .into_iter()
            .filter_map(|i| i.first_web_uri().map(str::to_string))
            .collect();
        let rest = urls.split_off(urls.len().min(self.inner.settings.initial_batch));

        self.cancel_background();

        let mut report = PrimeReport {
            deferred: rest.len(),
            ..PrimeReport::default()
        };
        let mut batch = self.spawn_all(urls);
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok(true) => report.fetched += 1,
                _ => report.failed += 1,
            }
        }

        if !rest.is_empty() {
            let fetcher = self.clone();
            let handle = tokio::spawn(async move {
                let mut batch = fetcher.spawn_all(rest);
                let mut fetched = 0usize;
                while let Some(joined) = batch.join_next().await {
                    if matches!(joined, Ok(true)) {
                        fetched += 1;
                    }
                }
                tracing::debug!(fetched = fetched, "background icon batch finished");
            });
            *self.background() = Some(handle);
        }

        tracing::info!(
            fetched = report.fetched,
            failed = report.failed,
            deferred = report.deferred,
            "initial icon batch done"
        );
        report
    }

    fn spawn_all(&self, urls: Vec<String>) -> JoinSet<bool> {
        let mut set = JoinSet::new();
        for url in urls {
            let fetcher = self.clone();
            set.spawn(async move { fetcher.download_and_cache(&url).await });
        }
        set
    }

    fn background(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.background.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Abort the background batch, if any.
    pub fn cancel_background(&self) {
        if let Some(handle) = self.background().take() {
            handle.abort();
        }
    }

    /// Wait for the background batch to finish.
    pub async fn wait_background(&self) {
        let handle = self.background().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl IconResolver for IconFetcher {
    fn resolve(&self, items: &[VaultItem]) {
        for url in items.iter().filter_map(|i| i.first_web_uri()) {
            let fetcher = self.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                fetcher.download_and_cache(&url).await;
            });
        }
    }

    async fn prime(&self, items: &[VaultItem]) -> PrimeReport {
        self.prime_batches(items).await
    }
}

/// Host of an absolute URL, lowercased
fn domain_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

fn icon_file_name(domain: &str) -> String {
    let stem: String = domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.png")
}

fn is_fresh(path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < max_age)
}


#[cfg(test)]
mod tests {
    use super::mock::StubIconSource;
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> FetchSettings {
        FetchSettings {
            dir: dir.path().join("icons"),
            fallback: PathBuf::from("images/fallback.png"),
            concurrency: 10,
            initial_batch: 100,
            download_timeout: Duration::from_secs(5),
            file_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }

    fn fetcher(settings: FetchSettings, source: &Arc<StubIconSource>, dir: &TempDir) -> IconFetcher {
        let status = IconStatusCache::open(
            dir.path().join("icon-status.json"),
            chrono::Duration::days(7),
            Arc::new(ManualClock::default()),
        );
        IconFetcher::new(settings, status, source.clone())
    }

    fn site(name: &str, uri: &str) -> VaultItem {
        VaultItem {
            id: name.to_lowercase(),
            name: name.to_string(),
            username: None,
            has_totp: false,
            uris: vec![uri.to_string()],
        }
    }

    #[tokio::test]
    async fn test_download_writes_and_reuses_file() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubIconSource::serving(&["github.com"]));
        let icons = fetcher(settings(&dir), &source, &dir);

        assert!(icons.download_and_cache("https://GitHub.com/login").await);
        let path = icons.cached_path("https://github.com/");
        assert_eq!(path, dir.path().join("icons").join("github.com.png"));
        assert!(path.exists());
        assert!(icons.status().get("https://GitHub.com/login").unwrap().exists);

        assert!(icons.download_and_cache("https://github.com/other").await);
        assert_eq!(source.requests(), vec!["github.com"]);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubIconSource::serving(&[]));
        let icons = fetcher(settings(&dir), &source, &dir);

        assert!(!icons.download_and_cache("https://nothing.example").await);
        assert!(!icons.status().get("https://nothing.example").unwrap().exists);

        assert!(!icons.download_and_cache("https://nothing.example").await);
        assert_eq!(source.requests().len(), 1);
        assert_eq!(icons.cached_path("https://nothing.example"), PathBuf::from("images/fallback.png"));
    }

    #[tokio::test]
    async fn test_invalid_url_skipped() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubIconSource::serving(&[]));
        let icons = fetcher(settings(&dir), &source, &dir);

        assert!(!icons.download_and_cache("not a url").await);
        assert!(source.requests().is_empty());
        assert!(icons.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_download_times_out() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubIconSource::serving(&["slow.example"]).with_delay(Duration::from_secs(30)));
        let icons = fetcher(settings(&dir), &source, &dir);

        assert!(!icons.download_and_cache("https://slow.example").await);
        assert!(!icons.status().get("https://slow.example").unwrap().exists);
    }

    #[tokio::test]
    async fn test_prime_awaits_initial_batch_only() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubIconSource::serving(&["a.example", "b.example", "c.example", "d.example"]));
        let mut s = settings(&dir);
        s.initial_batch = 2;
        let icons = fetcher(s, &source, &dir);

        let items = vec![
            site("Delta", "https://d.example"),
            site("alpha", "https://a.example"),
            site("Charlie", "https://c.example"),
            site("Bravo", "https://b.example"),
            VaultItem {
                uris: vec!["androidapp://com.example".to_string()],
                ..site("Echo", "")
            },
        ];

        let report = icons.prime_batches(&items).await;
        assert_eq!(
            report,
            PrimeReport {
                fetched: 2,
                failed: 0,
                deferred: 2
            }
        );
        assert!(dir.path().join("icons/a.example.png").exists());
        assert!(dir.path().join("icons/b.example.png").exists());

        icons.wait_background().await;
        assert!(dir.path().join("icons/c.example.png").exists());
        assert!(dir.path().join("icons/d.example.png").exists());
        assert_eq!(source.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let domains: Vec<String> = (0..8).map(|i| format!("s{i}.example")).collect();
        let refs: Vec<&str> = domains.iter().map(String::as_str).collect();
        let source = Arc::new(StubIconSource::serving(&refs).with_delay(Duration::from_millis(20)));
        let mut s = settings(&dir);
        s.concurrency = 2;
        let icons = fetcher(s, &source, &dir);

        let items: Vec<VaultItem> = domains
            .iter()
            .map(|d| site(d, &format!("https://{d}")))
            .collect();
        let report = icons.prime_batches(&items).await;

        assert_eq!(report.fetched, 8);
        assert!(source.max_in_flight() <= 2);
    }

    #[test]
    fn test_icon_file_name_is_sanitized() {
        assert_eq!(icon_file_name("my-site.example"), "my-site.example.png");
        assert_eq!(icon_file_name("[::1]"), "___1_.png");
        assert_eq!(domain_of("https://Example.COM:8443/x"), Some("example.com".to_string()));
        assert_eq!(domain_of("mailto:me@example.com"), None);
    }
}
