//! Per-keystroke query entry point
//!
//! Every query walks the same gate: binary present, API key configured,
//! vault unlocked, helper running. Non-empty text is debounced; a newer
//! query aborts the pending one, so only the last keystroke in a burst
//! reaches the helper. Results come from the item cache when it has any,
//! otherwise from a live search that refreshes the cache and hands the
//! items to the icon resolver.
//!
//! Errors stop here: callers get a [`QueryResponse`], never a raw error.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use secrecy::SecretString;
use tokio::task::AbortHandle;

use crate::api::{ApiError, HelperApi};
use crate::cache::ItemCache;
use crate::config::{Config, Preferences};
use crate::icons::{IconResolver, PrimeReport};
use crate::notify::{Notification, Notifier};
use crate::protocol::{ItemRecord, VaultItem};
use crate::session::VaultSession;
use crate::{ErrorKind, LauncherError, Result};

/// What a query produced
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    /// The CLI binary cannot be found
    NotInstalled,
    /// API key not configured yet
    NeedsSetup,
    /// Vault is locked; the host should collect the master password
    Locked,
    Items(Vec<VaultItem>),
    /// A newer query replaced this one before it ran
    Superseded,
    Failed { message: String, kind: ErrorKind },
}

/// Outcome of a full sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The helper accepted the sync request
    pub synced: bool,
    /// Items re-listed into the cache, if listing worked
    pub items: Option<usize>,
    /// Initial icon batch, if icons ran
    pub icons: Option<PrimeReport>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        parts.push(if self.synced {
            "Vault synced".to_string()
        } else {
            "Sync request failed; using the local copy".to_string()
        });
        match self.items {
            Some(n) => parts.push(format!("{n} items cached")),
            None => parts.push("item list unavailable".to_string()),
        }
        if let Some(icons) = self.icons {
            parts.push(format!("{} icons fetched", icons.fetched));
        }
        parts.join(", ")
    }
}

pub struct QueryOrchestrator {
    session: Arc<VaultSession>,
    cache: Arc<ItemCache>,
    icons: Arc<dyn IconResolver>,
    notifier: Arc<dyn Notifier>,
    preferences: Arc<RwLock<Preferences>>,
    binary: String,
    debounce: Duration,
    pending: Mutex<Pending>,
}

/// Most recent query: its generation and, once past the gate, its task
#[derive(Default)]
struct Pending {
    generation: u64,
    task: Option<AbortHandle>,
}

impl QueryOrchestrator {
    pub fn new(
        config: &Config,
        session: Arc<VaultSession>,
        cache: Arc<ItemCache>,
        icons: Arc<dyn IconResolver>,
        notifier: Arc<dyn Notifier>,
        preferences: Arc<RwLock<Preferences>>,
    ) -> Self {
        Self {
            session,
            cache,
            icons,
            notifier,
            preferences,
            binary: config.cli.binary.display().to_string(),
            debounce: config.debounce(),
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn cache(&self) -> &Arc<ItemCache> {
        &self.cache
    }

    fn api(&self) -> &Arc<dyn HelperApi> {
        self.session.api()
    }

    fn show_icons(&self) -> bool {
        self.preferences
            .read()
            .map(|p| p.show_icons)
            .unwrap_or(true)
    }

    /// Binary present, API key configured, vault unlocked, helper running.
    ///
    /// A failed lock probe while a session key is held may only mean the
    /// helper died; it is restarted and the lock state probed again.
    async fn ready(&self) -> Result<()> {
        if !self.session.binary_located() {
            return Err(LauncherError::NotInstalled {
                binary: self.binary.clone(),
            });
        }
        if !self.session.check_login_configured() {
            return Err(LauncherError::NeedsSetup("api key not configured".into()));
        }

        let locked = self.session.is_locked(false).await;
        if locked && !self.session.has_session_key() {
            return Err(LauncherError::Locked);
        }
        self.session.supervisor().ensure_running().await?;
        if locked && self.session.is_locked(true).await {
            return Err(LauncherError::Locked);
        }
        Ok(())
    }

    /// Run one query. Non-empty text waits out the debounce first.
    ///
    /// Arrival supersedes every earlier query, including one still in the
    /// gate, so only the latest text reaches the helper.
    pub async fn query(self: &Arc<Self>, text: &str) -> QueryResponse {
        let generation = self.supersede();

        if let Err(e) = self.ready().await {
            return self.failure(e);
        }

        let term = text.trim().to_string();
        let delay = if term.is_empty() { Duration::ZERO } else { self.debounce };

        let task = {
            let mut pending = self.pending_slot();
            if pending.generation != generation {
                tracing::debug!(text = text, "query superseded in gate");
                return QueryResponse::Superseded;
            }
            let this = Arc::clone(self);
            let task = tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let term = (!term.is_empty()).then_some(term);
                this.search(term.as_deref()).await
            });
            pending.task = Some(task.abort_handle());
            task
        };

        match task.await {
            Ok(result) => self.respond(result),
            Err(e) if e.is_cancelled() => {
                tracing::debug!(text = text, "query superseded");
                QueryResponse::Superseded
            }
            Err(e) => self.failure(LauncherError::Internal(e.to_string())),
        }
    }

    fn pending_slot(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new generation and abort the previous query's task.
    fn supersede(&self) -> u64 {
        let mut pending = self.pending_slot();
        pending.generation += 1;
        if let Some(task) = pending.task.take() {
            task.abort();
        }
        pending.generation
    }

    /// Abort the query in flight, if any.
    pub fn cancel_pending(&self) {
        self.supersede();
    }

    async fn search(&self, term: Option<&str>) -> Result<Vec<VaultItem>> {
        let cached = self.cache.search(term.unwrap_or_default());
        if !cached.is_empty() {
            self.session.touch();
            return Ok(cached);
        }

        let items = self.api().list_items(term).await?;
        tracing::debug!(term = ?term, count = items.len(), "live search");

        if let Err(e) = self.cache.update(&items) {
            tracing::warn!(error = %e, "failed to update item cache");
        }
        if self.show_icons() {
            self.icons.resolve(&items);
        }
        self.session.touch();
        Ok(items)
    }

    fn respond(&self, result: Result<Vec<VaultItem>>) -> QueryResponse {
        match result {
            Ok(items) => QueryResponse::Items(items),
            Err(e) => self.failure(e),
        }
    }

    fn failure(&self, error: LauncherError) -> QueryResponse {
        match error {
            LauncherError::NotInstalled { .. } => QueryResponse::NotInstalled,
            LauncherError::NeedsSetup(_) => QueryResponse::NeedsSetup,
            LauncherError::Locked | LauncherError::Api(ApiError::Unauthorized) => QueryResponse::Locked,
            other => {
                let kind = other.kind();
                tracing::error!(error = %other, kind = ?kind, "query failed");
                QueryResponse::Failed {
                    message: other.to_string(),
                    kind,
                }
            }
        }
    }

    /// Clear the cache, resync the helper, re-list and re-prime.
    ///
    /// A failed sync request or listing narrows the report instead of
    /// aborting the steps that already succeeded.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.ready().await?;
        self.cancel_pending();

        if let Err(e) = self.cache.clear() {
            tracing::warn!(error = %e, "failed to clear item cache");
        }

        let synced = match self.api().sync().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "helper sync failed");
                false
            }
        };

        let items = match self.api().list_items(None).await {
            Ok(items) => Some(items),
            Err(e) => {
                tracing::warn!(error = %e, "listing items after sync failed");
                None
            }
        };

        let mut report = SyncReport {
            synced,
            items: items.as_ref().map(Vec::len),
            icons: None,
        };
        if let Some(items) = &items {
            if let Err(e) = self.cache.update(items) {
                tracing::warn!(error = %e, "failed to update item cache");
            }
            if self.show_icons() {
                report.icons = Some(self.icons.prime(items).await);
            }
        }

        let notification = if !synced && items.is_none() {
            Notification::SyncFailed {
                reason: "the helper could neither sync nor list items".into(),
            }
        } else {
            Notification::SyncCompleted {
                summary: report.summary(),
            }
        };
        self.notifier.notify(notification);
        self.session.touch();
        tracing::info!(synced = report.synced, items = ?report.items, "sync finished");
        Ok(report)
    }

    async fn item(&self, id: &str) -> Result<ItemRecord> {
        self.ready().await?;
        let record = self.api().item(id).await?;
        self.session.touch();
        Ok(record)
    }

    /// Password of item `id`
    pub async fn password(&self, id: &str) -> Result<SecretString> {
        let record = self.item(id).await?;
        record
            .login
            .and_then(|l| l.password)
            .filter(|p| !p.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| LauncherError::Internal(format!("item {id} has no password")))
    }

    /// Username of item `id`, if it has one
    pub async fn username(&self, id: &str) -> Result<Option<String>> {
        let record = self.item(id).await?;
        Ok(record.login.and_then(|l| l.username).filter(|u| !u.is_empty()))
    }

    /// Current one-time code of item `id`
    pub async fn totp(&self, id: &str) -> Result<SecretString> {
        self.ready().await?;
        let code = self.api().totp(id).await?;
        self.session.touch();
        Ok(SecretString::from(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::StubApi;
    use crate::backend::mock::ScriptedCli;
    use crate::clock::Clock;
    use crate::icons::testing::RecordingResolver;
    use crate::session::testing::*;
    use crate::session::LockState;
    use secrecy::ExposeSecret;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        f: Fixture,
        resolver: Arc<RecordingResolver>,
        preferences: Arc<RwLock<Preferences>>,
        orchestrator: Arc<QueryOrchestrator>,
        _dir: TempDir,
    }

    fn git_items() -> Vec<VaultItem> {
        vec![
            VaultItem {
                id: "1".into(),
                name: "GitHub".into(),
                username: Some("octo".into()),
                has_totp: true,
                uris: vec!["https://github.com".into()],
            },
            VaultItem {
                id: "2".into(),
                name: "GitLab".into(),
                username: None,
                has_totp: false,
                uris: vec![
                    "androidapp://com.gitlab".into(),
                    "https://gitlab.com/users/sign_in".into(),
                ],
            },
        ]
    }

    fn harness_with(cli: ScriptedCli, configured: bool) -> Harness {
        let config = fast_config();
        let f = fixture_with(config.clone(), cli, StubApi::with_items(git_items()));
        if configured {
            f.session
                .save_api_key("user.1", SecretString::from("s".to_string()))
                .unwrap();
        }

        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = f.clock.clone();
        let cache = Arc::new(ItemCache::open(dir.path().join("items.json"), config.item_ttl(), clock));
        let resolver = Arc::new(RecordingResolver::default());
        let preferences = Arc::new(RwLock::new(Preferences::default()));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            &config,
            f.session.clone(),
            cache,
            resolver.clone(),
            f.notifier.clone(),
            preferences.clone(),
        ));

        Harness {
            f,
            resolver,
            preferences,
            orchestrator,
            _dir: dir,
        }
    }

    async fn unlocked() -> Harness {
        let h = harness_with(unlocking_cli(|p| p.to_string()), true);
        assert!(h.f.session.unlock(&password()).await.unwrap());
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_search_fills_cache_and_resolves_icons() {
        let h = unlocked().await;

        let response = h.orchestrator.query("git").await;

        assert_eq!(response, QueryResponse::Items(git_items()));
        assert_eq!(h.f.api.searches(), vec![Some("git".to_string())]);
        assert_eq!(h.orchestrator.cache().stats().entries, 2);
        assert!(h.orchestrator.cache().is_valid());
        assert_eq!(
            h.resolver.urls(),
            vec!["https://github.com", "https://gitlab.com/users/sign_in"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_live_search() {
        let h = unlocked().await;
        h.orchestrator.query("git").await;

        let response = h.orchestrator.query("LAB").await;

        match response {
            QueryResponse::Items(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "2");
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(h.f.api.searches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_keystroke_cancels_pending_search() {
        let h = unlocked().await;

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.query("a").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = h.orchestrator.query("ab").await;

        assert_eq!(first.await.unwrap(), QueryResponse::Superseded);
        assert!(matches!(second, QueryResponse::Items(_)));
        assert_eq!(h.f.api.searches(), vec![Some("ab".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gate_loses_to_newer_keystroke() {
        let h = unlocked().await;
        h.f.clock.advance(chrono::Duration::seconds(6));
        h.f.api.delay_status(&[Duration::from_millis(200)]);

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.query("a").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = h.orchestrator.query("ab").await;

        assert_eq!(first.await.unwrap(), QueryResponse::Superseded);
        assert!(matches!(second, QueryResponse::Items(_)));
        assert_eq!(h.f.api.searches(), vec![Some("ab".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_keystrokes_both_search() {
        let h = unlocked().await;

        h.orchestrator.query("zz").await;
        h.orchestrator.cache().clear().unwrap();
        h.orchestrator.query("zzz").await;

        assert_eq!(
            h.f.api.searches(),
            vec![Some("zz".to_string()), Some("zzz".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_text_lists_everything() {
        let h = unlocked().await;

        let response = h.orchestrator.query("   ").await;

        assert_eq!(response, QueryResponse::Items(git_items()));
        assert_eq!(h.f.api.searches(), vec![None]);
    }

    #[tokio::test]
    async fn test_not_installed_touches_nothing() {
        let h = harness_with(ScriptedCli::succeeding().not_installed(), true);

        assert_eq!(h.orchestrator.query("git").await, QueryResponse::NotInstalled);
        assert!(h.f.api.searches().is_empty());
        assert_eq!(h.f.api.status_calls(), 0);
        assert_eq!(h.f.cli.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_needs_setup_before_locked() {
        let h = harness_with(unlocking_cli(|p| p.to_string()), false);
        assert_eq!(h.orchestrator.query("git").await, QueryResponse::NeedsSetup);
    }

    #[tokio::test]
    async fn test_locked_vault() {
        let h = harness_with(unlocking_cli(|p| p.to_string()), true);

        assert_eq!(h.orchestrator.query("git").await, QueryResponse::Locked);
        assert!(h.f.api.searches().is_empty());
        assert!(matches!(
            h.orchestrator.password("1").await,
            Err(LauncherError::Locked)
        ));
    }

    #[tokio::test]
    async fn test_crashed_helper_is_restarted_not_locked() {
        let h = unlocked().await;
        h.f.cli.crash_children();
        h.f.api.fail_next_status(1);
        h.f.clock.advance(chrono::Duration::seconds(6));

        let response = h.orchestrator.query("").await;

        assert_eq!(response, QueryResponse::Items(git_items()));
        assert_eq!(h.f.cli.spawn_count(), 2);
        assert_eq!(h.f.cli.live_children(), 1);
        assert_eq!(h.f.session.lock_state(), LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_live_failure_is_converted() {
        let h = unlocked().await;
        h.f.api.list_fails.store(true, Ordering::SeqCst);

        match h.orchestrator.query("").await {
            QueryResponse::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Transient),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_icons_respect_preference() {
        let h = unlocked().await;
        h.preferences.write().unwrap().show_icons = false;

        h.orchestrator.query("").await;
        assert!(h.resolver.urls().is_empty());
    }

    #[tokio::test]
    async fn test_sync_replaces_cache() {
        let h = unlocked().await;
        h.orchestrator
            .cache()
            .update(&[VaultItem {
                id: "stale".into(),
                name: "Deleted login".into(),
                username: None,
                has_totp: false,
                uris: vec![],
            }])
            .unwrap();

        let report = h.orchestrator.sync().await.unwrap();

        assert!(report.synced);
        assert_eq!(report.items, Some(2));
        assert_eq!(report.icons.map(|i| i.fetched), Some(2));
        assert_eq!(h.f.api.sync_calls(), 1);
        assert!(h.orchestrator.cache().search("deleted").is_empty());
        assert_eq!(h.orchestrator.cache().stats().entries, 2);
        assert!(matches!(
            h.f.notifier.seen().last(),
            Some(Notification::SyncCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_degrades_when_helper_sync_fails() {
        let h = unlocked().await;
        h.f.api.sync_fails.store(true, Ordering::SeqCst);

        let report = h.orchestrator.sync().await.unwrap();

        assert!(!report.synced);
        assert_eq!(report.items, Some(2));
        assert_eq!(h.orchestrator.cache().stats().entries, 2);
        match h.f.notifier.seen().last() {
            Some(Notification::SyncCompleted { summary }) => {
                assert!(summary.starts_with("Sync request failed"))
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_degrades_when_listing_fails() {
        let h = unlocked().await;
        h.f.api.list_fails.store(true, Ordering::SeqCst);

        let report = h.orchestrator.sync().await.unwrap();
        assert!(report.synced);
        assert_eq!(report.items, None);
        assert!(report.icons.is_none());
        assert!(report.summary().contains("item list unavailable"));

        h.f.api.sync_fails.store(true, Ordering::SeqCst);
        h.orchestrator.sync().await.unwrap();
        assert!(matches!(
            h.f.notifier.seen().last(),
            Some(Notification::SyncFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_item_actions() {
        let h = unlocked().await;
        h.f.api.set_password("1", "hunter2");

        let password = h.orchestrator.password("1").await.unwrap();
        assert_eq!(password.expose_secret(), "hunter2");
        assert_eq!(h.orchestrator.username("1").await.unwrap().as_deref(), Some("octo"));
        assert_eq!(h.orchestrator.username("2").await.unwrap(), None);
        assert_eq!(h.orchestrator.totp("1").await.unwrap().expose_secret(), "123456");

        assert!(h.orchestrator.password("2").await.is_err());
        assert!(h.orchestrator.totp("2").await.is_err());
    }
}
