//! Vault session: lock state, login and unlock
//!
//! [`VaultSession`] owns the authoritative belief about whether the vault is
//! unlocked and mediates every transition:
//! - API-key login through the CLI, with credentials from the credential store
//! - unlock via an ordered list of password delivery strategies
//! - lock, restart and shutdown, which clear the session key everywhere
//! - auto-lock after a configurable idle period
//!
//! The session key is shared with the supervisor (which starts the helper
//! with it) and the API client (which sends it as a bearer token). Each of
//! them guards its copy with its own lock; this type is the only writer.

mod delivery;
mod key;

pub use delivery::{default_strategies, DeliveryStrategy};
pub use key::SessionKey;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;

use crate::api::HelperApi;
use crate::backend::{CliRunner, Invocation};
use crate::clock::{self, Clock};
use crate::config::{CliConfig, Config, SessionConfig};
use crate::credentials::{CredentialStore, CLIENT_ID_KEY, CLIENT_SECRET_KEY};
use crate::notify::{Notification, Notifier};
use crate::protocol::{LockStatus, StatusTemplate};
use crate::supervisor::Supervisor;
use crate::{LauncherError, Result};

/// stderr of `bw login` when a session already exists
const ALREADY_LOGGED_IN: &str = "You are already logged in";

/// stderr of `bw login` when the CLI's data file is corrupted
const CORRUPT_STATE_SIGNATURE: &str = "Cannot read properties of null";

/// Resolution of the auto-lock timer
const AUTO_LOCK_TICK: Duration = Duration::from_secs(1);

/// Lock state of the vault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

struct SessionState {
    lock_state: LockState,
    session_key: Option<SessionKey>,
    last_lock_check: Option<DateTime<Utc>>,
    last_known_locked: bool,
    last_activity: DateTime<Utc>,
}

/// Credential vault session
pub struct VaultSession {
    cli: Arc<dyn CliRunner>,
    api: Arc<dyn HelperApi>,
    supervisor: Arc<Supervisor>,
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cli_config: CliConfig,
    config: SessionConfig,
    strategies: Vec<DeliveryStrategy>,
    state: Mutex<SessionState>,
    /// Serializes unlock / lock / restart
    transitions: tokio::sync::Mutex<()>,
}

impl VaultSession {
    pub fn new(
        config: &Config,
        cli: Arc<dyn CliRunner>,
        api: Arc<dyn HelperApi>,
        supervisor: Arc<Supervisor>,
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            cli,
            api,
            supervisor,
            store,
            notifier,
            clock,
            cli_config: config.cli.clone(),
            config: config.session.clone(),
            strategies: default_strategies(),
            state: Mutex::new(SessionState {
                lock_state: LockState::Locked,
                session_key: None,
                last_lock_check: None,
                last_known_locked: true,
                last_activity: now,
            }),
            transitions: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the password delivery strategies (tried in order).
    pub fn with_strategies(mut self, strategies: Vec<DeliveryStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_state(&self) -> LockState {
        self.state().lock_state
    }

    /// Whether an unlock produced a key that has not been cleared since.
    /// The vault may still read as locked if the helper stopped answering.
    pub fn has_session_key(&self) -> bool {
        self.state().session_key.is_some()
    }

    /// Helper API client authorized with this session's key
    pub fn api(&self) -> &Arc<dyn HelperApi> {
        &self.api
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Whether the CLI binary can be resolved. No process is started.
    pub fn binary_located(&self) -> bool {
        self.cli.locate().is_some()
    }

    /// Whether the CLI binary is present and answers `--version`.
    pub async fn is_installed(&self) -> bool {
        if self.cli.locate().is_none() {
            return false;
        }
        let inv = Invocation::new(["--version"], secs(self.cli_config.check_timeout_secs));
        match self.cli.run(&inv).await {
            Ok(out) => out.success && !out.stdout.is_empty(),
            Err(e) => {
                tracing::debug!(error = %e, "bw --version failed");
                false
            }
        }
    }

    /// True iff both halves of the API key are in the credential store.
    pub fn check_login_configured(&self) -> bool {
        [CLIENT_ID_KEY, CLIENT_SECRET_KEY].iter().all(|key| {
            matches!(self.store.retrieve(key), Ok(Some(secret)) if !secret.expose_secret().is_empty())
        })
    }

    /// Store the API key used by [`VaultSession::login`].
    pub fn save_api_key(&self, client_id: &str, client_secret: SecretString) -> Result<()> {
        if client_id.is_empty() || client_secret.expose_secret().is_empty() {
            return Err(LauncherError::NeedsSetup("client id and secret are required".into()));
        }
        self.store
            .save(CLIENT_ID_KEY, SecretString::from(client_id.to_owned()))?;
        self.store.save(CLIENT_SECRET_KEY, client_secret)?;
        tracing::info!("api key saved");
        Ok(())
    }

    /// Non-mutating `bw login --check`. Errors and timeouts count as "no".
    pub async fn verify_login(&self) -> bool {
        let inv = Invocation::new(["login", "--check"], secs(self.cli_config.check_timeout_secs));
        match self.cli.run(&inv).await {
            Ok(out) => out.success,
            Err(e) => {
                tracing::debug!(error = %e, "login check failed");
                false
            }
        }
    }

    /// Log in with the stored API key unless already logged in.
    pub async fn login(&self) -> Result<bool> {
        if self.verify_login().await {
            return Ok(true);
        }

        let client_id = self
            .store
            .retrieve(CLIENT_ID_KEY)?
            .ok_or_else(|| LauncherError::NeedsSetup("client id not configured".into()))?;
        let client_secret = self
            .store
            .retrieve(CLIENT_SECRET_KEY)?
            .ok_or_else(|| LauncherError::NeedsSetup("client secret not configured".into()))?;

        let inv = Invocation::new(["login", "--apikey"], secs(self.cli_config.login_timeout_secs))
            .masking(client_secret.expose_secret())
            .env("BW_CLIENTID", client_id)
            .env("BW_CLIENTSECRET", client_secret);

        let out = match self.cli.run(&inv).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %inv.scrub(&e.to_string()), "bw login failed");
                return Ok(false);
            }
        };

        if out.success {
            tracing::info!("logged in with api key");
            return Ok(true);
        }

        let stderr = inv.scrub(&out.stderr);
        if stderr.contains(ALREADY_LOGGED_IN) {
            tracing::info!("bw reports an existing login");
            Ok(true)
        } else if stderr.contains(CORRUPT_STATE_SIGNATURE) {
            tracing::error!(stderr = %stderr, "bw CLI state is corrupted");
            Err(LauncherError::FatalSetup(
                "the bw CLI data is corrupted; reinstall the Bitwarden CLI (or delete its \
                 data directory) and run setup again"
                    .into(),
            ))
        } else {
            tracing::warn!(code = ?out.code, stderr = %stderr, "bw login rejected");
            Ok(false)
        }
    }

    /// Unlock with the master password.
    ///
    /// Each delivery strategy is tried in order until one exits cleanly with
    /// a session key on stdout. The key is then handed to the API client and
    /// the supervisor, and the helper must report `unlocked` before this
    /// returns `true`.
    pub async fn unlock(&self, master_password: &SecretString) -> Result<bool> {
        let _transition = self.transitions.lock().await;
        let password = master_password.expose_secret();
        if password.is_empty() {
            return Ok(false);
        }

        let timeout = secs(self.cli_config.unlock_timeout_secs);
        let mut session_key = None;
        for strategy in &self.strategies {
            let inv = Invocation::new(strategy.args(password), timeout).masking(password);
            match self.cli.run(&inv).await {
                Ok(out) if out.success && !out.stdout.trim().is_empty() => {
                    tracing::info!(strategy = strategy.name, "unlock accepted");
                    session_key = Some(SessionKey::new(out.stdout.trim().to_string()));
                    break;
                }
                Ok(out) => tracing::warn!(
                    strategy = strategy.name,
                    code = ?out.code,
                    stderr = %inv.scrub(&out.stderr),
                    "unlock attempt rejected"
                ),
                Err(e) => tracing::warn!(
                    strategy = strategy.name,
                    error = %inv.scrub(&e.to_string()),
                    "unlock attempt failed"
                ),
            }
        }

        let Some(session_key) = session_key else {
            tracing::warn!("all unlock strategies failed");
            return Ok(false);
        };

        {
            let now = self.clock.now();
            let mut state = self.state();
            state.session_key = Some(session_key.clone());
            state.lock_state = LockState::Unlocked;
            state.last_lock_check = None;
            state.last_activity = now;
        }
        self.api.authorize(Some(&session_key));
        self.supervisor.set_session_key(Some(session_key)).await;

        if let Err(e) = self.supervisor.ensure_running().await {
            tracing::error!(error = %e, "helper failed to start after unlock");
            self.reset().await;
            return Err(e.into());
        }

        if self.confirm_unlocked().await {
            let now = self.clock.now();
            let mut state = self.state();
            state.last_lock_check = Some(now);
            state.last_known_locked = false;
            tracing::info!("vault unlocked");
            return Ok(true);
        }

        tracing::warn!("helper never reported unlocked");
        self.reset().await;
        Ok(false)
    }

    async fn confirm_unlocked(&self) -> bool {
        let attempts = self.config.unlock_confirm_attempts;
        let interval = Duration::from_millis(self.config.unlock_confirm_interval_ms);
        for attempt in 1..=attempts {
            match self.api.status().await {
                Ok(LockStatus::Unlocked) => return true,
                Ok(status) => tracing::debug!(attempt = attempt, status = ?status, "helper not unlocked yet"),
                Err(e) => tracing::debug!(attempt = attempt, error = %e, "status probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        false
    }

    /// Clear the session key, stop the helper and withdraw API authorization.
    pub async fn lock(&self) {
        let _transition = self.transitions.lock().await;
        self.reset().await;
        tracing::info!("vault locked");
    }

    async fn reset(&self) {
        {
            let mut state = self.state();
            state.session_key = None;
            state.lock_state = LockState::Locked;
            state.last_lock_check = None;
            state.last_known_locked = true;
        }
        self.api.authorize(None);
        self.supervisor.shutdown().await;
    }

    /// Force-kill the helper and require a fresh unlock.
    pub async fn restart_helper(&self) {
        let _transition = self.transitions.lock().await;
        {
            let mut state = self.state();
            state.session_key = None;
            state.lock_state = LockState::Locked;
            state.last_lock_check = None;
            state.last_known_locked = true;
        }
        self.api.authorize(None);
        self.supervisor.restart().await;
    }

    /// Whether the vault is locked.
    ///
    /// Without a session key this is `true` without probing. Otherwise a
    /// result younger than the cooldown is reused unless `force_refresh`.
    pub async fn is_locked(&self, force_refresh: bool) -> bool {
        let now = self.clock.now();
        {
            let state = self.state();
            if state.session_key.is_none() {
                return true;
            }
            if !force_refresh {
                if let Some(checked) = state.last_lock_check {
                    let cooldown = clock::saturating_seconds(self.config.lock_check_cooldown_secs);
                    if now - checked < cooldown {
                        return state.last_known_locked;
                    }
                }
            }
        }

        let locked = match self.api.status().await {
            Ok(status) => status != LockStatus::Unlocked,
            Err(e) => {
                tracing::debug!(error = %e, "status probe failed; treating as locked");
                true
            }
        };

        let mut state = self.state();
        state.last_lock_check = Some(now);
        state.last_known_locked = locked;
        if state.session_key.is_some() {
            state.lock_state = if locked { LockState::Locked } else { LockState::Unlocked };
        }
        locked
    }

    /// Record user activity; resets the idle clock.
    pub fn touch(&self) {
        let now = self.clock.now();
        self.state().last_activity = now;
    }

    /// One auto-lock tick. Returns true if the vault was locked by it.
    pub async fn check_idle(&self) -> bool {
        let threshold = self.config.auto_lock_secs;
        if threshold == 0 {
            return false;
        }

        let idle = {
            let state = self.state();
            if state.lock_state == LockState::Locked {
                return false;
            }
            self.clock.now() - state.last_activity
        };
        if idle < clock::saturating_seconds(threshold) {
            return false;
        }

        tracing::info!(idle_secs = idle.num_seconds(), "auto-locking vault");
        self.lock().await;
        self.notifier.notify(Notification::AutoLocked {
            idle_secs: idle.num_seconds().max(0) as u64,
        });
        true
    }

    /// Run [`VaultSession::check_idle`] every second until the task is aborted.
    pub fn spawn_auto_lock(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUTO_LOCK_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                session.check_idle().await;
            }
        })
    }

    /// `bw logout`, after locking.
    pub async fn logout(&self) -> Result<bool> {
        self.lock().await;
        let inv = Invocation::new(["logout"], secs(self.cli_config.command_timeout_secs));
        let out = self.cli.run(&inv).await?;
        if !out.success {
            tracing::warn!(stderr = %out.stderr, "bw logout failed");
        }
        Ok(out.success)
    }

    /// Point the CLI at a (self-hosted) server: `bw config server <url>`.
    pub async fn configure_server(&self, url: &str) -> Result<bool> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| LauncherError::Config(format!("invalid server url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LauncherError::Config(format!(
                "server url must be http(s): {url}"
            )));
        }

        let inv = Invocation::new(
            ["config", "server", parsed.as_str()],
            secs(self.cli_config.command_timeout_secs),
        );
        let out = self.cli.run(&inv).await?;
        if !out.success {
            tracing::warn!(stderr = %out.stderr, "bw config server failed");
        }
        Ok(out.success)
    }

    /// `bw status`, decoded.
    pub async fn cli_status(&self) -> Result<StatusTemplate> {
        let inv = Invocation::new(["status"], secs(self.cli_config.command_timeout_secs));
        let out = self.cli.run(&inv).await?;
        if !out.success {
            return Err(LauncherError::Backend(crate::backend::BackendError::CommandFailed(
                format!("bw status failed: {}", out.stderr),
            )));
        }
        Ok(serde_json::from_str(&out.stdout)?)
    }

    /// Lock and tear everything down. Never fails.
    pub async fn shutdown(&self) {
        self.lock().await;
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[cfg(test)]
pub mod testing {
    //! Shared session fixture for session and orchestrator tests.

    use super::*;
    use crate::api::mock::StubApi;
    use crate::backend::mock::ScriptedCli;
    use crate::backend::{BackendError, CommandOutput};
    use crate::clock::ManualClock;
    use crate::credentials::MemoryCredentialStore;
    use crate::notify::mock::RecordingNotifier;
    use crate::supervisor::mock::FakeProcessTable;

    pub const PASSWORD: &str = "correct horse";
    pub const SESSION: &str = "c2Vzc2lvbi1rZXk=";

    pub struct Fixture {
        pub cli: Arc<ScriptedCli>,
        pub api: Arc<StubApi>,
        pub store: Arc<MemoryCredentialStore>,
        pub notifier: Arc<RecordingNotifier>,
        pub clock: Arc<ManualClock>,
        pub supervisor: Arc<Supervisor>,
        pub session: Arc<VaultSession>,
    }

    pub fn fast_config() -> Config {
        let mut config = Config::default();
        config.server.ready_attempts = 2;
        config.server.ready_interval_ms = 1;
        config.server.external_exit_wait_secs = 0;
        config.server.port_release_wait_secs = 0;
        config.server.shutdown_grace_secs = 0;
        config.session.unlock_confirm_attempts = 3;
        config.session.unlock_confirm_interval_ms = 1;
        config
    }

    /// CLI that accepts the password only in the form `accepted(PASSWORD)`.
    pub fn unlocking_cli<F>(accepted: F) -> ScriptedCli
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        ScriptedCli::new(move |args| -> std::result::Result<CommandOutput, BackendError> {
            match args.first().map(String::as_str) {
                Some("unlock") if args[1] == accepted(PASSWORD) => Ok(CommandOutput::ok(SESSION)),
                Some("unlock") => Ok(CommandOutput::failed("Invalid master password.")),
                Some("--version") => Ok(CommandOutput::ok("2024.6.0")),
                _ => Ok(CommandOutput::ok("")),
            }
        })
    }

    pub fn fixture_with(config: Config, cli: ScriptedCli, api: StubApi) -> Fixture {
        let cli = Arc::new(cli);
        let api = Arc::new(api);
        let store = Arc::new(MemoryCredentialStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::default());
        let supervisor = Arc::new(Supervisor::new(
            config.server.clone(),
            cli.clone(),
            api.clone(),
            Arc::new(FakeProcessTable::default()),
        ));
        let session = Arc::new(VaultSession::new(
            &config,
            cli.clone(),
            api.clone(),
            supervisor.clone(),
            store.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        Fixture {
            cli,
            api,
            store,
            notifier,
            clock,
            supervisor,
            session,
        }
    }

    pub fn fixture(cli: ScriptedCli) -> Fixture {
        fixture_with(fast_config(), cli, StubApi::new())
    }

    pub fn password() -> SecretString {
        SecretString::from(PASSWORD.to_string())
    }
}
