//! Supervisor for the long-lived `bw serve` helper
//!
//! Guarantees at most one tracked helper, bound to the configured port and
//! holding the current session key. Starting clears the way first: untracked
//! `bw serve` instances are killed (they cannot be trusted to hold our
//! session) and whoever owns the port is terminated.

mod process;

pub use process::{ProcessTable, SystemProcessTable};

#[cfg(test)]
pub use process::mock;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::HelperApi;
use crate::backend::{BackendError, CliRunner, HelperChild};
use crate::config::ServerConfig;
use crate::session::SessionKey;
use crate::ErrorKind;

/// Poll interval while waiting for a process or port to go away
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Errors from helper supervision
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("bw CLI not found")]
    CliMissing,

    #[error("no session key; unlock the vault first")]
    SessionRequired,

    #[error("untracked helper (pid {pid}) did not exit")]
    ExternalInstance { pid: u32 },

    #[error("port {port} is in use by another process")]
    PortInUse { port: u16 },

    #[error("helper failed to start after {attempts} readiness checks")]
    StartFailed { attempts: u32 },

    #[error("failed to launch helper: {0}")]
    Spawn(#[from] BackendError),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::CliMissing | SupervisorError::SessionRequired => {
                ErrorKind::Configuration
            }
            SupervisorError::ExternalInstance { .. } | SupervisorError::PortInUse { .. } => {
                ErrorKind::ResourceConflict
            }
            SupervisorError::Spawn(e) if e.is_transient() => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }
}

/// Snapshot of the tracked helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperProcessInfo {
    pub pid: Option<u32>,
    pub port: u16,
    pub running: bool,
}

struct TrackedHelper {
    child: Box<dyn HelperChild>,
    port: u16,
}

#[derive(Default)]
struct SupervisorState {
    helper: Option<TrackedHelper>,
    session_key: Option<SessionKey>,
}

/// Owner of the helper process
pub struct Supervisor {
    cli: Arc<dyn CliRunner>,
    api: Arc<dyn HelperApi>,
    processes: Arc<dyn ProcessTable>,
    config: ServerConfig,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        config: ServerConfig,
        cli: Arc<dyn CliRunner>,
        api: Arc<dyn HelperApi>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            cli,
            api,
            processes,
            config,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    /// Replace the session key the helper must hold.
    ///
    /// A helper started with a different key is stopped; call
    /// [`Supervisor::ensure_running`] afterwards to start one with the new key.
    pub async fn set_session_key(&self, key: Option<SessionKey>) {
        let mut state = self.state.lock().await;
        let changed = match (&state.session_key, &key) {
            (Some(old), Some(new)) => old.expose() != new.expose(),
            (None, None) => false,
            _ => true,
        };
        state.session_key = key;
        if changed {
            self.teardown_locked(&mut state).await;
        }
    }

    pub async fn has_session_key(&self) -> bool {
        self.state.lock().await.session_key.is_some()
    }

    /// Start the helper unless a tracked one is alive and answering.
    ///
    /// A tracked helper that has exited or fails the status probe is
    /// replaced.
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if let Some(helper) = state.helper.as_mut() {
            let pid = helper.child.id();
            if !helper.child.is_alive() {
                tracing::warn!(pid = ?pid, "tracked helper has exited");
            } else {
                match self.api.status().await {
                    Ok(_) => return Ok(()),
                    Err(e) => tracing::warn!(pid = ?pid, error = %e, "tracked helper is unresponsive"),
                }
            }
        }
        self.start_locked(&mut state).await
    }

    /// Kill the helper and forget the session key. A new unlock is required
    /// before the helper can run again.
    pub async fn restart(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut helper) = state.helper.take() {
            if let Err(e) = helper.child.kill().await {
                tracing::warn!(error = %e, "failed to kill helper");
            }
        }
        state.session_key = None;
        tracing::info!("helper reset; unlock required");
    }

    /// Graceful teardown of the tracked helper. Never fails.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.teardown_locked(&mut state).await;
    }

    /// Teardown plus forgetting the session key.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.teardown_locked(&mut state).await;
        state.session_key = None;
    }

    pub async fn info(&self) -> Option<HelperProcessInfo> {
        let mut state = self.state.lock().await;
        state.helper.as_mut().map(|h| HelperProcessInfo {
            pid: h.child.id(),
            port: h.port,
            running: h.child.is_alive(),
        })
    }

    async fn teardown_locked(&self, state: &mut SupervisorState) {
        let Some(mut helper) = state.helper.take() else {
            return;
        };
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let pid = helper.child.id();
        match helper.child.terminate(grace).await {
            Ok(()) => tracing::info!(pid = ?pid, "helper stopped"),
            Err(e) => tracing::warn!(pid = ?pid, error = %e, "failed to stop helper"),
        }
    }

    async fn start_locked(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        if self.cli.locate().is_none() {
            return Err(SupervisorError::CliMissing);
        }
        let key = state
            .session_key
            .clone()
            .ok_or(SupervisorError::SessionRequired)?;

        if let Some(mut stale) = state.helper.take() {
            let _ = stale.child.kill().await;
        }

        self.evict_untracked().await?;
        self.free_port().await?;

        let port = self.config.port;
        let child = self.cli.spawn_serve(&key, &self.config.host, port).await?;
        let mut helper = TrackedHelper { child, port };

        if let Err(e) = self.wait_ready().await {
            let _ = helper.child.kill().await;
            return Err(e);
        }

        tracing::info!(pid = ?helper.child.id(), port = port, "helper ready");
        state.helper = Some(helper);
        Ok(())
    }

    /// Kill `bw serve` instances we did not start.
    async fn evict_untracked(&self) -> Result<(), SupervisorError> {
        let name = self.cli.process_name();
        let pids = self.processes.find_helpers(&name);
        if pids.is_empty() {
            return Ok(());
        }

        for &pid in &pids {
            tracing::warn!(pid = pid, "killing untracked helper instance");
            self.processes.kill(pid);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.external_exit_wait_secs);
        loop {
            let remaining: Vec<u32> = pids
                .iter()
                .copied()
                .filter(|pid| self.processes.is_running(*pid))
                .collect();
            match remaining.first() {
                None => return Ok(()),
                Some(&pid) if Instant::now() >= deadline => {
                    return Err(SupervisorError::ExternalInstance { pid });
                }
                Some(_) => tokio::time::sleep(WAIT_POLL).await,
            }
        }
    }

    /// Terminate whoever listens on our port.
    async fn free_port(&self) -> Result<(), SupervisorError> {
        let (host, port) = (self.config.host.as_str(), self.config.port);
        if !self.processes.port_in_use(host, port).await {
            return Ok(());
        }

        match self.processes.port_owner(port).await {
            Some(pid) => {
                tracing::warn!(pid = pid, port = port, "terminating port owner");
                self.processes.kill(pid);
            }
            None => tracing::warn!(port = port, "port in use by unknown process"),
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.port_release_wait_secs);
        while self.processes.port_in_use(host, port).await {
            if Instant::now() >= deadline {
                return Err(SupervisorError::PortInUse { port });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), SupervisorError> {
        let attempts = self.config.ready_attempts;
        let interval = Duration::from_millis(self.config.ready_interval_ms);

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            match self.api.status().await {
                Ok(status) => {
                    tracing::debug!(attempt = attempt, status = ?status, "helper answered");
                    return Ok(());
                }
                Err(e) => tracing::debug!(attempt = attempt, error = %e, "helper not ready"),
            }
        }
        Err(SupervisorError::StartFailed { attempts })
    }
}
