//! Runner abstraction over the external `bw` CLI
//!
//! Short-lived invocations (`login`, `unlock`, `status`, ...) go through
//! [`CliRunner::run`]; the long-lived `bw serve` helper is started with
//! [`CliRunner::spawn_serve`] and handed back as a [`HelperChild`]. The trait
//! exists so the session and supervisor can be driven by a scripted CLI in
//! tests.

mod bw;

pub use bw::BwCli;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::redact;
use crate::session::SessionKey;

/// Errors that can occur when running the CLI
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("command timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout { .. })
    }
}

/// One short-lived CLI call.
///
/// Environment values are held as secrets. If a secret is registered with
/// [`Invocation::masking`], it is masked in [`Invocation::display_args`] and
/// [`Invocation::scrub`].
pub struct Invocation {
    pub args: Vec<String>,
    pub env: Vec<(String, SecretString)>,
    pub timeout: Duration,
    masked: Option<SecretString>,
}

impl Invocation {
    pub fn new<I, S>(args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout,
            masked: None,
        }
    }

    /// Add a process-scoped environment variable.
    pub fn env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Mask `secret` wherever this invocation is rendered.
    pub fn masking(mut self, secret: &str) -> Self {
        self.masked = Some(SecretString::from(secret.to_owned()));
        self
    }

    /// Arguments safe to log.
    pub fn display_args(&self) -> Vec<String> {
        self.args.iter().map(|a| self.scrub(a)).collect()
    }

    /// Remove the masked secret from arbitrary text (stderr, error messages).
    pub fn scrub(&self, text: &str) -> String {
        match &self.masked {
            Some(secret) => redact::scrub(text, secret.expose_secret()),
            None => text.to_string(),
        }
    }
}

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runner for the external CLI
#[async_trait]
pub trait CliRunner: Send + Sync {
    /// Executable name used to recognise helper instances in the process table
    fn process_name(&self) -> String;

    /// Resolve the binary to a path, if it exists
    fn locate(&self) -> Option<PathBuf>;

    /// Run a short-lived command to completion (bounded by its timeout)
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, BackendError>;

    /// Start `bw serve` bound to `host:port`, holding `session_key`
    async fn spawn_serve(
        &self,
        session_key: &SessionKey,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn HelperChild>, BackendError>;
}

/// A running helper process owned by the supervisor
#[async_trait]
pub trait HelperChild: Send + Sync {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Whether the process has not exited yet
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit, force-killing it after `grace`
    async fn terminate(&mut self, grace: Duration) -> Result<(), BackendError>;

    /// Kill immediately
    async fn kill(&mut self) -> Result<(), BackendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_masks_secret() {
        let inv = Invocation::new(["unlock", "'hunter2'", "--raw"], Duration::from_secs(1))
            .masking("hunter2");
        assert_eq!(inv.display_args(), vec!["unlock", "'********'", "--raw"]);
        assert_eq!(inv.args[1], "'hunter2'");
        assert_eq!(inv.scrub("Invalid master password hunter2"), "Invalid master password ********");
    }

    #[test]
    fn test_unmasked_invocation_passthrough() {
        let inv = Invocation::new(["status"], Duration::from_secs(1));
        assert_eq!(inv.display_args(), vec!["status"]);
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(BackendError::Timeout { timeout_secs: 1 }.is_transient());
        assert!(!BackendError::CommandFailed("x".into()).is_transient());
    }
}
