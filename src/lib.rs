//! bw-launcher - launcher-side access to a Bitwarden vault
//!
//! This library mediates a launcher's access to the `bw` CLI and its
//! long-lived `bw serve` helper: session locking, helper supervision, a
//! persisted item cache and background favicon prefetch.

pub mod api;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod icons;
pub mod notify;
pub mod orchestrator;
pub mod protocol;
pub mod redact;
pub mod session;
pub mod shell;
pub mod snapshot;
pub mod supervisor;

use thiserror::Error;

/// Main error type for bw-launcher operations
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("bw CLI not found: {binary}")]
    NotInstalled { binary: String },

    #[error("setup incomplete: {0}")]
    NeedsSetup(String),

    #[error("CLI state is corrupted: {0}")]
    FatalSetup(String),

    #[error("vault is locked")]
    Locked,

    #[error("backend error: {0}")]
    Backend(#[from] backend::BackendError),

    #[error("helper api error: {0}")]
    Api(#[from] api::ApiError),

    #[error("helper process error: {0}")]
    Supervisor(#[from] supervisor::SupervisorError),

    #[error("credential store error: {0}")]
    Credentials(#[from] credentials::CredentialError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to decide how an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or timeout; "try again"
    Transient,
    /// Missing binary or credentials; actionable setup prompt
    Configuration,
    /// Broken external CLI state; needs remediation
    FatalSetup,
    /// Port or process already in use and not resolvable
    ResourceConflict,
    /// Anything else
    Internal,
}

impl LauncherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::NotInstalled { .. }
            | LauncherError::NeedsSetup(_)
            | LauncherError::Config(_)
            | LauncherError::Locked => ErrorKind::Configuration,
            LauncherError::FatalSetup(_) => ErrorKind::FatalSetup,
            LauncherError::Backend(e) if e.is_transient() => ErrorKind::Transient,
            LauncherError::Api(e) if e.is_transient() => ErrorKind::Transient,
            LauncherError::Supervisor(e) => e.kind(),
            LauncherError::Credentials(_) => ErrorKind::Configuration,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type alias for bw-launcher operations
pub type Result<T> = std::result::Result<T, LauncherError>;
