//! User-facing notifications
//!
//! Components report noteworthy events (auto-lock, sync results) through a
//! [`Notifier`]; the host decides how they are shown. Delivery is
//! fire-and-forget and never blocks the caller.

use std::sync::{Arc, RwLock};

use crate::config::{Preferences, Toggle};

/// Notification sink
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Events worth telling the user about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The vault was locked after the idle timeout
    AutoLocked { idle_secs: u64 },
    /// A user-triggered sync finished
    SyncCompleted { summary: String },
    /// A user-triggered sync could not complete
    SyncFailed { reason: String },
}

impl Notification {
    /// Preference that gates this notification, if any
    pub fn toggle(&self) -> Option<Toggle> {
        match self {
            Notification::AutoLocked { .. } => Some(Toggle::NotifyOnAutoLock),
            Notification::SyncCompleted { .. } => Some(Toggle::NotifyOnSync),
            Notification::SyncFailed { .. } => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notification::AutoLocked { .. } => "Vault locked",
            Notification::SyncCompleted { .. } => "Vault synced",
            Notification::SyncFailed { .. } => "Sync failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notification::AutoLocked { idle_secs } => {
                format!("Locked after {idle_secs}s of inactivity")
            }
            Notification::SyncCompleted { summary } => summary.clone(),
            Notification::SyncFailed { reason } => reason.clone(),
        }
    }
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::info!(
            title = notification.title(),
            message = %notification.message(),
            "notification"
        );
    }
}

/// Drops notifications whose preference toggle is switched off.
pub struct PreferenceGate {
    inner: Arc<dyn Notifier>,
    preferences: Arc<RwLock<Preferences>>,
}

impl PreferenceGate {
    pub fn new(inner: Arc<dyn Notifier>, preferences: Arc<RwLock<Preferences>>) -> Self {
        Self { inner, preferences }
    }
}

impl Notifier for PreferenceGate {
    fn notify(&self, notification: Notification) {
        if let Some(toggle) = notification.toggle() {
            let enabled = self
                .preferences
                .read()
                .map(|p| p.get(toggle))
                .unwrap_or(true);
            if !enabled {
                tracing::debug!(toggle = toggle.key(), "notification suppressed");
                return;
            }
        }
        self.inner.notify(notification);
    }
}
