//! Configuration loading for bw-launcher
//!
//! Configuration is loaded from a TOML file, with defaults that work out of
//! the box against a stock `bw` install on the default serve port.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::clock;
use crate::LauncherError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External CLI configuration
    pub cli: CliConfig,
    /// Helper process (`bw serve`) configuration
    pub server: ServerConfig,
    /// Session / lock configuration
    pub session: SessionConfig,
    /// Item cache configuration
    pub cache: CacheConfig,
    /// Icon prefetch configuration
    pub icons: IconConfig,
    /// Query configuration
    pub search: SearchConfig,
    /// User preferences
    pub preferences: Preferences,
}

/// External CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Path or name of the CLI binary
    pub binary: PathBuf,
    /// Timeout for `login --check` and `--version`
    pub check_timeout_secs: u64,
    /// Timeout for `login --apikey`
    pub login_timeout_secs: u64,
    /// Timeout for each `unlock` attempt
    pub unlock_timeout_secs: u64,
    /// Timeout for any other short-lived command
    pub command_timeout_secs: u64,
}

/// Helper process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host the helper binds and is queried on
    pub host: String,
    /// Fixed local port
    pub port: u16,
    /// Readiness probes after launch
    pub ready_attempts: u32,
    /// Delay between readiness probes in milliseconds
    pub ready_interval_ms: u64,
    /// How long to wait for an untracked instance to exit
    pub external_exit_wait_secs: u64,
    /// How long to wait for the port to be released
    pub port_release_wait_secs: u64,
    /// Grace period before a force kill on stop
    pub shutdown_grace_secs: u64,
    /// Timeout for each HTTP call to the helper
    pub request_timeout_secs: u64,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds before auto-lock (0 = disabled)
    pub auto_lock_secs: u64,
    /// Window in which a cached lock state is trusted
    pub lock_check_cooldown_secs: u64,
    /// Status probes after a successful unlock
    pub unlock_confirm_attempts: u32,
    /// Delay between unlock confirmation probes in milliseconds
    pub unlock_confirm_interval_ms: u64,
}

/// Item cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding both cache snapshots and the icon files
    pub dir: PathBuf,
    /// Item projection TTL in seconds
    pub item_ttl_secs: u64,
}

/// Icon prefetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IconConfig {
    /// Fetch icons at all
    pub enabled: bool,
    /// Maximum concurrent downloads
    pub concurrency: usize,
    /// Items fetched synchronously during a sync
    pub initial_batch: usize,
    /// Per-download timeout
    pub download_timeout_secs: u64,
    /// Days before a negative result is retried
    pub negative_retry_days: u64,
    /// Age after which an icon file is downloaded again
    pub file_max_age_secs: u64,
    /// Favicon service base URL
    pub service_url: String,
    /// Requested icon size in pixels
    pub size: u32,
    /// Shown for items without a cached icon
    pub fallback_icon: PathBuf,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Debounce delay for non-empty search text
    pub debounce_ms: u64,
}

/// Boolean user preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub notify_on_auto_lock: bool,
    pub notify_on_sync: bool,
    pub show_icons: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bw"),
            check_timeout_secs: 10,
            login_timeout_secs: 30,
            unlock_timeout_secs: 30,
            command_timeout_secs: 15,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8087,
            ready_attempts: 5,
            ready_interval_ms: 1000,
            external_exit_wait_secs: 5,
            port_release_wait_secs: 2,
            shutdown_grace_secs: 5,
            request_timeout_secs: 15,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_lock_secs: 0,
            lock_check_cooldown_secs: 5,
            unlock_confirm_attempts: 5,
            unlock_confirm_interval_ms: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: dirs::cache_dir()
                .map(|d| d.join("bw-launcher"))
                .unwrap_or_else(|| std::env::temp_dir().join("bw-launcher")),
            item_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 10,
            initial_batch: 100,
            download_timeout_secs: 5,
            negative_retry_days: 7,
            file_max_age_secs: 24 * 60 * 60,
            service_url: "https://www.google.com/s2/favicons".to_string(),
            size: 32,
            fallback_icon: PathBuf::from("images/bitwarden.png"),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            notify_on_auto_lock: true,
            notify_on_sync: true,
            show_icons: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self, LauncherError> {
        let config_path = path.cloned().unwrap_or_else(default_config_path);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .map_err(|e| LauncherError::Config(format!("failed to read config: {e}")))?;
            let config: Config = toml::from_str(&contents)
                .map_err(|e| LauncherError::Config(format!("failed to parse config: {e}")))?;
            Ok(config)
        } else {
            tracing::info!("no config file found at {}, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    pub fn item_cache_path(&self) -> PathBuf {
        self.cache.dir.join("items.json")
    }

    pub fn icon_status_path(&self) -> PathBuf {
        self.cache.dir.join("icon-status.json")
    }

    pub fn icon_dir(&self) -> PathBuf {
        self.cache.dir.join("icons")
    }

    /// Base URL of the helper's loopback API
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.server.host, self.server.port)
    }

    pub fn item_ttl(&self) -> chrono::Duration {
        clock::saturating_seconds(self.cache.item_ttl_secs)
    }

    pub fn icon_negative_retry(&self) -> chrono::Duration {
        clock::saturating_days(self.icons.negative_retry_days)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.search.debounce_ms)
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("bw-launcher").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("bw-launcher.toml"))
}

/// A boolean preference, addressed by a stable key rather than by the
/// label of whatever control displays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Toggle {
    NotifyOnAutoLock,
    NotifyOnSync,
    ShowIcons,
}

impl Toggle {
    pub const ALL: [Toggle; 3] = [Toggle::NotifyOnAutoLock, Toggle::NotifyOnSync, Toggle::ShowIcons];

    pub fn key(self) -> &'static str {
        match self {
            Toggle::NotifyOnAutoLock => "notify_on_auto_lock",
            Toggle::NotifyOnSync => "notify_on_sync",
            Toggle::ShowIcons => "show_icons",
        }
    }

    /// Field setter for this preference.
    pub fn setter(self) -> fn(&mut Preferences, bool) {
        match self {
            Toggle::NotifyOnAutoLock => |p: &mut Preferences, v: bool| p.notify_on_auto_lock = v,
            Toggle::NotifyOnSync => |p: &mut Preferences, v: bool| p.notify_on_sync = v,
            Toggle::ShowIcons => |p: &mut Preferences, v: bool| p.show_icons = v,
        }
    }

    pub fn getter(self) -> fn(&Preferences) -> bool {
        match self {
            Toggle::NotifyOnAutoLock => |p: &Preferences| p.notify_on_auto_lock,
            Toggle::NotifyOnSync => |p: &Preferences| p.notify_on_sync,
            Toggle::ShowIcons => |p: &Preferences| p.show_icons,
        }
    }
}

impl FromStr for Toggle {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Toggle::ALL
            .into_iter()
            .find(|t| t.key() == s)
            .ok_or_else(|| LauncherError::Config(format!("unknown preference: {s}")))
    }
}

impl Preferences {
    pub fn set(&mut self, toggle: Toggle, value: bool) {
        (toggle.setter())(self, value);
    }

    pub fn get(&self, toggle: Toggle) -> bool {
        (toggle.getter())(self)
    }
}
