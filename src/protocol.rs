//! Wire types for the `bw serve` loopback API and `bw` JSON output
//!
//! Every API response is wrapped in a `{ "success": bool, "data": ... }`
//! envelope; list responses nest the array one level deeper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The common response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

/// `data` of a list response
#[derive(Debug, Clone, Deserialize)]
pub struct ListData<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// `data` of `GET /status`
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub template: StatusTemplate,
}

/// Vault status as reported by the helper or by `bw status`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTemplate {
    pub status: LockStatus,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Lock status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Unlocked,
    Locked,
    Unauthenticated,
    #[serde(other)]
    Unknown,
}

/// `data` of `GET /object/totp/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct TotpData {
    pub data: String,
}

/// A vault item as returned by the helper.
///
/// Only the fields this crate reads are modelled; the password is kept as a
/// plain string only until it is moved into a `SecretString`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub login: Option<LoginRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRecord {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub totp: Option<String>,
    #[serde(default)]
    pub uris: Option<Vec<UriRecord>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UriRecord {
    #[serde(default)]
    pub uri: Option<String>,
}

/// Lightweight, non-secret projection of a vault item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub has_totp: bool,
    #[serde(default)]
    pub uris: Vec<String>,
}

impl VaultItem {
    /// First `http://` or `https://` URI, if any
    pub fn first_web_uri(&self) -> Option<&str> {
        self.uris.iter().map(String::as_str).find(|u| {
            let lower = u.to_ascii_lowercase();
            lower.starts_with("http://") || lower.starts_with("https://")
        })
    }
}

impl From<ItemRecord> for VaultItem {
    fn from(record: ItemRecord) -> Self {
        let login = record.login.unwrap_or_default();
        Self {
            id: record.id,
            name: record.name,
            username: login.username.filter(|u| !u.is_empty()),
            has_totp: login.totp.is_some_and(|t| !t.is_empty()),
            uris: login
                .uris
                .unwrap_or_default()
                .into_iter()
                .filter_map(|u| u.uri)
                .filter(|u| !u.is_empty())
                .collect(),
        }
    }
}
