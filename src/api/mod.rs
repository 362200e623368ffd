//! HTTP client for the `bw serve` loopback API
//!
//! Every request carries the current session key as a bearer token. The key
//! is installed on unlock and withdrawn on lock; without it no request is
//! sent at all.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::{Envelope, ItemRecord, ListData, LockStatus, StatusData, TotpData, VaultItem};
use crate::session::SessionKey;

/// Errors from the helper API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("no session key; vault is locked")]
    Unauthorized,

    #[error("http request failed: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,

    #[error("helper returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("helper rejected request: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Http(_) | ApiError::Timeout)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// Operations offered by the helper process
#[async_trait]
pub trait HelperApi: Send + Sync {
    /// Install (or withdraw, with `None`) the bearer session key
    fn authorize(&self, key: Option<&SessionKey>);

    /// Whether a session key is installed
    fn is_authorized(&self) -> bool;

    /// `GET /status`
    async fn status(&self) -> Result<LockStatus, ApiError>;

    /// `POST /sync`
    async fn sync(&self) -> Result<(), ApiError>;

    /// `GET /list/object/items`, optionally filtered server-side
    async fn list_items(&self, search: Option<&str>) -> Result<Vec<VaultItem>, ApiError>;

    /// `GET /object/item/{id}` (includes the password)
    async fn item(&self, id: &str) -> Result<ItemRecord, ApiError>;

    /// `GET /object/totp/{id}`
    async fn totp(&self, id: &str) -> Result<String, ApiError>;
}

/// reqwest-backed [`HelperApi`]
pub struct HttpHelperApi {
    client: Client,
    base_url: String,
    session: RwLock<Option<SessionKey>>,
}

impl HttpHelperApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: RwLock::new(None),
        })
    }

    fn bearer(&self) -> Result<String, ApiError> {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .map(|k| k.expose().to_string())
            .ok_or(ApiError::Unauthorized)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = request.bearer_auth(self.bearer()?).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse("missing data".to_string()))
    }
}

#[async_trait]
impl HelperApi for HttpHelperApi {
    fn authorize(&self, key: Option<&SessionKey>) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = key.cloned();
    }

    fn is_authorized(&self) -> bool {
        self.session
            .read()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    async fn status(&self) -> Result<LockStatus, ApiError> {
        let data: StatusData = self.send(self.client.get(self.url("/status"))).await?;
        Ok(data.template.status)
    }

    async fn sync(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self.send(self.client.post(self.url("/sync"))).await?;
        Ok(())
    }

    async fn list_items(&self, search: Option<&str>) -> Result<Vec<VaultItem>, ApiError> {
        let mut request = self.client.get(self.url("/list/object/items"));
        if let Some(term) = search.filter(|t| !t.is_empty()) {
            request = request.query(&[("search", term)]);
        }
        let list: ListData<ItemRecord> = self.send(request).await?;
        Ok(list.data.into_iter().map(VaultItem::from).collect())
    }

    async fn item(&self, id: &str) -> Result<ItemRecord, ApiError> {
        self.send(self.client.get(self.url(&format!("/object/item/{id}"))))
            .await
    }

    async fn totp(&self, id: &str) -> Result<String, ApiError> {
        let totp: TotpData = self
            .send(self.client.get(self.url(&format!("/object/totp/{id}"))))
            .await?;
        Ok(totp.data)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::protocol::LoginRecord;

    /// Scripted helper API that records what it was asked
    pub struct StubApi {
        pub status: Mutex<LockStatus>,
        pub status_fails: AtomicBool,
        pub sync_fails: AtomicBool,
        pub list_fails: AtomicBool,
        items: Mutex<Vec<VaultItem>>,
        passwords: Mutex<HashMap<String, String>>,
        session: Mutex<Option<String>>,
        searches: Mutex<Vec<Option<String>>>,
        status_calls: AtomicUsize,
        status_delays: Mutex<VecDeque<Duration>>,
        status_failures: AtomicUsize,
        sync_calls: AtomicUsize,
    }

    impl StubApi {
        pub fn new() -> Self {
            Self {
                status: Mutex::new(LockStatus::Unlocked),
                status_fails: AtomicBool::new(false),
                sync_fails: AtomicBool::new(false),
                list_fails: AtomicBool::new(false),
                items: Mutex::new(Vec::new()),
                passwords: Mutex::new(HashMap::new()),
                session: Mutex::new(None),
                searches: Mutex::new(Vec::new()),
                status_calls: AtomicUsize::new(0),
                status_delays: Mutex::new(VecDeque::new()),
                status_failures: AtomicUsize::new(0),
                sync_calls: AtomicUsize::new(0),
            }
        }

        pub fn with_items(items: Vec<VaultItem>) -> Self {
            let api = Self::new();
            *api.items.lock().unwrap() = items;
            api
        }

        pub fn set_status(&self, status: LockStatus) {
            *self.status.lock().unwrap() = status;
        }

        /// Delay the next status calls, one entry per call
        pub fn delay_status(&self, delays: &[Duration]) {
            self.status_delays.lock().unwrap().extend(delays.iter().copied());
        }

        /// Fail the next `n` status calls
        pub fn fail_next_status(&self, n: usize) {
            self.status_failures.store(n, Ordering::SeqCst);
        }

        pub fn set_password(&self, id: &str, password: &str) {
            self.passwords
                .lock()
                .unwrap()
                .insert(id.to_string(), password.to_string());
        }

        pub fn session(&self) -> Option<String> {
            self.session.lock().unwrap().clone()
        }

        pub fn searches(&self) -> Vec<Option<String>> {
            self.searches.lock().unwrap().clone()
        }

        pub fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }

        pub fn sync_calls(&self) -> usize {
            self.sync_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HelperApi for StubApi {
        fn authorize(&self, key: Option<&SessionKey>) {
            *self.session.lock().unwrap() = key.map(|k| k.expose().to_string());
        }

        fn is_authorized(&self) -> bool {
            self.session.lock().unwrap().is_some()
        }

        async fn status(&self) -> Result<LockStatus, ApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.status_delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let scripted_failure = self
                .status_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scripted_failure || self.status_fails.load(Ordering::SeqCst) {
                return Err(ApiError::Http("connection refused".into()));
            }
            Ok(*self.status.lock().unwrap())
        }

        async fn sync(&self) -> Result<(), ApiError> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            if self.sync_fails.load(Ordering::SeqCst) {
                return Err(ApiError::Rejected("sync failed".into()));
            }
            Ok(())
        }

        async fn list_items(&self, search: Option<&str>) -> Result<Vec<VaultItem>, ApiError> {
            if !self.is_authorized() {
                return Err(ApiError::Unauthorized);
            }
            self.searches.lock().unwrap().push(search.map(str::to_string));
            if self.list_fails.load(Ordering::SeqCst) {
                return Err(ApiError::Timeout);
            }
            Ok(self.items.lock().unwrap().clone())
        }

        async fn item(&self, id: &str) -> Result<ItemRecord, ApiError> {
            let items = self.items.lock().unwrap();
            let item = items
                .iter()
                .find(|i| i.id == id)
                .ok_or_else(|| ApiError::Status {
                    status: 404,
                    message: "Not found.".into(),
                })?;
            Ok(ItemRecord {
                id: item.id.clone(),
                name: item.name.clone(),
                login: Some(LoginRecord {
                    username: item.username.clone(),
                    password: self.passwords.lock().unwrap().get(id).cloned(),
                    totp: item.has_totp.then(|| "otpauth://totp/x".to_string()),
                    uris: None,
                }),
            })
        }

        async fn totp(&self, id: &str) -> Result<String, ApiError> {
            let items = self.items.lock().unwrap();
            match items.iter().find(|i| i.id == id) {
                Some(item) if item.has_totp => Ok("123456".to_string()),
                _ => Err(ApiError::Rejected("no TOTP".into())),
            }
        }
    }
}
