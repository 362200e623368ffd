//! Where icon bytes come from.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IconError {
    #[error("no icon for {0}")]
    NotFound(String),

    #[error("icon request failed: {0}")]
    Http(String),

    #[error("icon download timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote icon lookup by host name
#[async_trait]
pub trait IconSource: Send + Sync {
    async fn fetch(&self, domain: &str) -> Result<Vec<u8>, IconError>;
}

/// Third-party favicon service: `GET <service>?domain=<host>&sz=<size>`
pub struct FaviconService {
    client: Client,
    service_url: String,
    size: u32,
}

impl FaviconService {
    pub fn new(service_url: impl Into<String>, size: u32, timeout: Duration) -> Result<Self, IconError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IconError::Http(e.to_string()))?;
        Ok(Self {
            client,
            service_url: service_url.into(),
            size,
        })
    }
}

#[async_trait]
impl IconSource for FaviconService {
    async fn fetch(&self, domain: &str) -> Result<Vec<u8>, IconError> {
        let size = self.size.to_string();
        let response = self
            .client
            .get(&self.service_url)
            .query(&[("domain", domain), ("sz", size.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IconError::Timeout
                } else {
                    IconError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(IconError::NotFound(domain.to_string()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IconError::Http(e.to_string()))?;
        if bytes.is_empty() {
            return Err(IconError::NotFound(domain.to_string()));
        }
        Ok(bytes.to_vec())
    }
}
