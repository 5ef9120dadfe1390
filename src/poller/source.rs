//! External Status Source
//!
//! Narrow interface to the external system that reports delivery state and
//! application receipts for a message.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::StatusSourceConfig;
use crate::delivery::{AppRecStatus, ExternalDeliveryState, RawDeliveryState};

/// One status entry as reported by the external system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStatus {
    pub delivery_state: ExternalDeliveryState,
    #[serde(default)]
    pub app_rec_status: Option<AppRecStatus>,
}

impl ExternalStatus {
    pub fn new(delivery_state: ExternalDeliveryState, app_rec_status: Option<AppRecStatus>) -> Self {
        Self {
            delivery_state,
            app_rec_status,
        }
    }

    pub fn raw_state(&self) -> RawDeliveryState {
        RawDeliveryState::new(Some(self.delivery_state), self.app_rec_status)
    }
}

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Invalid status source url: {0}")]
    InvalidUrl(String),

    #[error("Status request failed: {0}")]
    Request(String),

    #[error("Status source returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Failed to decode status response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::InvalidUrl(_) => "INVALID_URL",
            SourceError::Request(_) => "REQUEST_FAILED",
            SourceError::HttpStatus { .. } => "HTTP_STATUS",
            SourceError::Decode(_) => "DECODE_FAILED",
        }
    }
}

/// Status lookup by external reference id.
///
/// Returns every status entry known for the message, oldest first. An empty
/// list means the external system has nothing to report yet.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn get_status(&self, external_ref_id: &str) -> Result<Vec<ExternalStatus>, SourceError>;
}

/// HTTP adapter: `GET {base_url}/messages/{external_ref_id}/status`
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStatusSource {
    pub fn new(config: &StatusSourceConfig) -> Result<Self, SourceError> {
        let base_url =
            Url::parse(&config.base_url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(config.base_url.clone()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SourceError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn status_url(&self, external_ref_id: &str) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["messages", external_ref_id, "status"]);
        Ok(url)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn get_status(&self, external_ref_id: &str) -> Result<Vec<ExternalStatus>, SourceError> {
        let url = self.status_url(external_ref_id)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(external_ref_id, "Status source has no record yet");
                Ok(Vec::new())
            }
            status if status.is_success() => response
                .json::<Vec<ExternalStatus>>()
                .await
                .map_err(|e| SourceError::Decode(e.to_string())),
            status => Err(SourceError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }
}
