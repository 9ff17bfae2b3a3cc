use crate::http::build_client;
use crate::ports::{MediaAsset, MediaTranscoder, ServiceError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

const FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 300;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media {0} is not ready")]
    NotReady(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl From<MediaError> for ServiceError {
    fn from(value: MediaError) -> Self {
        match value {
            MediaError::NotReady(id) => ServiceError::NotReady(id),
            MediaError::Request(msg) => ServiceError::Request(msg),
            MediaError::Deserialize(msg) => ServiceError::Deserialize(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaLookup {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Downloads inbound media by id: one lookup for the short-lived download URL,
/// then the bytes. Freshly received media can 404 for a moment, so the lookup
/// is retried a few times with a short backoff.
#[derive(Debug, Clone)]
pub struct GraphMediaClient {
    http: Client,
    base_url: String,
    token: String,
}

impl GraphMediaClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn lookup(&self, media_id: &str) -> Result<(String, Option<String>), MediaError> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(media_id));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| MediaError::Request(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(MediaError::NotReady(media_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(MediaError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let payload: MediaLookup = response
            .json()
            .await
            .map_err(|err| MediaError::Deserialize(err.to_string()))?;
        match payload.url.filter(|u| !u.trim().is_empty()) {
            Some(url) => Ok((url, payload.mime_type)),
            None => Err(MediaError::NotReady(media_id.to_string())),
        }
    }

    async fn download(
        &self,
        url: &str,
        mime_type: Option<String>,
    ) -> Result<MediaAsset, MediaError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| MediaError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MediaError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| MediaError::Request(err.to_string()))?;
        Ok(MediaAsset {
            bytes: bytes.to_vec(),
            content_type: mime_type
                .or(header_type)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        })
    }
}

#[async_trait]
impl MediaTranscoder for GraphMediaClient {
    async fn fetch(&self, media_id: &str) -> Result<MediaAsset, ServiceError> {
        let mut attempt = 0;
        let (url, mime_type) = loop {
            attempt += 1;
            match self.lookup(media_id).await {
                Ok(found) => break found,
                Err(MediaError::NotReady(_)) if attempt < FETCH_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    debug!(target = "closet.whatsapp", media_id, attempt, delay_ms = delay.as_millis() as u64, "media_not_ready_retry");
                    sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        Ok(self.download(&url, mime_type).await?)
    }
}

/// Used when no Cloud API token is configured.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredMedia;

#[async_trait]
impl MediaTranscoder for UnconfiguredMedia {
    async fn fetch(&self, _media_id: &str) -> Result<MediaAsset, ServiceError> {
        Err(ServiceError::NotConfigured("media download"))
    }
}

pub fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::random_range(0..100u64);
    Duration::from_millis(BACKOFF_BASE_MS * u64::from(attempt) + jitter)
}
