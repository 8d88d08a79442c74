use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;

pub const ROBLOX_API_BASE: &str = "https://apis.roblox.com";

/// A place file bound for a specific universe/place pair.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub api_key: String,
    pub universe_id: u64,
    pub place_id: u64,
    pub place_file: Bytes,
}

/// Whatever the publish API answered, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResponse {
    pub status: u16,
    pub body: String,
}

impl PublishResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

/// `Err` means the request never produced an HTTP response.
#[async_trait]
pub trait PublishApi: Send + Sync {
    async fn publish_place(&self, request: PublishRequest) -> Result<PublishResponse>;
}

#[derive(Debug, Clone)]
pub struct RobloxPublisher {
    client: Client,
    base_url: String,
}

impl RobloxPublisher {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build().context("building HTTP client failed")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn version_url(&self, universe_id: u64, place_id: u64) -> String {
        format!(
            "{}/universes/v1/{universe_id}/places/{place_id}/versions?versionType=Published",
            self.base_url
        )
    }
}

#[async_trait]
impl PublishApi for RobloxPublisher {
    async fn publish_place(&self, request: PublishRequest) -> Result<PublishResponse> {
        let url = self.version_url(request.universe_id, request.place_id);
        debug!(
            "Sending {} bytes to publish API: {}",
            request.place_file.len(),
            url
        );
        let res = self
            .client
            .post(&url)
            .header("x-api-key", request.api_key)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(request.place_file)
            .send()
            .await
            .context("request failed")?;
        let status = res.status().as_u16();
        let body = res.text().await.context("reading body failed")?;
        Ok(PublishResponse { status, body })
    }
}
