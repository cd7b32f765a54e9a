//! Cloud Storage object store (JSON API).

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::DestinationConfig;
use crate::destination::auth::TokenSource;
use crate::destination::ObjectStore;
use crate::error::{Error, Result};
use crate::http::{create_http_client, failure_parts};

/// Cloud Storage bucket.
pub struct CloudStorage {
    client: Client,
    storage_url: String,
    public_url: String,
    bucket: String,
    tokens: Arc<dyn TokenSource>,
}

impl CloudStorage {
    /// Creates a store for the configured bucket.
    pub fn new(config: &DestinationConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: create_http_client(),
            storage_url: config.storage_url.trim_end_matches('/').to_string(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            tokens,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/", self.storage_url))
            .map_err(|e| Error::Config(format!("invalid storage URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config("storage URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Media upload endpoint for an object.
    pub fn upload_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", path);
        Ok(url)
    }

    async fn token(&self, path: &str) -> Result<String> {
        self.tokens
            .access_token()
            .await
            .map_err(|e| Error::AssetTransfer(format!("no access token for '{}': {}", path, e)))
    }

    /// ACL endpoint for an object. The object name is a single encoded segment.
    pub fn acl_url(&self, path: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", path, "acl"])
    }

    async fn check(response: reqwest::Response, action: &str, path: &str) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        let (status, body) = failure_parts(response).await;
        Err(Error::AssetTransfer(format!(
            "storage {} of '{}' failed with status {}: {}",
            action, path, status, body
        )))
    }
}

#[async_trait]
impl ObjectStore for CloudStorage {
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.upload_url(path)?;
        let token = self.token(path).await?;
        debug!("Uploading {} bytes to gs://{}/{}", data.len(), self.bucket, path);

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::AssetTransfer(format!("upload of '{}' failed: {}", path, e)))?;

        Self::check(response, "upload", path).await
    }

    async fn make_public(&self, path: &str) -> Result<()> {
        let url = self.acl_url(path)?;
        let token = self.token(path).await?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "entity": "allUsers", "role": "READER" }))
            .send()
            .await
            .map_err(|e| {
                Error::AssetTransfer(format!("ACL update of '{}' failed: {}", path, e))
            })?;

        Self::check(response, "ACL update", path).await
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.public_url, self.bucket, path)
    }
}
