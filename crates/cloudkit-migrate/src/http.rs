//! HTTP helpers shared by the source client, the asset transferer and the
//! destination stores.

use reqwest::{Client, Response};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default timeout for asset downloads.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates an HTTP client without a request timeout.
///
/// Source queries and destination writes are not bounded in time.
#[must_use]
pub fn create_http_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Creates an HTTP client for asset downloads with a fixed overall timeout.
#[must_use]
pub fn create_download_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Reads the status and body of a failed response.
pub async fn failure_parts(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    (status, body)
}

/// Validates a base URL from configuration.
pub fn validate_base_url(url: &str, name: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Config(format!(
            "{} must be an http(s) URL, got '{}'",
            name, url
        )));
    }
    reqwest::Url::parse(url)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("invalid {} '{}': {}", name, url, e)))
}
