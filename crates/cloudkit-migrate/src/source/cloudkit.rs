//! CloudKit Web Services query client.
//!
//! Uses server-to-server key authentication: each POST carries the key id,
//! the request timestamp and an ECDSA signature over the body digest and the
//! request path. Queries page through results with the opaque
//! `continuationMarker` returned by the server.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::CloudKitConfig;
use crate::error::{Error, Result};
use crate::http::{create_http_client, failure_parts};
use crate::signer::RequestSigner;
use crate::source::{RecordSource, SourceRecord, TypedValue};

/// Records requested per page.
pub const PAGE_SIZE: usize = 200;

/// The record type being queried.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Record type name.
    pub record_type: String,
}

/// Body of a `records/query` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Query definition.
    pub query: QueryFilter,
    /// Maximum number of records in the response.
    pub results_limit: usize,
    /// Cursor from the previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_marker: Option<String>,
    /// Restricts the returned fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_keys: Option<Vec<String>>,
}

impl QueryRequest {
    /// Creates a first-page query for `record_type`.
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            query: QueryFilter {
                record_type: record_type.into(),
            },
            results_limit: PAGE_SIZE,
            continuation_marker: None,
            desired_keys: None,
        }
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.results_limit = limit;
        self
    }

    /// Sets the continuation marker.
    #[must_use]
    pub fn with_marker(mut self, marker: Option<String>) -> Self {
        self.continuation_marker = marker;
        self
    }

    /// Restricts the response to the given fields.
    #[must_use]
    pub fn with_desired_keys(mut self, keys: Vec<String>) -> Self {
        self.desired_keys = if keys.is_empty() { None } else { Some(keys) };
        self
    }
}

/// Response of a `records/query` request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<WireRecord>,
    #[serde(default)]
    continuation_marker: Option<String>,
}

/// A record entry; failed entries carry `serverErrorCode` instead of fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default)]
    record_name: Option<String>,
    #[serde(default)]
    record_type: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, TypedValue>,
    #[serde(default)]
    server_error_code: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// One page of query results.
#[derive(Debug)]
pub struct QueryPage {
    /// Records on this page.
    pub records: Vec<SourceRecord>,
    /// Cursor for the next page; `None` on the last page.
    pub continuation_marker: Option<String>,
}

/// CloudKit Web Services client.
pub struct CloudKitClient {
    config: CloudKitConfig,
    signer: RequestSigner,
    client: Client,
    query_url: reqwest::Url,
}

impl CloudKitClient {
    /// Creates a client for the configured container and database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot be parsed.
    pub fn new(config: CloudKitConfig, signer: RequestSigner) -> Result<Self> {
        let query_url = reqwest::Url::parse(&build_query_url(&config))
            .map_err(|e| Error::Config(format!("invalid CloudKit URL: {}", e)))?;

        Ok(Self {
            config,
            signer,
            client: create_http_client(),
            query_url,
        })
    }

    /// Full URL of the query endpoint.
    #[must_use]
    pub fn query_url(&self) -> &str {
        self.query_url.as_str()
    }

    /// The path component covered by the request signature.
    #[must_use]
    pub fn signed_path(&self) -> &str {
        self.query_url.path()
    }

    /// Container this client talks to.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.config.container
    }

    /// Sends a signed POST and decodes the JSON response.
    async fn post_signed<T: Serialize, R: DeserializeOwned>(&self, body: &T) -> Result<R> {
        let body = serde_json::to_string(body)?;
        let headers = self.signer.sign_request(self.signed_path(), &body);

        let request = self
            .client
            .post(self.query_url.clone())
            .header("Content-Type", "application/json")
            .body(body);

        let response = headers.apply(request).send().await?;

        if !response.status().is_success() {
            let (status, body) = failure_parts(response).await;
            warn!("CloudKit API error {}: {}", status, body);
            return Err(Error::SourceRequest { status, body });
        }

        Ok(response.json().await?)
    }

    /// Issues a single query and returns the raw response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceRequest`] on a non-success status.
    pub async fn query_raw(&self, request: &QueryRequest) -> Result<serde_json::Value> {
        self.post_signed(request).await
    }

    /// Fetches one page of `record_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceRequest`] on a non-success status.
    pub async fn query_page(&self, record_type: &str, marker: Option<String>) -> Result<QueryPage> {
        let request = QueryRequest::new(record_type).with_marker(marker);
        let response: QueryResponse = self.post_signed(&request).await?;

        let mut records = Vec::with_capacity(response.records.len());
        for wire in response.records {
            if let Some(code) = wire.server_error_code {
                warn!(
                    "Skipping {} record {:?}: {} {}",
                    record_type,
                    wire.record_name,
                    code,
                    wire.reason.unwrap_or_default()
                );
                continue;
            }
            let Some(record_name) = wire.record_name else {
                warn!("Skipping {} record without recordName", record_type);
                continue;
            };
            records.push(SourceRecord {
                record_name,
                record_type: wire.record_type.unwrap_or_else(|| record_type.to_string()),
                fields: wire.fields,
            });
        }

        Ok(QueryPage {
            records,
            continuation_marker: response.continuation_marker.filter(|m| !m.is_empty()),
        })
    }
}

#[async_trait]
impl RecordSource for CloudKitClient {
    fn source_type(&self) -> &'static str {
        "cloudkit"
    }

    async fn fetch_all(&self, record_type: &str) -> Result<Vec<SourceRecord>> {
        let mut records = Vec::new();
        let mut marker: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.query_page(record_type, marker.take()).await?;
            pages += 1;
            debug!(
                "{}: page {} returned {} records",
                record_type,
                pages,
                page.records.len()
            );
            records.extend(page.records);

            match page.continuation_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(
            "{}: fetched {} records in {} pages",
            record_type,
            records.len(),
            pages
        );
        Ok(records)
    }
}

/// Builds `{base}/database/{version}/{container}/{environment}/{database}/records/query`.
fn build_query_url(config: &CloudKitConfig) -> String {
    format!(
        "{}/database/{}/{}/{}/{}/records/query",
        config.base_url.trim_end_matches('/'),
        config.api_version,
        config.container,
        config.environment,
        config.database
    )
}

#[cfg(test)]
#[path = "cloudkit_tests.rs"]
mod tests;
