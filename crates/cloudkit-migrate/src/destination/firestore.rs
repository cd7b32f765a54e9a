//! Firestore REST v1 document store.

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::config::DestinationConfig;
use crate::destination::auth::TokenSource;
use crate::destination::{Document, DocumentStore, FieldValue};
use crate::error::{Error, Result};
use crate::http::{create_http_client, failure_parts};

/// Encodes a value as a Firestore typed value.
#[must_use]
pub fn encode_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => json!({ "nullValue": null }),
        FieldValue::Bool(b) => json!({ "booleanValue": b }),
        // Firestore carries int64 as a decimal string.
        FieldValue::Integer(i) => json!({ "integerValue": i.to_string() }),
        FieldValue::Double(d) => json!({ "doubleValue": d }),
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(t) => {
            json!({ "timestampValue": t.to_rfc3339_opts(SecondsFormat::AutoSi, true) })
        }
        FieldValue::Map(map) => json!({ "mapValue": { "fields": encode_fields(map.iter()) } }),
        FieldValue::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
    }
}

fn encode_fields<'a>(fields: impl Iterator<Item = (&'a String, &'a FieldValue)>) -> Value {
    let map: Map<String, Value> = fields
        .map(|(name, value)| (name.clone(), encode_value(value)))
        .collect();
    Value::Object(map)
}

/// Quotes a field name for use in an update mask when it is not a simple identifier.
#[must_use]
pub fn field_path(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// Firestore document store.
pub struct FirestoreStore {
    client: Client,
    base_url: String,
    project_id: String,
    database: String,
    tokens: Arc<dyn TokenSource>,
}

impl FirestoreStore {
    /// Creates a store for the configured project and database.
    pub fn new(config: &DestinationConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: create_http_client(),
            base_url: config.firestore_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            database: config.database.clone(),
            tokens,
        }
    }

    /// URL of a single document.
    pub fn document_url(&self, collection: &str, id: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/v1/", self.base_url))
            .map_err(|e| Error::Config(format!("invalid Firestore URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config("Firestore URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend([
                "projects",
                self.project_id.as_str(),
                "databases",
                self.database.as_str(),
                "documents",
                collection,
                id,
            ]);
        Ok(url)
    }

    async fn patch(&self, url: Url, document: &Document) -> Result<()> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| {
                Error::RecordWrite(format!("no access token for '{}': {}", document.id, e))
            })?;
        let body = json!({ "fields": encode_fields(document.fields.iter()) });

        let response = self
            .client
            .patch(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RecordWrite(format!("Firestore request failed: {}", e)))?;

        if !response.status().is_success() {
            let (status, body) = failure_parts(response).await;
            return Err(Error::RecordWrite(format!(
                "Firestore error {} writing '{}': {}",
                status, document.id, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn set(&self, collection: &str, document: &Document) -> Result<()> {
        let url = self.document_url(collection, &document.id)?;
        debug!("Firestore set {}/{}", collection, document.id);
        self.patch(url, document).await
    }

    async fn merge(&self, collection: &str, document: &Document) -> Result<()> {
        let mut url = self.document_url(collection, &document.id)?;
        {
            let mut query = url.query_pairs_mut();
            for name in document.fields.keys() {
                query.append_pair("updateMask.fieldPaths", &field_path(name));
            }
        }
        debug!(
            "Firestore merge {}/{} ({} fields)",
            collection,
            document.id,
            document.fields.len()
        );
        self.patch(url, document).await
    }
}

#[cfg(test)]
#[path = "firestore_tests.rs"]
mod tests;
