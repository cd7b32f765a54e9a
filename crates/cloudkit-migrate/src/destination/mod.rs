//! Destination stores: Firestore documents and Cloud Storage objects.

pub mod auth;
pub mod firestore;
pub mod memory;
pub mod storage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::DestinationConfig;
use crate::destination::auth::TokenSource;
use crate::error::{Error, Result};

/// A converted field value, shaped for the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double.
    Double(f64),
    /// String.
    String(String),
    /// Point in time (UTC).
    Timestamp(DateTime<Utc>),
    /// Nested map.
    Map(BTreeMap<String, FieldValue>),
    /// Array.
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// Maps a raw JSON value without interpreting it.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Returns the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A document keyed by the source record name.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Fields.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Creates an empty document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }
}

/// Document database addressed by collection and document id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates or fully replaces the document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RecordWrite`] if the write is rejected.
    async fn set(&self, collection: &str, document: &Document) -> Result<()>;

    /// Updates only the fields present in `document`, keeping the others.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RecordWrite`] if the write is rejected.
    async fn merge(&self, collection: &str, document: &Document) -> Result<()>;
}

/// Object storage addressed by hierarchical path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads (or overwrites) an object.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AssetTransfer`] if the upload fails.
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()>;

    /// Makes an object publicly readable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AssetTransfer`] if the ACL change fails.
    async fn make_public(&self, path: &str) -> Result<()>;

    /// Stable public reference of an object.
    fn public_url(&self, path: &str) -> String;
}

/// Handles to both destination stores.
#[derive(Clone)]
pub struct Destination {
    /// Document store.
    pub documents: Arc<dyn DocumentStore>,
    /// Object store.
    pub objects: Arc<dyn ObjectStore>,
}

impl Destination {
    /// Connects to Firestore and Cloud Storage with the configured credentials.
    ///
    /// One access token is obtained up front. Token failures after this point
    /// are reported per write by the stores.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthSetup`] if the credentials cannot be loaded or
    /// exchanged for an access token.
    pub async fn connect(config: &DestinationConfig) -> Result<Self> {
        let tokens = auth::create_token_source(&config.credentials)?;
        tokens.access_token().await.map_err(|e| match e {
            Error::AuthSetup(_) => e,
            other => Error::AuthSetup(format!("destination credentials rejected: {}", other)),
        })?;
        debug!("Destination credentials accepted");

        Ok(Self {
            documents: Arc::new(firestore::FirestoreStore::new(config, tokens.clone())),
            objects: Arc::new(storage::CloudStorage::new(config, tokens)),
        })
    }

    /// In-memory stores, for previews and tests.
    #[must_use]
    pub fn in_memory(bucket: &str) -> Self {
        Self {
            documents: Arc::new(memory::MemoryDocumentStore::new()),
            objects: Arc::new(memory::MemoryObjectStore::new(bucket)),
        }
    }
}
