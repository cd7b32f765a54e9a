//! Record sources: the CloudKit Web Services API and Dashboard export files.

pub mod cloudkit;
pub mod export;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SourceConfig;
use crate::error::Result;
use crate::signer::RequestSigner;

/// Type tag of a source field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldTag {
    /// `STRING`
    String,
    /// `INT64`
    Int64,
    /// `DOUBLE`
    Double,
    /// `TIMESTAMP` (epoch milliseconds)
    Timestamp,
    /// `ASSET`
    Asset,
    /// `ASSETID`, returned by queries for asset fields
    AssetId,
    /// `REFERENCE`
    Reference,
    /// `LOCATION`
    Location,
    /// Any other tag, kept verbatim.
    Other(String),
    /// No tag in the payload.
    #[default]
    Missing,
}

impl FieldTag {
    /// Returns `true` for both asset tags.
    #[must_use]
    pub fn is_asset(&self) -> bool {
        matches!(self, Self::Asset | Self::AssetId)
    }

    /// Wire name of the tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::String => "STRING",
            Self::Int64 => "INT64",
            Self::Double => "DOUBLE",
            Self::Timestamp => "TIMESTAMP",
            Self::Asset => "ASSET",
            Self::AssetId => "ASSETID",
            Self::Reference => "REFERENCE",
            Self::Location => "LOCATION",
            Self::Other(tag) => tag,
            Self::Missing => "",
        }
    }
}

impl From<String> for FieldTag {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "STRING" => Self::String,
            "INT64" => Self::Int64,
            "DOUBLE" => Self::Double,
            "TIMESTAMP" => Self::Timestamp,
            "ASSET" => Self::Asset,
            "ASSETID" => Self::AssetId,
            "REFERENCE" => Self::Reference,
            "LOCATION" => Self::Location,
            "" => Self::Missing,
            _ => Self::Other(tag),
        }
    }
}

impl From<FieldTag> for String {
    fn from(tag: FieldTag) -> Self {
        tag.as_str().to_string()
    }
}

/// A typed field value as returned by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    /// Type tag.
    #[serde(rename = "type", default)]
    pub tag: FieldTag,
    /// Raw value; its shape depends on the tag.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl TypedValue {
    /// Creates a typed value.
    pub fn new(tag: FieldTag, value: serde_json::Value) -> Self {
        Self { tag, value }
    }

    /// Download URL of an asset value, if present and non-empty.
    #[must_use]
    pub fn download_url(&self) -> Option<&str> {
        self.value
            .get("downloadURL")
            .and_then(|v| v.as_str())
            .filter(|url| !url.is_empty())
    }
}

/// An immutable record snapshot fetched from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    /// Unique name within the record type; becomes the document id.
    pub record_name: String,
    /// Record type.
    #[serde(default)]
    pub record_type: String,
    /// Typed fields.
    #[serde(default)]
    pub fields: BTreeMap<String, TypedValue>,
}

/// Trait for record sources.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Get the source type name.
    fn source_type(&self) -> &'static str;

    /// Fetches every record of `record_type`, following pagination to the end.
    ///
    /// # Errors
    ///
    /// Fails if any page cannot be fetched; no partial result is returned.
    async fn fetch_all(&self, record_type: &str) -> Result<Vec<SourceRecord>>;
}

/// Create a record source from configuration.
///
/// For the CloudKit source this loads the signing key, so a missing or
/// malformed key fails here, before any record type is processed.
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn RecordSource>> {
    match config {
        SourceConfig::CloudKit(cfg) => {
            let signer = RequestSigner::from_pem_file(cfg.key_id.clone(), &cfg.key_file)?;
            Ok(Box::new(cloudkit::CloudKitClient::new(cfg.clone(), signer)?))
        }
        SourceConfig::Export(cfg) => Ok(Box::new(export::ExportFileSource::new(cfg.clone()))),
    }
}
