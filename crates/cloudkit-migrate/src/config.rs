//! Configuration types for cloudkit-migrate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::validate_base_url;

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source configuration.
    pub source: SourceConfig,
    /// Destination Firestore/Storage configuration.
    pub destination: DestinationConfig,
    /// Record types to migrate, in order.
    #[serde(default)]
    pub record_types: Vec<RecordTypeMapping>,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// CloudKit Web Services with a server-to-server key.
    #[serde(rename = "cloudkit")]
    CloudKit(CloudKitConfig),
    /// CloudKit Dashboard JSON export files.
    #[serde(rename = "export")]
    Export(crate::source::export::ExportConfig),
}

/// CloudKit Web Services configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudKitConfig {
    /// Container identifier (e.g. `iCloud.com.example.App`).
    pub container: String,
    /// `production` or `development`.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Database scope.
    #[serde(default = "default_database")]
    pub database: String,
    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// API host.
    #[serde(default = "default_cloudkit_url")]
    pub base_url: String,
    /// Server-to-server key id.
    pub key_id: String,
    /// Path to the PEM private key.
    pub key_file: PathBuf,
}

/// Destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Google Cloud project id.
    pub project_id: String,
    /// Firestore database id.
    #[serde(default = "default_firestore_database")]
    pub database: String,
    /// Storage bucket receiving migrated assets.
    pub bucket: String,
    /// Credentials for both services.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Firestore API host.
    #[serde(default = "default_firestore_url")]
    pub firestore_url: String,
    /// Storage JSON API host.
    #[serde(default = "default_storage_url")]
    pub storage_url: String,
    /// Host used to build public object URLs.
    #[serde(default = "default_storage_url")]
    pub public_url: String,
}

/// Destination credentials. Exactly one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Path to a service account key JSON file.
    #[serde(default)]
    pub service_account: Option<PathBuf>,
    /// Pre-issued OAuth access token (emulators, CI).
    #[serde(default)]
    pub access_token: Option<String>,
}

/// One record type and where it goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordTypeMapping {
    /// Source record type.
    pub record_type: String,
    /// Destination collection; defaults to the lowercased record type.
    #[serde(default)]
    pub collection: Option<String>,
    /// Asset fields handled by asset-only runs.
    #[serde(default)]
    pub asset_fields: Vec<String>,
}

impl RecordTypeMapping {
    /// Creates a mapping with an explicit collection.
    pub fn new(record_type: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            collection: Some(collection.into()),
            asset_fields: Vec::new(),
        }
    }

    /// Sets the asset fields.
    #[must_use]
    pub fn with_asset_fields(mut self, fields: &[&str]) -> Self {
        self.asset_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Destination collection name.
    #[must_use]
    pub fn collection_name(&self) -> String {
        self.collection
            .clone()
            .unwrap_or_else(|| self.record_type.to_lowercase())
    }
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Dry run mode (reads only, no destination writes or uploads).
    #[serde(default)]
    pub dry_run: bool,
    /// Records processed concurrently; 1 keeps the run sequential.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Asset download timeout in seconds.
    #[serde(default = "default_asset_timeout_secs")]
    pub asset_timeout_secs: u64,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            workers: default_workers(),
            asset_timeout_secs: default_asset_timeout_secs(),
        }
    }
}

impl MigrationOptions {
    /// Asset download timeout.
    #[must_use]
    pub fn asset_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_timeout_secs)
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_database() -> String {
    "public".to_string()
}

fn default_api_version() -> String {
    "1".to_string()
}

fn default_cloudkit_url() -> String {
    "https://api.apple-cloudkit.com".to_string()
}

fn default_firestore_database() -> String {
    "(default)".to_string()
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com".to_string()
}

fn default_storage_url() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_asset_timeout_secs() -> u64 {
    30
}

/// Replaces `${VAR}` references with environment values.
///
/// # Errors
///
/// Returns an error for unset variables or an unterminated reference.
pub fn expand_env(content: &str) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::Config("unterminated ${ in configuration".to_string()))?;
        let name = &after[..end];
        let value = std::env::var(name).map_err(|_| {
            Error::Config(format!("environment variable '{}' is not set", name))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

impl MigrationConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment reference is unset or the YAML is invalid.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env(content)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Finds the mapping for a record type.
    #[must_use]
    pub fn mapping(&self, record_type: &str) -> Option<&RecordTypeMapping> {
        self.record_types
            .iter()
            .find(|m| m.record_type == record_type)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.record_types.is_empty() {
            return Err(Error::Config(
                "at least one record type must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for mapping in &self.record_types {
            if mapping.record_type.trim().is_empty() {
                return Err(Error::Config("record_type cannot be empty".to_string()));
            }
            if !seen.insert(mapping.record_type.as_str()) {
                return Err(Error::Config(format!(
                    "record type '{}' is listed twice",
                    mapping.record_type
                )));
            }
            if mapping.collection_name().trim().is_empty() {
                return Err(Error::Config(format!(
                    "collection for '{}' cannot be empty",
                    mapping.record_type
                )));
            }
        }

        if self.options.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }

        if let SourceConfig::CloudKit(ck) = &self.source {
            if ck.container.trim().is_empty() {
                return Err(Error::Config("container cannot be empty".to_string()));
            }
            if ck.key_id.trim().is_empty() {
                return Err(Error::Config("key_id cannot be empty".to_string()));
            }
            validate_base_url(&ck.base_url, "source.base_url")?;
        }

        let dest = &self.destination;
        if dest.project_id.trim().is_empty() {
            return Err(Error::Config("project_id cannot be empty".to_string()));
        }
        if dest.bucket.trim().is_empty() {
            return Err(Error::Config("bucket cannot be empty".to_string()));
        }
        validate_base_url(&dest.firestore_url, "destination.firestore_url")?;
        validate_base_url(&dest.storage_url, "destination.storage_url")?;
        validate_base_url(&dest.public_url, "destination.public_url")?;

        match (&dest.credentials.service_account, &dest.credentials.access_token) {
            (Some(_), Some(_)) => Err(Error::Config(
                "set either service_account or access_token, not both".to_string(),
            )),
            (None, None) if !self.options.dry_run => Err(Error::Config(
                "destination credentials are required".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  type: cloudkit
  container: iCloud.com.example.App
  key_id: abc123
  key_file: ./eckey.pem
destination:
  project_id: example
  bucket: example.appspot.com
  credentials:
    access_token: token
record_types:
  - record_type: Products
    collection: products
    asset_fields: [imageURL1, modelURL]
  - record_type: Orders
options:
  workers: 2
"#;

    fn parsed() -> MigrationConfig {
        MigrationConfig::from_yaml(YAML).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.workers, 1);
        assert_eq!(options.asset_timeout(), Duration::from_secs(30));
        assert!(!options.dry_run);
    }

    #[test]
    fn test_config_yaml_parse() {
        let config = parsed();
        let SourceConfig::CloudKit(ck) = &config.source else {
            panic!("expected cloudkit source");
        };
        assert_eq!(ck.environment, "production");
        assert_eq!(ck.database, "public");
        assert_eq!(ck.api_version, "1");
        assert_eq!(ck.base_url, "https://api.apple-cloudkit.com");
        assert_eq!(config.destination.database, "(default)");
        assert_eq!(config.record_types.len(), 2);
        assert_eq!(config.options.workers, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_collection_defaults_to_lowercase() {
        let config = parsed();
        assert_eq!(config.record_types[0].collection_name(), "products");
        assert_eq!(config.record_types[1].collection_name(), "orders");
        assert_eq!(
            config.mapping("Products").unwrap().asset_fields,
            vec!["imageURL1", "modelURL"]
        );
        assert!(config.mapping("Missing").is_none());
    }

    #[test]
    fn test_validate_requires_record_types() {
        let mut config = parsed();
        config.record_types.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = parsed();
        config
            .record_types
            .push(RecordTypeMapping::new("Products", "other"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_credentials() {
        let mut config = parsed();
        config.destination.credentials = CredentialsConfig::default();
        assert!(config.validate().is_err());

        config.options.dry_run = true;
        assert!(config.validate().is_ok());

        config.destination.credentials = CredentialsConfig {
            service_account: Some(PathBuf::from("sa.json")),
            access_token: Some("t".to_string()),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = parsed();
        config.options.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("CKM_TEST_KEY_ID", "from-env");
        let out = expand_env("key_id: ${CKM_TEST_KEY_ID}\nother: x").unwrap();
        assert_eq!(out, "key_id: from-env\nother: x");
    }

    #[test]
    fn test_expand_env_missing_var() {
        let err = expand_env("key_id: ${CKM_TEST_SURELY_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_expand_env_unterminated() {
        assert!(expand_env("key_id: ${OOPS").is_err());
    }

    #[test]
    fn test_export_source_parse() {
        let yaml = r#"
source:
  type: export
  path: ./cloudkit_export
destination:
  project_id: p
  bucket: b
record_types:
  - record_type: Items
options:
  dry_run: true
"#;
        let config = MigrationConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.source, SourceConfig::Export(_)));
        assert!(config.validate().is_ok());
    }
}
