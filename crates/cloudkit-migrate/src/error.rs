//! Error types for cloudkit-migrate.
//!
//! Each variant maps to one failure scope of a migration run: setup errors
//! abort the run, source errors abort one record type, asset errors degrade a
//! single field and write or conversion errors skip a single record.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a migration.
#[derive(Error, Debug)]
pub enum Error {
    /// Signing key or destination credentials missing or unusable.
    #[error("Authentication setup failed: {0}")]
    AuthSetup(String),

    /// The source API answered with a non-success status.
    #[error("Source request failed with status {status}: {body}")]
    SourceRequest {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the server.
        body: String,
    },

    /// Source records could not be read, e.g. a missing or malformed export file.
    #[error("Source read failed: {0}")]
    SourceRead(String),

    /// Downloading or uploading a single asset failed.
    #[error("Asset transfer failed: {0}")]
    AssetTransfer(String),

    /// Writing a document to the destination failed.
    #[error("Record write failed: {0}")]
    RecordWrite(String),

    /// A typed field value could not be converted.
    #[error("Conversion error for field '{field}': {message}")]
    Conversion {
        /// Field name.
        field: String,
        /// What went wrong.
        message: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Builds a conversion error for `field`.
    pub fn conversion(field: &str, message: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error must abort the whole run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthSetup(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_request_display() {
        let err = Error::SourceRequest {
            status: 421,
            body: "AUTHENTICATION_REQUIRED".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Source request failed with status 421: AUTHENTICATION_REQUIRED"
        );
    }

    #[test]
    fn test_conversion_helper() {
        let err = Error::conversion("price", "not a number");
        assert!(matches!(err, Error::Conversion { ref field, .. } if field == "price"));
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::AuthSetup("bad key".to_string()).is_fatal());
        assert!(Error::Config("empty".to_string()).is_fatal());
        assert!(!Error::RecordWrite("denied".to_string()).is_fatal());
        assert!(!Error::AssetTransfer("timeout".to_string()).is_fatal());
        assert!(!Error::SourceRead("missing export".to_string()).is_fatal());
    }
}
