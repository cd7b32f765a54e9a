// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # CloudKit Migration Tool
//!
//! `cloudkit-migrate` is a CLI tool and library for moving records and their
//! binary assets out of CloudKit Web Services into Cloud Firestore documents
//! and Cloud Storage objects.
//!
//! ## Supported Sources
//!
//! | Source | Status | Notes |
//! |--------|--------|-------|
//! | CloudKit Web Services | ✅ | Server-to-server key, signed queries |
//! | CloudKit Dashboard export | ✅ | `{"records": [...]}` JSON files |
//!
//! ## Field Conversion
//!
//! | CloudKit type | Firestore value |
//! |---------------|-----------------|
//! | `STRING` | string |
//! | `INT64` | integer |
//! | `DOUBLE` | double |
//! | `TIMESTAMP` | timestamp (UTC, whole seconds) |
//! | `ASSET` / `ASSETID` | public Cloud Storage URL |
//! | `REFERENCE` | referenced record name |
//! | `LOCATION` | `{latitude, longitude}` map |
//!
//! ## Quick Start
//!
//! ```bash
//! # Full migration
//! cloudkit-migrate --config migration.yaml run
//!
//! # Dry run (reads only)
//! cloudkit-migrate --config migration.yaml run --dry-run
//!
//! # Re-host assets of already migrated documents
//! cloudkit-migrate --config migration.yaml assets
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: cloudkit
//!   container: iCloud.com.example.App
//!   key_id: ${CLOUDKIT_KEY_ID}
//!   key_file: ./eckey.pem
//!
//! destination:
//!   project_id: my-project
//!   bucket: my-project.appspot.com
//!   credentials:
//!     service_account: ./service-account.json
//!
//! record_types:
//!   - record_type: Products
//!     collection: products
//!     asset_fields: [imageURL1]
//!
//! options:
//!   workers: 4
//! ```

#![warn(missing_docs)]

pub mod assets;
pub mod config;
pub mod convert;
pub mod destination;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod signer;
pub mod source;

pub use assets::{AssetKind, AssetOutcome, AssetTransferer};
pub use config::{MigrationConfig, MigrationOptions, RecordTypeMapping, SourceConfig};
pub use convert::{ConvertedRecord, FieldConverter};
pub use destination::{Destination, Document, DocumentStore, FieldValue, ObjectStore};
pub use error::{Error, Result};
pub use pipeline::{AssetStats, MigrationResult, MigrationStats, Pipeline, TypeStats};
pub use signer::RequestSigner;
pub use source::{FieldTag, RecordSource, SourceRecord, TypedValue};
