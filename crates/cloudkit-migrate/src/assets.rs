//! Asset transfer: download from the source, re-host in object storage.
//!
//! Source download URLs are short-lived, so every asset is downloaded into
//! memory, sniffed for its format, uploaded under a deterministic path and
//! made publicly readable. The returned reference is the object's stable
//! public URL.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::destination::ObjectStore;
use crate::error::{Error, Result};
use crate::http::{create_download_client, failure_parts};

/// Root prefix of every uploaded asset.
pub const OBJECT_PREFIX: &str = "migrated";

/// Binary format detected from the leading bytes of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// JPEG image.
    Jpeg,
    /// PNG image.
    Png,
    /// USDZ 3D model (a zip container).
    Usdz,
    /// GIF image.
    Gif,
    /// Anything else.
    Binary,
}

impl AssetKind {
    /// Detects the format from magic bytes.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            Self::Png
        } else if data.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
            Self::Usdz
        } else if data.starts_with(b"GIF8") {
            Self::Gif
        } else {
            Self::Binary
        }
    }

    /// File extension, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Usdz => "usdz",
            Self::Gif => "gif",
            Self::Binary => "bin",
        }
    }

    /// MIME type used for the upload.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Usdz => "model/vnd.usdz+zip",
            Self::Gif => "image/gif",
            Self::Binary => "application/octet-stream",
        }
    }
}

/// Object path of an asset: `migrated/{record_id}/{field}.{ext}`.
#[must_use]
pub fn object_path(record_id: &str, field: &str, kind: AssetKind) -> String {
    format!(
        "{}/{}/{}.{}",
        OBJECT_PREFIX,
        record_id,
        field,
        kind.extension()
    )
}

/// Result of a degrading transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    /// Re-hosted; holds the public reference.
    Transferred(String),
    /// Transfer failed; holds the original source URL.
    Passthrough {
        /// Original download URL.
        url: String,
        /// Why the transfer failed.
        error: String,
    },
}

impl AssetOutcome {
    /// The value to store in the document.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Transferred(url) | Self::Passthrough { url, .. } => url,
        }
    }

    /// Returns `true` if the asset was re-hosted.
    #[must_use]
    pub const fn is_transferred(&self) -> bool {
        matches!(self, Self::Transferred(_))
    }
}

/// Downloads assets and re-hosts them in an object store.
#[derive(Clone)]
pub struct AssetTransferer {
    client: Client,
    objects: Arc<dyn ObjectStore>,
}

impl AssetTransferer {
    /// Creates a transferer whose downloads time out after `timeout`.
    pub fn new(objects: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self {
            client: create_download_client(timeout),
            objects,
        }
    }

    /// Downloads an asset into memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetTransfer`] on a network error, a timeout, or a
    /// non-success status.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::AssetTransfer(format!("download failed: {}", e)))?;

        if !response.status().is_success() {
            let (status, _) = failure_parts(response).await;
            return Err(Error::AssetTransfer(format!(
                "download failed with status {}",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::AssetTransfer(format!("download interrupted: {}", e)))?;
        Ok(bytes.to_vec())
    }

    /// Transfers one asset and returns its public reference.
    ///
    /// Repeated transfers of the same field overwrite the same object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetTransfer`] if the download, the upload or the
    /// visibility change fails.
    pub async fn transfer(&self, url: &str, record_id: &str, field: &str) -> Result<String> {
        let data = self.download(url).await?;
        let kind = AssetKind::sniff(&data);
        let path = object_path(record_id, field, kind);

        debug!(
            "Transferring {} ({} bytes, {}) to {}",
            field,
            data.len(),
            kind.content_type(),
            path
        );

        self.objects.upload(&path, data, kind.content_type()).await?;
        self.objects.make_public(&path).await?;
        Ok(self.objects.public_url(&path))
    }

    /// Transfers one asset, falling back to the source URL on failure.
    pub async fn transfer_or_passthrough(
        &self,
        url: &str,
        record_id: &str,
        field: &str,
    ) -> AssetOutcome {
        match self.transfer(url, record_id, field).await {
            Ok(reference) => AssetOutcome::Transferred(reference),
            Err(e) => {
                warn!(
                    "Asset {} of {} not transferred, keeping source URL: {}",
                    field, record_id, e
                );
                AssetOutcome::Passthrough {
                    url: url.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }
}
