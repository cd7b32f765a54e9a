//! Server-to-server request signing for the CloudKit Web Services API.
//!
//! Every request is signed over `timestamp:base64(sha256(body)):path` with the
//! container's ECDSA P-256 key. The nonce is randomized, so two signatures of
//! the same message differ; verify them with the public key instead.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::RandomizedSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use rand_core::OsRng;
use reqwest::RequestBuilder;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Header carrying the server-to-server key identifier.
pub const KEY_ID_HEADER: &str = "X-Apple-CloudKit-Request-KeyID";
/// Header carrying the request timestamp.
pub const DATE_HEADER: &str = "X-Apple-CloudKit-Request-ISO8601Date";
/// Header carrying the base64 request signature.
pub const SIGNATURE_HEADER: &str = "X-Apple-CloudKit-Request-SignatureV1";

/// Formats a timestamp the way the signing protocol expects it.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Returns base64(sha256(body)).
#[must_use]
pub fn body_digest(body: &str) -> String {
    STANDARD.encode(Sha256::digest(body.as_bytes()))
}

/// Builds the canonical string that gets signed.
#[must_use]
pub fn signing_string(timestamp: &str, path: &str, body: &str) -> String {
    format!("{}:{}:{}", timestamp, body_digest(body), path)
}

/// Authentication headers for one outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Key identifier.
    pub key_id: String,
    /// ISO-8601 UTC timestamp used in the signature.
    pub timestamp: String,
    /// Base64 DER signature.
    pub signature: String,
}

impl SignedHeaders {
    /// Attaches the headers to a request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(KEY_ID_HEADER, &self.key_id)
            .header(DATE_HEADER, &self.timestamp)
            .header(SIGNATURE_HEADER, &self.signature)
    }
}

/// Signs source API requests with a key loaded once at startup.
#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    key: SigningKey,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Creates a signer from an already-parsed key.
    #[must_use]
    pub fn new(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }

    /// Parses a PEM private key (`EC PRIVATE KEY` or PKCS#8 `PRIVATE KEY`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthSetup`] if the key id is empty or the PEM is not a
    /// P-256 private key.
    pub fn from_pem(key_id: impl Into<String>, pem: &str) -> Result<Self> {
        let key_id = key_id.into();
        if key_id.trim().is_empty() {
            return Err(Error::AuthSetup("signing key id is empty".to_string()));
        }

        let secret = SecretKey::from_sec1_pem(pem)
            .or_else(|_| SecretKey::from_pkcs8_pem(pem))
            .map_err(|e| Error::AuthSetup(format!("invalid EC private key: {}", e)))?;

        Ok(Self::new(key_id, SigningKey::from(secret)))
    }

    /// Reads and parses the private key file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthSetup`] if the file cannot be read or parsed.
    pub fn from_pem_file(key_id: impl Into<String>, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::AuthSetup(format!(
                "cannot read signing key '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_pem(key_id, &pem)
    }

    /// Key identifier sent with every request.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Public half of the signing key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }

    /// Signs `timestamp:digest:path` and returns the base64 DER signature.
    #[must_use]
    pub fn sign(&self, timestamp: &str, path: &str, body: &str) -> String {
        let message = signing_string(timestamp, path, body);
        let signature: Signature = self.key.sign_with_rng(&mut OsRng, message.as_bytes());
        STANDARD.encode(signature.to_der().as_bytes())
    }

    /// Produces the headers for a request sent now.
    #[must_use]
    pub fn sign_request(&self, path: &str, body: &str) -> SignedHeaders {
        self.sign_request_at(Utc::now(), path, body)
    }

    /// Produces the headers for a request sent at `at`.
    #[must_use]
    pub fn sign_request_at(&self, at: DateTime<Utc>, path: &str, body: &str) -> SignedHeaders {
        let timestamp = format_timestamp(at);
        let signature = self.sign(&timestamp, path, body);
        SignedHeaders {
            key_id: self.key_id.clone(),
            timestamp,
            signature,
        }
    }
}

#[cfg(test)]
#[path = "signer_tests.rs"]
mod tests;
