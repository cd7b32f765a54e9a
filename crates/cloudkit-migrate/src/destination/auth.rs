//! OAuth access tokens for the Google Cloud destination APIs.
//!
//! A service account key is exchanged for a bearer token with a signed RS256
//! JWT assertion (the OAuth 2.0 JWT bearer grant). Tokens are cached until
//! shortly before they expire.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CredentialsConfig;
use crate::error::{Error, Result};
use crate::http::{create_http_client, failure_parts};

/// Scopes covering Firestore and Cloud Storage writes.
pub const SCOPES: &str =
    "https://www.googleapis.com/auth/datastore https://www.googleapis.com/auth/devstorage.read_write";

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// Supplies bearer tokens for destination requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a currently valid access token.
    async fn access_token(&self) -> Result<String>;
}

/// A fixed, pre-issued token.
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// The fields of a service account key file that the exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account email, used as the JWT issuer.
    pub client_email: String,
    /// PEM-encoded RSA private key.
    pub private_key: String,
    /// Token endpoint.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Project the key belongs to.
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges a service account key for access tokens.
pub struct ServiceAccountTokenSource {
    client_email: String,
    token_uri: String,
    key: EncodingKey,
    client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
    /// Creates a token source from a parsed key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthSetup`] if the private key is not a valid RSA PEM.
    pub fn from_key(key: ServiceAccountKey) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::AuthSetup(format!("invalid service account key: {}", e)))?;

        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            key: encoding_key,
            client: create_http_client(),
            cached: Mutex::new(None),
        })
    }

    /// Loads a service account key file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthSetup`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::AuthSetup(format!(
                "cannot read service account '{}': {}",
                path.display(),
                e
            ))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&content).map_err(|e| {
            Error::AuthSetup(format!(
                "invalid service account '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_key(key)
    }

    /// Builds the signed JWT assertion.
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            iss: &self.client_email,
            scope: SCOPES,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| Error::AuthSetup(format!("failed to sign token assertion: {}", e)))
    }

    async fn exchange(&self) -> Result<CachedToken> {
        let now = Utc::now();
        let assertion = self.assertion(now)?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = failure_parts(response).await;
            return Err(Error::AuthSetup(format!(
                "token exchange failed with status {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        debug!("Obtained access token valid for {}s", token.expires_in);

        Ok(CachedToken {
            token: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// Builds the token source described by the credentials configuration.
///
/// # Errors
///
/// Returns [`Error::AuthSetup`] if no credentials are configured or the key
/// cannot be loaded.
pub fn create_token_source(config: &CredentialsConfig) -> Result<Arc<dyn TokenSource>> {
    match (&config.service_account, &config.access_token) {
        (Some(path), _) => Ok(Arc::new(ServiceAccountTokenSource::from_file(path)?)),
        (None, Some(token)) => Ok(Arc::new(StaticToken::new(token.clone()))),
        (None, None) => Err(Error::AuthSetup(
            "no destination credentials configured".to_string(),
        )),
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
