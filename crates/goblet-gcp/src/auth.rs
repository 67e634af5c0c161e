//! OAuth2 access tokens for Google Cloud APIs.
//!
//! Two credential sources are supported:
//!
//! 1. A service-account key: a JWT signed with the key's RSA private key is
//!    exchanged at the token endpoint
//!    (<https://developers.google.com/identity/protocols/oauth2/service-account>).
//! 2. The metadata server, when running on Cloud Run, Cloud Functions or
//!    Cloud Build.
//!
//! Tokens are cached and refreshed 60 s before expiry.

use crate::config::{ServiceAccountKey, CREDENTIALS_ENV_VAR};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// JWT claims for Google OAuth2.
#[derive(Debug, Serialize)]
struct JwtClaims {
    /// Issuer, the service account email.
    iss: String,
    /// Requested scopes (space-separated).
    scope: String,
    /// Audience, the token endpoint.
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// An OAuth2 access token with metadata.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// The bearer token string.
    pub token: String,
    /// When this token expires (unix timestamp seconds).
    pub expires_at: i64,
}

impl AccessToken {
    /// Check if the token is expired (with 60 s buffer).
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at - 60
    }
}

/// Where tokens come from.
#[derive(Debug, Clone)]
pub enum Credentials {
    ServiceAccount(ServiceAccountKey),
    MetadataServer,
}

impl Credentials {
    /// Key file from `GOOGLE_APPLICATION_CREDENTIALS`, else the metadata server.
    pub fn from_env() -> Result<Self, String> {
        match std::env::var(CREDENTIALS_ENV_VAR) {
            Ok(path) if !path.is_empty() => {
                let key = ServiceAccountKey::from_file(Path::new(&path))?;
                key.validate()?;
                Ok(Credentials::ServiceAccount(key))
            }
            _ => Ok(Credentials::MetadataServer),
        }
    }
}

/// Cached token manager.
pub struct TokenManager {
    credentials: Credentials,
    scopes: Vec<String>,
    cached_token: Mutex<Option<AccessToken>>,
    http_client: Client,
}

impl TokenManager {
    pub fn new(credentials: Credentials, scopes: Vec<String>, http_client: Client) -> Self {
        Self {
            credentials,
            scopes,
            cached_token: Mutex::new(None),
            http_client,
        }
    }

    /// Get a valid access token, refreshing if needed.
    pub async fn get_token(&self) -> Result<String, String> {
        let mut cached = self.cached_token.lock().await;
        if let Some(ref token) = *cached {
            if !token.is_expired() {
                return Ok(token.token.clone());
            }
        }
        let token = match &self.credentials {
            Credentials::ServiceAccount(key) => self.exchange_jwt(key).await?,
            Credentials::MetadataServer => self.fetch_metadata_token().await?,
        };
        let result = token.token.clone();
        *cached = Some(token);
        Ok(result)
    }

    /// Force refresh the token.
    pub async fn refresh(&self) -> Result<String, String> {
        *self.cached_token.lock().await = None;
        self.get_token().await
    }

    /// Service account email when known from the key file.
    pub fn service_account_email(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::ServiceAccount(key) => Some(&key.client_email),
            Credentials::MetadataServer => None,
        }
    }

    /// Exchange a JWT assertion for an access token.
    async fn exchange_jwt(&self, key: &ServiceAccountKey) -> Result<AccessToken, String> {
        let now = Utc::now().timestamp();

        let claims = JwtClaims {
            iss: key.client_email.clone(),
            scope: self.scopes.join(" "),
            aud: key.token_uri.clone(),
            exp: now + 3600,
            iat: now,
        };

        let header = Header {
            alg: Algorithm::RS256,
            kid: Some(key.private_key_id.clone()),
            ..Default::default()
        };

        // Normalise PEM line breaks.
        let pem = key.private_key.replace("\\n", "\n");
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| format!("Failed to load private key: {}", e))?;
        let jwt = encode(&header, &claims, &encoding_key)
            .map_err(|e| format!("Failed to encode JWT: {}", e))?;

        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", jwt.as_str()),
        ];
        let response = self
            .http_client
            .post(&key.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| format!("Token exchange request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Token exchange failed (HTTP {}): {}", status, body));
        }

        let token_resp: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse token response: {}", e))?;

        Ok(AccessToken {
            token: token_resp.access_token,
            expires_at: now + token_resp.expires_in.unwrap_or(3600),
        })
    }

    async fn fetch_metadata_token(&self) -> Result<AccessToken, String> {
        let now = Utc::now().timestamp();
        let response = self
            .http_client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| format!("Metadata server unreachable: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "Metadata token request failed (HTTP {})",
                response.status()
            ));
        }

        let token_resp: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse metadata token: {}", e))?;

        Ok(AccessToken {
            token: token_resp.access_token,
            expires_at: now + token_resp.expires_in.unwrap_or(3600),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_buffer() {
        let fresh = AccessToken {
            token: "t".into(),
            expires_at: Utc::now().timestamp() + 3600,
        };
        assert!(!fresh.is_expired());

        let nearly = AccessToken {
            token: "t".into(),
            expires_at: Utc::now().timestamp() + 30,
        };
        assert!(nearly.is_expired());
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let manager = TokenManager::new(
            Credentials::MetadataServer,
            crate::config::default_scopes(),
            Client::new(),
        );
        *manager.cached_token.lock().await = Some(AccessToken {
            token: "cached".into(),
            expires_at: Utc::now().timestamp() + 3600,
        });
        assert_eq!(manager.get_token().await.unwrap(), "cached");
        assert!(manager.service_account_email().is_none());
    }
}
