//! Access token acquisition
//!
//! A [`CredentialProvider`] hands out bearer tokens for the remote API.
//! Sources that talk to a token endpoint are wrapped in
//! [`CachedCredentials`], which reuses a token for at most
//! [`TOKEN_CACHE_LIFETIME`] and drops it on [`CredentialProvider::invalidate`]
//! so the next call re-authenticates.

use crate::config::{AuthMethod, SinkConfig};
use crate::error::{Result, SinkError};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

// ============================================================================
// Auth Constants
// ============================================================================

/// Longest time a fetched token is reused
pub const TOKEN_CACHE_LIFETIME: Duration = Duration::from_secs(1800);

/// OAuth scope requested for every token
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of the signed assertion sent to the token endpoint
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// A bearer token as returned by a token endpoint
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Option<Duration>,
}

/// Something that can mint a fresh token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Hands out bearer tokens to the API client
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;

    /// Forget any cached token
    async fn invalidate(&self);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl From<TokenResponse> for AccessToken {
    fn from(response: TokenResponse) -> Self {
        Self {
            token: response.access_token,
            expires_in: response.expires_in.map(Duration::from_secs),
        }
    }
}

async fn read_token_response(response: reqwest::Response) -> Result<AccessToken> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SinkError::auth(format!(
            "token request failed with status {}: {}",
            status.as_u16(),
            body
        )));
    }
    let token: TokenResponse = response.json().await?;
    Ok(token.into())
}

// ============================================================================
// Caching
// ============================================================================

struct CachedToken {
    token: String,
    valid_until: Instant,
}

/// Reuses tokens from `S` until they age out or are invalidated
pub struct CachedCredentials<S> {
    source: S,
    lifetime: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl<S: TokenSource> CachedCredentials<S> {
    pub fn new(source: S) -> Self {
        Self::with_lifetime(source, TOKEN_CACHE_LIFETIME)
    }

    pub fn with_lifetime(source: S, lifetime: Duration) -> Self {
        Self {
            source,
            lifetime,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for CachedCredentials<S> {
    async fn access_token(&self) -> Result<String> {
        // held across the fetch so concurrent callers share one request
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() < entry.valid_until {
                return Ok(entry.token.clone());
            }
        }

        let fresh = self.source.fetch_token().await?;
        let lifetime = fresh
            .expires_in
            .map_or(self.lifetime, |expires_in| expires_in.min(self.lifetime));
        debug!(lifetime_secs = lifetime.as_secs(), "Fetched access token");

        *cached = Some(CachedToken {
            token: fresh.token.clone(),
            valid_until: Instant::now() + lifetime,
        });
        Ok(fresh.token)
    }

    async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            info!("Cached access token invalidated");
        }
    }
}

/// Fixed token, e.g. one handed over by the environment
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {}
}

// ============================================================================
// Metadata server
// ============================================================================

/// Tokens of the instance's default service account
pub struct MetadataServerSource {
    client: Client,
    url: String,
}

impl MetadataServerSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        read_token_response(response).await
    }
}

// ============================================================================
// Service account (JWT bearer)
// ============================================================================

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Service account JSON key, only the fields used for signing
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Signs an RS256 assertion and trades it for an access token
pub struct ServiceAccountSource {
    client: Client,
    email: String,
    key: EncodingKey,
    token_uri: String,
}

impl ServiceAccountSource {
    pub fn new(
        client: Client,
        email: impl Into<String>,
        private_key_pem: &[u8],
        token_uri: impl Into<String>,
    ) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| SinkError::config(format!("invalid service account private key: {}", e)))?;
        Ok(Self {
            client,
            email: email.into(),
            key,
            token_uri: token_uri.into(),
        })
    }

    /// Key material from an email and a PEM key file
    pub fn from_pem_file(
        client: Client,
        email: impl Into<String>,
        path: &Path,
        token_uri: Option<&str>,
    ) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            SinkError::config(format!("failed to read private key {}: {}", path.display(), e))
        })?;
        Self::new(client, email, &pem, token_uri.unwrap_or(DEFAULT_TOKEN_URI))
    }

    /// Key material from a JSON key, given inline or as a file path.
    ///
    /// An explicit `token_uri` wins over the one embedded in the key.
    pub fn from_json_key(client: Client, json_key: &str, token_uri: Option<&str>) -> Result<Self> {
        let text = if json_key.trim_start().starts_with('{') {
            json_key.to_string()
        } else {
            std::fs::read_to_string(json_key)
                .map_err(|e| SinkError::config(format!("failed to read json_key {}: {}", json_key, e)))?
        };
        let key: ServiceAccountKey = serde_json::from_str(&text)
            .map_err(|e| SinkError::config(format!("invalid json_key: {}", e)))?;

        let token_uri = token_uri
            .map(str::to_string)
            .or(key.token_uri)
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        Self::new(client, key.client_email, key.private_key.as_bytes(), token_uri)
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    fn assertion(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.email,
            scope: BIGQUERY_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| SinkError::auth(format!("failed to sign assertion: {}", e)))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let assertion = self.assertion()?;
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        read_token_response(response).await
    }
}

/// Build the provider selected by `auth_method`
pub fn credentials_from_config(config: &SinkConfig, client: Client) -> Result<Arc<dyn CredentialProvider>> {
    let token_uri = config.token_uri.as_deref();
    let metadata_url = config
        .metadata_token_url
        .clone()
        .unwrap_or_else(|| DEFAULT_METADATA_TOKEN_URL.to_string());

    let provider: Arc<dyn CredentialProvider> = match config.auth_method()? {
        AuthMethod::PrivateKey => {
            let (Some(email), Some(path)) = (&config.email, &config.private_key_path) else {
                return Err(SinkError::config(
                    "'email' and 'private_key_path' must be specified if auth_method == 'private_key'",
                ));
            };
            let source = ServiceAccountSource::from_pem_file(client, email.clone(), path, token_uri)?;
            Arc::new(CachedCredentials::new(source))
        },
        AuthMethod::JsonKey => {
            let Some(json_key) = &config.json_key else {
                return Err(SinkError::config(
                    "'json_key' must be specified if auth_method == 'json_key'",
                ));
            };
            let source = ServiceAccountSource::from_json_key(client, json_key, token_uri)?;
            Arc::new(CachedCredentials::new(source))
        },
        AuthMethod::ComputeEngine => {
            Arc::new(CachedCredentials::new(MetadataServerSource::new(client, metadata_url)))
        },
        AuthMethod::ApplicationDefault => match &config.access_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(CachedCredentials::new(MetadataServerSource::new(client, metadata_url))),
        },
    };

    Ok(provider)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY_FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_account.pem");

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken {
                token: format!("token-{}", n),
                expires_in: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_token_reused_until_lifetime_elapses() {
        let credentials = CachedCredentials::new(CountingSource::default());

        assert_eq!(credentials.access_token().await.unwrap(), "token-1");
        assert_eq!(credentials.access_token().await.unwrap(), "token-1");

        tokio::time::advance(TOKEN_CACHE_LIFETIME - Duration::from_secs(1)).await;
        assert_eq!(credentials.access_token().await.unwrap(), "token-1");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(credentials.access_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let credentials = CachedCredentials::new(CountingSource::default());
        assert_eq!(credentials.access_token().await.unwrap(), "token-1");

        credentials.invalidate().await;
        assert_eq!(credentials.access_token().await.unwrap(), "token-2");
        assert_eq!(credentials.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_token() {
        let token = StaticToken::new("abc");
        token.invalidate().await;
        assert_eq!(token.access_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_metadata_server_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "meta-token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetadataServerSource::new(Client::new(), format!("{}/token", server.uri()));
        let token = source.fetch_token().await.unwrap();
        assert_eq!(token.token, "meta-token");
        assert_eq!(token.expires_in, Some(Duration::from_secs(3599)));
    }

    #[tokio::test]
    async fn test_token_endpoint_failure_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let source = MetadataServerSource::new(Client::new(), server.uri());
        let err = source.fetch_token().await.unwrap_err();
        assert!(matches!(err, SinkError::Auth(ref msg) if msg.contains("403")));
    }

    #[tokio::test]
    async fn test_service_account_exchanges_signed_assertion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .and(body_string_contains("assertion="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "sa-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token_uri = format!("{}/token", server.uri());
        let source = ServiceAccountSource::from_pem_file(
            Client::new(),
            "sink@proj.iam.gserviceaccount.com",
            Path::new(KEY_FIXTURE),
            Some(&token_uri),
        )
        .unwrap();

        assert_eq!(source.fetch_token().await.unwrap().token, "sa-token");

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        let assertion = body
            .split('&')
            .find_map(|pair| pair.strip_prefix("assertion="))
            .unwrap();

        let header = jsonwebtoken::decode_header(assertion).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);

        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.set_audience(&[token_uri.as_str()]);
        let claims = jsonwebtoken::decode::<serde_json::Value>(
            assertion,
            &jsonwebtoken::DecodingKey::from_secret(&[]),
            &validation,
        )
        .unwrap()
        .claims;
        assert_eq!(claims["iss"], "sink@proj.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], BIGQUERY_SCOPE);
    }

    #[tokio::test]
    async fn test_json_key_inline_uses_embedded_token_uri() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "json-token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pem = std::fs::read_to_string(KEY_FIXTURE).unwrap();
        let json_key = serde_json::json!({
            "type": "service_account",
            "client_email": "json@proj.iam.gserviceaccount.com",
            "private_key": pem,
            "token_uri": format!("{}/oauth/token", server.uri()),
        })
        .to_string();

        let source = ServiceAccountSource::from_json_key(Client::new(), &json_key, None).unwrap();
        assert_eq!(source.email(), "json@proj.iam.gserviceaccount.com");
        assert_eq!(source.fetch_token().await.unwrap().token, "json-token");
    }

    #[test]
    fn test_invalid_key_material_rejected() {
        assert!(matches!(
            ServiceAccountSource::new(Client::new(), "a@b", b"not a key", DEFAULT_TOKEN_URI),
            Err(SinkError::Config(_))
        ));
        assert!(ServiceAccountSource::from_json_key(Client::new(), "{\"client_email\": 1}", None).is_err());
        assert!(ServiceAccountSource::from_json_key(Client::new(), "/nonexistent/key.json", None).is_err());
    }
}
