//! Authentication strategies and credential refresh.

use crate::config::DEFAULT_TIMEOUT;
use crate::errors::{IntegrationError, IntegrationResult, TransportErrorCode};
use crate::events::{EventBus, EventKind};
use crate::observability::TracingHooks;
use crate::transport::{HttpRequest, HttpTransport, RequestBody};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default header carrying an API key.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Default query parameter carrying an API key.
pub const DEFAULT_API_KEY_PARAM: &str = "api_key";

/// Where an API key is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyPlacement {
    /// Request header.
    Header {
        /// Header name.
        name: String,
    },
    /// Query parameter.
    Query {
        /// Parameter name.
        param: String,
    },
    /// Field of a JSON object or form body. Skipped for GET and HEAD.
    Body {
        /// Field name.
        field: String,
    },
}

impl ApiKeyPlacement {
    /// `X-API-Key` header placement.
    pub fn header() -> Self {
        Self::Header {
            name: DEFAULT_API_KEY_HEADER.to_string(),
        }
    }

    /// `api_key` query placement.
    pub fn query() -> Self {
        Self::Query {
            param: DEFAULT_API_KEY_PARAM.to_string(),
        }
    }

    /// Body placement under `field`.
    pub fn body(field: impl Into<String>) -> Self {
        Self::Body {
            field: field.into(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Header { name } => name,
            Self::Query { param } => param,
            Self::Body { field } => field,
        }
    }
}

/// OAuth2 client credentials and the current token set.
#[derive(Debug, Clone)]
pub struct OAuth2Credentials {
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: SecretString,
    /// Authorization endpoint.
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Refresh endpoint; the token endpoint is used when absent.
    pub refresh_url: Option<String>,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Current access token.
    pub access_token: Option<SecretString>,
    /// Current refresh token.
    pub refresh_token: Option<SecretString>,
    /// Access token expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuth2Credentials {
    /// Creates credentials without tokens.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
            auth_url: auth_url.into(),
            token_url: token_url.into(),
            refresh_url: None,
            scopes: Vec::new(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Sets the current tokens.
    pub fn with_tokens(
        mut self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.access_token = Some(SecretString::new(access_token.into()));
        self.refresh_token = refresh_token.map(SecretString::new);
        self.expires_at = expires_at;
        self
    }

    /// Sets only the refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }

    /// Sets a dedicated refresh endpoint.
    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = Some(url.into());
        self
    }

    /// Sets the scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// True only when the expiry is strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp < now).unwrap_or(false)
    }

    fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some() && (self.access_token.is_none() || self.is_expired_at(now))
    }
}

/// What to do with an expired JWT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JwtExpiryPolicy {
    /// Attach the stale token and emit `AuthTokenExpired`.
    #[default]
    AttachStale,
    /// Fail with an authentication error.
    Reject,
}

/// A bearer JWT.
#[derive(Debug, Clone)]
pub struct JwtCredentials {
    /// The token.
    pub token: SecretString,
    /// Token expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Refresh token, if the issuer provided one.
    pub refresh_token: Option<SecretString>,
    /// Expiry handling.
    pub policy: JwtExpiryPolicy,
}

impl JwtCredentials {
    /// Creates a JWT credential without expiry.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            expires_at: None,
            refresh_token: None,
            policy: JwtExpiryPolicy::default(),
        }
    }

    /// Sets the expiry.
    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }

    /// Sets the expiry policy.
    pub fn policy(mut self, policy: JwtExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Caller-supplied authentication.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Returns the request with credentials attached.
    async fn authenticate(&self, request: HttpRequest) -> IntegrationResult<HttpRequest>;
}

/// Authentication scheme for an integration.
#[derive(Clone)]
pub enum AuthConfig {
    /// OAuth2 bearer token with refresh.
    OAuth2(OAuth2Credentials),
    /// Static API key.
    ApiKey {
        /// The key.
        key: SecretString,
        /// Where it goes.
        placement: ApiKeyPlacement,
    },
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: SecretString,
    },
    /// Bearer JWT.
    Jwt(JwtCredentials),
    /// Delegated to a handler.
    Custom(Arc<dyn AuthHandler>),
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth2(creds) => f.debug_tuple("OAuth2").field(creds).finish(),
            Self::ApiKey { key, placement } => f
                .debug_struct("ApiKey")
                .field("key", key)
                .field("placement", placement)
                .finish(),
            Self::Basic { username, password } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", password)
                .finish(),
            Self::Jwt(creds) => f.debug_tuple("Jwt").field(creds).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl AuthConfig {
    /// OAuth2 authentication.
    pub fn oauth2(credentials: OAuth2Credentials) -> Self {
        Self::OAuth2(credentials)
    }

    /// API key authentication.
    pub fn api_key(key: impl Into<String>, placement: ApiKeyPlacement) -> Self {
        Self::ApiKey {
            key: SecretString::new(key.into()),
            placement,
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// JWT authentication.
    pub fn jwt(credentials: JwtCredentials) -> Self {
        Self::Jwt(credentials)
    }

    /// Custom authentication.
    pub fn custom(handler: Arc<dyn AuthHandler>) -> Self {
        Self::Custom(handler)
    }

    /// Scheme name for logging.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::OAuth2(_) => "oauth2",
            Self::ApiKey { .. } => "api_key",
            Self::Basic { .. } => "basic",
            Self::Jwt(_) => "jwt",
            Self::Custom(_) => "custom",
        }
    }

    /// Checks that required credential material is present.
    pub fn validate(&self) -> IntegrationResult<()> {
        match self {
            Self::OAuth2(creds) => {
                if creds.client_id.is_empty() {
                    return Err(IntegrationError::validation("OAuth2 client_id is required"));
                }
                if creds.token_url.is_empty() && creds.refresh_url.is_none() {
                    return Err(IntegrationError::validation(
                        "OAuth2 token_url or refresh_url is required",
                    ));
                }
            }
            Self::ApiKey { key, placement } => {
                if key.expose_secret().is_empty() {
                    return Err(IntegrationError::validation("API key cannot be empty"));
                }
                if placement.name().is_empty() {
                    return Err(IntegrationError::validation(
                        "API key placement needs a name",
                    ));
                }
            }
            Self::Basic { username, .. } => {
                if username.is_empty() {
                    return Err(IntegrationError::validation("Basic auth username is required"));
                }
            }
            Self::Jwt(creds) => {
                if creds.token.expose_secret().is_empty() {
                    return Err(IntegrationError::validation("JWT cannot be empty"));
                }
            }
            Self::Custom(_) => {}
        }
        Ok(())
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default)]
    pub token_type: Option<String>,
    /// Expires in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Reissued refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Attaches credentials and refreshes OAuth2 tokens in place.
///
/// Concurrent callers that find an expired OAuth2 token queue on a single
/// refresh; whoever refreshes first updates the shared token set and the
/// rest reuse it.
pub struct AuthManager {
    integration_id: String,
    config: RwLock<AuthConfig>,
    refresh_lock: tokio::sync::Mutex<()>,
    transport: Arc<dyn HttpTransport>,
    events: EventBus,
    refresh_count: AtomicU64,
    refresh_timeout: Duration,
}

impl AuthManager {
    /// Creates an authentication manager.
    pub fn new(
        integration_id: impl Into<String>,
        config: AuthConfig,
        transport: Arc<dyn HttpTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            integration_id: integration_id.into(),
            config: RwLock::new(config),
            refresh_lock: tokio::sync::Mutex::new(()),
            transport,
            events,
            refresh_count: AtomicU64::new(0),
            refresh_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds each token refresh round trip.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Current credentials, tokens included.
    pub fn config(&self) -> AuthConfig {
        self.config.read().clone()
    }

    /// Number of completed OAuth2 refreshes.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Returns `request` with credentials attached.
    pub async fn authenticate(&self, mut request: HttpRequest) -> IntegrationResult<HttpRequest> {
        let config = self.config();
        debug!(
            integration_id = %self.integration_id,
            scheme = config.scheme(),
            "Attaching credentials"
        );

        match config {
            AuthConfig::OAuth2(_) => {
                let token = self.oauth2_access_token().await?;
                request
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {}", token));
            }
            AuthConfig::ApiKey { key, placement } => {
                Self::attach_api_key(&mut request, key.expose_secret(), &placement)?;
            }
            AuthConfig::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password.expose_secret()));
                request
                    .headers
                    .insert("Authorization".to_string(), format!("Basic {}", encoded));
            }
            AuthConfig::Jwt(creds) => {
                self.check_jwt_expiry(&creds)?;
                request.headers.insert(
                    "Authorization".to_string(),
                    format!("Bearer {}", creds.token.expose_secret()),
                );
            }
            AuthConfig::Custom(handler) => {
                request = handler.authenticate(request).await?;
            }
        }

        Ok(request)
    }

    fn attach_api_key(
        request: &mut HttpRequest,
        key: &str,
        placement: &ApiKeyPlacement,
    ) -> IntegrationResult<()> {
        match placement {
            ApiKeyPlacement::Header { name } => {
                request.headers.insert(name.clone(), key.to_string());
            }
            ApiKeyPlacement::Query { param } => {
                request.query.push((param.clone(), key.to_string()));
            }
            ApiKeyPlacement::Body { field } => {
                if request.method.is_safe() {
                    return Ok(());
                }
                match request.body.as_mut() {
                    None => {
                        let mut map = serde_json::Map::new();
                        map.insert(field.clone(), serde_json::Value::String(key.to_string()));
                        request.body = Some(RequestBody::Json(serde_json::Value::Object(map)));
                    }
                    Some(RequestBody::Json(serde_json::Value::Object(map))) => {
                        map.insert(field.clone(), serde_json::Value::String(key.to_string()));
                    }
                    Some(RequestBody::Form(pairs)) => {
                        pairs.push((field.clone(), key.to_string()));
                    }
                    Some(_) => {
                        return Err(IntegrationError::authentication(
                            "API key body placement needs a JSON object or form body",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_jwt_expiry(&self, creds: &JwtCredentials) -> IntegrationResult<()> {
        let Some(expired_at) = creds.expires_at.filter(|exp| *exp < Utc::now()) else {
            return Ok(());
        };

        match creds.policy {
            JwtExpiryPolicy::Reject => Err(IntegrationError::authentication(format!(
                "JWT expired at {}",
                expired_at
            ))),
            JwtExpiryPolicy::AttachStale => {
                if creds.refresh_token.is_some() {
                    debug!(
                        integration_id = %self.integration_id,
                        expired_at = %expired_at,
                        "Attaching expired JWT"
                    );
                    self.events.emit(EventKind::AuthTokenExpired { expired_at });
                }
                Ok(())
            }
        }
    }

    /// `Ok(None)` means a refresh is required.
    fn current_oauth2_token(&self, now: DateTime<Utc>) -> IntegrationResult<Option<String>> {
        let guard = self.config.read();
        let AuthConfig::OAuth2(creds) = &*guard else {
            return Err(IntegrationError::authentication(
                "Integration is not configured for OAuth2",
            ));
        };

        if creds.needs_refresh_at(now) {
            return Ok(None);
        }

        match &creds.access_token {
            Some(_) if creds.is_expired_at(now) => Err(IntegrationError::authentication(
                "OAuth2 access token expired and no refresh token is available",
            )),
            Some(token) => Ok(Some(token.expose_secret().clone())),
            None => Err(IntegrationError::authentication(
                "OAuth2 access token is missing and no refresh token is available",
            )),
        }
    }

    async fn oauth2_access_token(&self) -> IntegrationResult<String> {
        if let Some(token) = self.current_oauth2_token(Utc::now())? {
            return Ok(token);
        }

        let _refresh = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.current_oauth2_token(Utc::now())? {
            return Ok(token);
        }

        self.refresh_oauth2().await
    }

    /// Exchanges the refresh token for a new token set.
    async fn refresh_oauth2(&self) -> IntegrationResult<String> {
        let (url, form) = {
            let guard = self.config.read();
            let AuthConfig::OAuth2(creds) = &*guard else {
                return Err(IntegrationError::authentication(
                    "Integration is not configured for OAuth2",
                ));
            };
            let refresh_token = creds.refresh_token.as_ref().ok_or_else(|| {
                IntegrationError::authentication("No refresh token available")
            })?;
            let url = creds
                .refresh_url
                .clone()
                .unwrap_or_else(|| creds.token_url.clone());
            let form = vec![
                ("grant_type".to_string(), "refresh_token".to_string()),
                (
                    "refresh_token".to_string(),
                    refresh_token.expose_secret().clone(),
                ),
                ("client_id".to_string(), creds.client_id.clone()),
                (
                    "client_secret".to_string(),
                    creds.client_secret.expose_secret().clone(),
                ),
            ];
            (url, form)
        };

        debug!(integration_id = %self.integration_id, url = %url, "Refreshing OAuth2 token");

        let timeout = self.refresh_timeout;
        let request = HttpRequest::post(url)
            .header("Accept", "application/json")
            .form(form)
            .with_timeout(timeout);

        let sent = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::transport(
                TransportErrorCode::Timeout,
                format!("Token refresh timed out after {}ms", timeout.as_millis()),
            )),
        };
        let response = sent.map_err(|e| {
            IntegrationError::authentication(format!("Token refresh failed: {}", e.message()))
                .with_cause(e)
        })?;

        if !response.is_success() {
            return Err(IntegrationError::authentication(format!(
                "Token refresh rejected: {}",
                response.text()
            ))
            .with_status(response.status));
        }

        let token: TokenResponse = response.json().map_err(|e| {
            IntegrationError::authentication("Token refresh returned an unreadable body")
                .with_cause(e)
        })?;

        let expires_at = token
            .expires_in
            .and_then(|secs| expiry_after(Utc::now(), secs));

        {
            let mut guard = self.config.write();
            if let AuthConfig::OAuth2(creds) = &mut *guard {
                creds.access_token = Some(SecretString::new(token.access_token.clone()));
                if let Some(refresh_token) = token.refresh_token {
                    creds.refresh_token = Some(SecretString::new(refresh_token));
                }
                creds.expires_at = expires_at;
            }
        }

        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        TracingHooks::on_auth_token_refresh(&self.integration_id, expires_at);
        self.events.emit(EventKind::AuthRefreshed { expires_at });

        Ok(token.access_token)
    }
}

/// `now + expires_in`, or `None` when the lifetime does not fit a timestamp.
fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(expires_in).ok()?;
    let lifetime = chrono::Duration::try_seconds(secs)?;
    now.checked_add_signed(lifetime)
}
