//! HTTP transport layer.
//!
//! The pipeline never talks to the network directly; it hands a fully
//! prepared [`HttpRequest`] to an [`HttpTransport`]. Non-success statuses come
//! back as `Ok(HttpResponse)` so the executor can classify them; only
//! network-level failures are errors here.

use crate::errors::{IntegrationError, IntegrationResult, TransportErrorCode};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// HTTP method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET method.
    Get,
    /// HEAD method.
    Head,
    /// POST method.
    Post,
    /// PUT method.
    Put,
    /// PATCH method.
    Patch,
    /// DELETE method.
    Delete,
}

impl HttpMethod {
    /// Method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Safe methods carry no body.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Request body variants.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    /// JSON document.
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs, in order.
    Form(Vec<(String, String)>),
    /// Plain text.
    Text(String),
}

impl RequestBody {
    fn content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => "application/json",
            Self::Form(_) => "application/x-www-form-urlencoded",
            Self::Text(_) => "text/plain; charset=utf-8",
        }
    }

    fn to_bytes(&self) -> IntegrationResult<Vec<u8>> {
        match self {
            Self::Json(value) => serde_json::to_vec(value).map_err(|e| {
                IntegrationError::validation(format!("Failed to serialize JSON body: {}", e))
            }),
            Self::Form(pairs) => serde_urlencoded::to_string(pairs)
                .map(String::into_bytes)
                .map_err(|e| {
                    IntegrationError::validation(format!("Failed to encode form body: {}", e))
                }),
            Self::Text(text) => Ok(text.clone().into_bytes()),
        }
    }
}

/// HTTP request definition.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute request URL, without the query pairs below.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Query parameters, kept in insertion order.
    pub query: Vec<(String, String)>,
    /// Request body.
    pub body: Option<RequestBody>,
    /// Request timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Creates a request with no headers, query or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Creates a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Appends a query parameter.
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Sets a form body.
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(pairs));
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Looks up a header case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the query pairs in their given order.
    pub fn serialized_query(&self) -> String {
        serde_urlencoded::to_string(&self.query).unwrap_or_default()
    }

    /// Builds the final URL with query pairs appended.
    pub fn full_url(&self) -> IntegrationResult<Url> {
        let mut url = Url::parse(&self.url).map_err(|e| {
            IntegrationError::validation(format!("Invalid request URL {}: {}", self.url, e))
        })?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}

/// HTTP response definition.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, headers: HashMap<String, String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> IntegrationResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            IntegrationError::deserialization(format!("Failed to deserialize response: {}", e))
        })
    }
}

/// HTTP transport interface (for dependency injection).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send an HTTP request.
    async fn send(&self, request: HttpRequest) -> IntegrationResult<HttpResponse>;
}

/// Default reqwest-based HTTP transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a fresh client.
    pub fn new() -> IntegrationResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                IntegrationError::validation(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self::with_client(client))
    }

    /// Creates a transport around a pre-built client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(error: reqwest::Error) -> IntegrationError {
        let code = if error.is_timeout() {
            TransportErrorCode::Timeout
        } else if error.is_connect() {
            let text = format!("{:?}", error).to_ascii_lowercase();
            if text.contains("dns") || text.contains("resolve") {
                TransportErrorCode::DnsFailure
            } else {
                TransportErrorCode::ConnectionRefused
            }
        } else if error.is_request() || error.is_body() {
            TransportErrorCode::ConnectionReset
        } else {
            TransportErrorCode::Other
        };
        IntegrationError::transport(code, format!("Request failed: {}", error)).with_cause(error)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> IntegrationResult<HttpResponse> {
        let url = request.full_url()?;
        let mut builder = self.client.request(request.method.into(), url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            if request.header_value("content-type").is_none() {
                builder = builder.header("content-type", body.content_type());
            }
            builder = builder.body(body.to_bytes()?);
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(Self::map_error)?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }

        let body = response.bytes().await.map_err(Self::map_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
