//! Request types and the network seam under the HTTP client

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};

/// How a request treats the stored access token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Attach a token when one is stored, otherwise go out unauthenticated
    #[default]
    Optional,
    /// Fail before sending when no token is stored
    Required,
    /// Never attach a token
    Anonymous,
}

/// A request as issued by callers, relative to the configured base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub auth: AuthMode,
    /// Set once the request has been replayed after a 401
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            auth: AuthMode::default(),
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }
}

/// A request ready for the wire
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub bearer_token: Option<String>,
}

impl PreparedRequest {
    pub fn authorization_header(&self) -> Option<String> {
        self.bearer_token
            .as_ref()
            .map(|token| format!("Bearer {}", token))
    }
}

/// Status and body of a response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        // Empty 2xx bodies decode as JSON null.
        let body = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(body).map_err(|e| {
            RelayError::invalid_response(format!("Invalid API response: {} ({})", e, self.body))
        })
    }

    /// Server supplied error text, falling back to `fallback`
    pub fn error_message(&self, fallback: &str) -> String {
        serde_json::from_str::<ErrorBody>(&self.body)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Map a non-2xx status to the matching error
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            200..=299 => Ok(self),
            401 => Err(RelayError::unauthorized(
                self.error_message("Authentication failed"),
            )),
            403 => Err(RelayError::authorization(
                self.error_message("Insufficient permissions"),
            )),
            status => Err(RelayError::api(status, self.error_message("Unknown API error"))),
        }
    }
}

/// Executes prepared requests
pub trait HttpTransport: Send + Sync + 'static {
    fn execute(
        &self,
        request: &PreparedRequest,
    ) -> impl Future<Output = Result<RawResponse>> + Send;
}

/// `reqwest` backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let mut client_builder = Client::builder().timeout(Duration::from_secs(config.timeout));

        if !config.use_proxy {
            client_builder = client_builder.no_proxy();
        }

        let client = client_builder.build()?;

        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse> {
        let mut request_builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header("Content-Type", "application/json");

        if let Some(header) = request.authorization_header() {
            request_builder = request_builder.header("Authorization", header);
        }

        if let Some(body) = &request.body {
            request_builder = request_builder.json(body);
        }

        let response = request_builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            RelayError::network(format!("Failed to read response from {}: {}", request.url, e))
        })?;

        Ok(RawResponse { status, body })
    }
}
