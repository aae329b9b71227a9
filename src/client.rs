//! HTTP client with token refresh support

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokenrelay_protocol::api::{LoginRequest, LoginResponse, LogoutRequest};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::config::ClientConfig;
use crate::coordinator::{LoggingSessionListener, SessionListener, TokenRefreshCoordinator};
use crate::error::{RelayError, Result};
use crate::store::{CredentialStore, FileTokenStorage, MemoryTokenStorage, TokenStorage};
use crate::token::{self, Clock, SystemClock};
use crate::transport::{ApiRequest, AuthMode, HttpTransport, RawResponse, ReqwestTransport};

/// Snapshot of the stored session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub username: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub remaining: Option<Duration>,
    pub expiring_soon: bool,
    pub has_refresh_token: bool,
}

/// HTTP client with authentication support.
///
/// Each instance owns one [`TokenRefreshCoordinator`], so independently configured
/// clients never share refresh state.
pub struct HttpClient<T = ReqwestTransport> {
    config: ClientConfig,
    transport: Arc<T>,
    coordinator: TokenRefreshCoordinator<T>,
}

impl<T> std::fmt::Debug for HttpClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.config.base_url)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl HttpClient<ReqwestTransport> {
    /// Client backed by `reqwest`, the configured token storage and the wall clock
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config)?;

        let storage: Arc<dyn TokenStorage> = if config.token_storage.enabled {
            Arc::new(FileTokenStorage::new(config.token_storage.clone().into())?)
        } else {
            Arc::new(MemoryTokenStorage::new())
        };

        Ok(Self::new(
            config,
            Arc::new(transport),
            storage,
            Arc::new(SystemClock),
            Arc::new(LoggingSessionListener),
        ))
    }
}

impl<T: HttpTransport> HttpClient<T> {
    pub fn new(
        config: ClientConfig,
        transport: Arc<T>,
        storage: Arc<dyn TokenStorage>,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let coordinator = TokenRefreshCoordinator::new(
            config.clone(),
            transport.clone(),
            CredentialStore::new(storage),
            clock,
            listener,
        );

        Self {
            config,
            transport,
            coordinator,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &TokenRefreshCoordinator<T> {
        &self.coordinator
    }

    fn credentials(&self) -> &CredentialStore {
        self.coordinator.credentials()
    }

    /// Send a request, renewing the token beforehand and retrying once on 401
    pub async fn send(&self, mut request: ApiRequest) -> Result<RawResponse> {
        let prepared = self.coordinator.prepare_request(&request).await?;
        debug!(method = %prepared.method, url = %prepared.url, "Sending request");

        let response = self.transport.execute(&prepared).await?;
        match response.into_result() {
            Ok(response) => Ok(response),
            Err(error) => {
                let response = self
                    .coordinator
                    .handle_response_error(&mut request, prepared.bearer_token.as_deref(), error)
                    .await?;
                response.into_result()
            }
        }
    }

    pub async fn send_json<R: DeserializeOwned>(&self, request: ApiRequest) -> Result<R> {
        self.send(request).await?.json()
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post<R: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<R> {
        self.send_json(ApiRequest::post(path, body)).await
    }

    pub async fn put<R: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<R> {
        self.send_json(ApiRequest::put(path, body)).await
    }

    pub async fn delete<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.send_json(ApiRequest::delete(path)).await
    }

    /// Exchange credentials for a token pair and store it
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        request.validate()?;

        let api_request = ApiRequest::post(self.config.login_path.clone(), serde_json::to_value(&request)?)
            .with_auth(AuthMode::Anonymous);
        let response: LoginResponse = match self.send_json(api_request).await {
            Ok(response) => response,
            Err(e) if e.is_unauthorized() => {
                return Err(RelayError::authentication("Invalid username or password"));
            }
            Err(e) => return Err(e),
        };

        if response.access_token.is_empty() || response.refresh_token.is_empty() {
            return Err(RelayError::invalid_response(
                "Login response is missing tokens",
            ));
        }

        let username = response.username.as_deref().unwrap_or(username);
        self.credentials().save_login(
            &response.access_token,
            &response.refresh_token,
            Some(username),
        )?;

        info!(username = %username, "Logged in");
        Ok(username.to_string())
    }

    /// Revoke the refresh token when possible and forget the session either way.
    ///
    /// The refresh token travels in the body, so the revoke never renews the access
    /// token first.
    pub async fn logout(&self) -> Result<()> {
        if let Some(refresh_token) = self.credentials().refresh_token() {
            let request = ApiRequest::new(Method::POST, self.config.logout_path.clone())
                .with_body(serde_json::to_value(LogoutRequest { refresh_token })?)
                .with_auth(AuthMode::Anonymous);
            if let Err(e) = self.send(request).await {
                warn!("Failed to revoke refresh token: {}", e);
            }
        }

        self.credentials().clear()?;
        info!("Logged out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials().has_tokens()
    }

    pub fn current_username(&self) -> Option<String> {
        self.credentials().username()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        let access_token = self.credentials().access_token()?;
        let now = self.coordinator.clock().now();

        Some(SessionInfo {
            username: self.current_username(),
            access_token_expires_at: token::expires_at(&access_token),
            remaining: token::remaining_lifetime(&access_token, now),
            expiring_soon: self.coordinator.is_expiring_soon(&access_token),
            has_refresh_token: self.credentials().refresh_token().is_some(),
        })
    }
}
