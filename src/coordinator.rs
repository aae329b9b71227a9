//! Single-flight access token refresh
//!
//! [`TokenRefreshCoordinator`] makes sure every outgoing request carries an access
//! token that is not about to expire. When several requests discover an expiring
//! token at once, the first one issues the refresh call and the rest wait in a
//! queue for its outcome:
//!
//! ```text
//!   Idle ──(token needs refresh)──▶ Refreshing ──(refresh settles)──▶ Idle
//!                                     │
//!                                     └─ later callers are queued, then all
//!                                        receive the same token or error
//! ```
//!
//! A failed refresh ends the session: stored credentials are wiped and the
//! [`SessionListener`] is told to move the application to its logged-out state.

use reqwest::Method;
use std::sync::{Arc, Mutex, MutexGuard};
use tokenrelay_protocol::api::{RefreshTokenRequest, RefreshTokenResponse};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::store::CredentialStore;
use crate::token::{self, Clock};
use crate::transport::{ApiRequest, AuthMode, HttpTransport, PreparedRequest, RawResponse};

/// Receives the signal that the session can no longer be renewed
pub trait SessionListener: Send + Sync {
    fn on_session_expired(&self, reason: &RelayError);
}

/// Listener that only logs; the CLI tells the user to log in again from the error itself
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionListener;

impl SessionListener for LoggingSessionListener {
    fn on_session_expired(&self, reason: &RelayError) {
        warn!("Session expired, login required: {}", reason);
    }
}

/// Observable refresh state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

type Waiter = oneshot::Sender<Result<String>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

fn lock_state(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Settles the queue exactly once, including when the refreshing caller is dropped mid-flight.
struct InFlight<'a> {
    state: &'a Mutex<RefreshState>,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, outcome: &Result<String>) {
        self.settled = true;
        let previous = std::mem::replace(&mut *lock_state(self.state), RefreshState::Idle);
        let waiters = match previous {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        };

        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Releasing queued callers");
        }
        for waiter in waiters {
            // A waiter that went away no longer needs the answer.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Token refresh abandoned before it settled");
            self.settle(&Err(RelayError::unexpected_state(
                "Token refresh was abandoned before it completed",
            )));
        }
    }
}

/// Keeps access tokens fresh for one client, with at most one refresh call in flight
pub struct TokenRefreshCoordinator<T> {
    config: ClientConfig,
    transport: Arc<T>,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn SessionListener>,
    state: Mutex<RefreshState>,
}

impl<T> std::fmt::Debug for TokenRefreshCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefreshCoordinator")
            .field("refresh_path", &self.config.refresh_path)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<T> TokenRefreshCoordinator<T> {
    pub fn phase(&self) -> RefreshPhase {
        match &*lock_state(&self.state) {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Refreshing { .. } => RefreshPhase::Refreshing,
        }
    }

    /// Callers currently queued behind the in-flight refresh
    pub fn pending_count(&self) -> usize {
        match &*lock_state(&self.state) {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }
}

impl<T: HttpTransport> TokenRefreshCoordinator<T> {
    pub fn new(
        config: ClientConfig,
        transport: Arc<T>,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            config,
            transport,
            credentials,
            clock,
            listener,
            state: Mutex::new(RefreshState::Idle),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn is_expiring_soon(&self, access_token: &str) -> bool {
        token::is_expiring_soon(
            access_token,
            self.clock.now(),
            self.config.refresh_threshold(),
        )
    }

    /// Resolve the bearer token for `request` and build the wire request.
    ///
    /// Renews the stored token first when it is expiring soon; a failed renewal
    /// aborts the request with an authentication error.
    pub async fn prepare_request(&self, request: &ApiRequest) -> Result<PreparedRequest> {
        if request.auth == AuthMode::Anonymous || self.config.is_refresh_endpoint(&request.path)
        {
            return Ok(self.build(request, None));
        }

        let access_token = match self.credentials.access_token() {
            Some(access_token) => access_token,
            None if request.auth == AuthMode::Required => {
                return Err(RelayError::session_not_found(
                    "No access token stored, please log in",
                ));
            }
            None => return Ok(self.build(request, None)),
        };

        let access_token = if self.is_expiring_soon(&access_token) {
            debug!(path = %request.path, "Access token expiring soon, renewing before request");
            self.ensure_fresh_token().await?
        } else {
            access_token
        };

        Ok(self.build(request, Some(access_token)))
    }

    /// Obtain a renewed access token, joining the in-flight refresh if there is one.
    pub async fn ensure_fresh_token(&self) -> Result<String> {
        let queued = {
            let mut state = lock_state(&self.state);
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "Token refresh in flight, queueing caller");
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = queued {
            return rx.await.unwrap_or_else(|_| {
                Err(RelayError::unexpected_state(
                    "Token refresh ended without an outcome",
                ))
            });
        }

        let mut in_flight = InFlight {
            state: &self.state,
            settled: false,
        };
        let outcome = self.refresh().await;
        in_flight.settle(&outcome);
        outcome
    }

    /// Replay `request` once after the server rejected its credentials.
    ///
    /// Only a 401 on a request that has not been retried yet is replayed. When the
    /// renewal fails the original error is returned.
    pub async fn handle_response_error(
        &self,
        request: &mut ApiRequest,
        sent_token: Option<&str>,
        error: RelayError,
    ) -> Result<RawResponse> {
        if !error.is_unauthorized()
            || request.retried
            || request.auth == AuthMode::Anonymous
            || self.config.is_refresh_endpoint(&request.path)
        {
            return Err(error);
        }
        request.retried = true;

        let access_token = match self.replaced_token(sent_token) {
            Some(access_token) => {
                debug!(path = %request.path, "Access token already renewed, reusing it");
                access_token
            }
            None => match self.ensure_fresh_token().await {
                Ok(access_token) => access_token,
                Err(refresh_error) => {
                    debug!(path = %request.path, "Not retrying request: {}", refresh_error);
                    return Err(error);
                }
            },
        };

        info!(method = %request.method, path = %request.path, "Retrying request with renewed token");
        let prepared = self.build(request, Some(access_token));
        self.transport.execute(&prepared).await
    }

    /// The stored token, when another request already swapped it for a usable one
    fn replaced_token(&self, sent_token: Option<&str>) -> Option<String> {
        let current = self.credentials.access_token()?;
        if Some(current.as_str()) == sent_token || self.is_expiring_soon(&current) {
            return None;
        }
        Some(current)
    }

    fn build(&self, request: &ApiRequest, bearer_token: Option<String>) -> PreparedRequest {
        PreparedRequest {
            method: request.method.clone(),
            url: self.config.endpoint_url(&request.path),
            body: request.body.clone(),
            bearer_token,
        }
    }

    async fn refresh(&self) -> Result<String> {
        let pair = match self.request_new_pair().await {
            Ok(pair) => pair,
            Err(cause) => return Err(self.end_session(cause)),
        };

        if let Err(cause) = self
            .credentials
            .save_pair(&pair.access_token, pair.refresh_token.as_deref())
        {
            return Err(self.end_session(cause));
        }

        info!(rotated = pair.refresh_token.is_some(), "Access token renewed");
        Ok(pair.access_token)
    }

    async fn request_new_pair(&self) -> Result<RefreshTokenResponse> {
        let refresh_token = self
            .credentials
            .refresh_token()
            .ok_or_else(|| RelayError::session_not_found("No refresh token available"))?;

        let body = serde_json::to_value(RefreshTokenRequest { refresh_token })?;
        let request = PreparedRequest {
            method: Method::POST,
            url: self.config.endpoint_url(&self.config.refresh_path),
            body: Some(body),
            bearer_token: None,
        };

        debug!(url = %request.url, "Requesting new access token");
        let response = self.transport.execute(&request).await?.into_result()?;
        let pair: RefreshTokenResponse = response.json()?;

        if pair.access_token.is_empty() {
            return Err(RelayError::invalid_response(
                "Refresh response carried no access token",
            ));
        }
        Ok(pair)
    }

    fn end_session(&self, cause: RelayError) -> RelayError {
        warn!("Token refresh failed, clearing session: {}", cause);
        if let Err(e) = self.credentials.clear() {
            warn!("Failed to clear stored credentials: {}", e);
        }

        let error = RelayError::refresh_failed(&cause);
        self.listener.on_session_expired(&error);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tests::mocks::{
        make_jwt, refresh_body, test_config, ManualClock, MockTransport, RecordingListener,
        REFRESH_PATH,
    };
    use crate::store::MemoryTokenStorage;
    use chrono::{DateTime, Duration, Utc};
    use futures::future::join_all;

    struct Fixture {
        coordinator: Arc<TokenRefreshCoordinator<MockTransport>>,
        transport: Arc<MockTransport>,
        clock: Arc<ManualClock>,
        listener: Arc<RecordingListener>,
        credentials: CredentialStore,
    }

    /// Session whose access token expires `expires_in` from now
    fn fixture(expires_in: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap(),
        ));
        let transport = Arc::new(MockTransport::new().with_latency(20));
        let listener = Arc::new(RecordingListener::default());
        let credentials = CredentialStore::new(Arc::new(MemoryTokenStorage::new()));

        let expiry = clock.now() + expires_in;
        credentials
            .save_pair(&make_jwt(expiry.timestamp()), Some("refresh-1"))
            .unwrap();

        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            test_config(),
            transport.clone(),
            credentials.clone(),
            clock.clone(),
            listener.clone(),
        ));

        Fixture {
            coordinator,
            transport,
            clock,
            listener,
            credentials,
        }
    }

    impl Fixture {
        fn renewed_token(&self) -> String {
            make_jwt((self.clock.now() + Duration::hours(1)).timestamp())
        }
    }

    #[tokio::test]
    async fn test_fresh_token_is_attached_without_refresh() {
        let f = fixture(Duration::minutes(10));
        let stored = f.credentials.access_token().unwrap();

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/contracts"))
            .await
            .unwrap();

        assert_eq!(prepared.bearer_token.as_deref(), Some(stored.as_str()));
        assert_eq!(prepared.url, "http://mock.local/api/contracts");
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_token_at_threshold_is_not_refreshed() {
        let f = fixture(Duration::minutes(5));

        f.coordinator
            .prepare_request(&ApiRequest::get("/movements"))
            .await
            .unwrap();

        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_refresh() {
        let f = fixture(Duration::minutes(4));
        let renewed = f.renewed_token();
        f.transport
            .push_response(REFRESH_PATH, 200, refresh_body(&renewed, Some("refresh-2")));

        let requests = [
            ApiRequest::get("/contracts"),
            ApiRequest::get("/service-orders"),
            ApiRequest::get("/chats"),
        ];
        let results = join_all(
            requests
                .iter()
                .map(|request| f.coordinator.prepare_request(request)),
        )
        .await;

        assert_eq!(f.transport.calls_to(REFRESH_PATH), 1);
        for result in results {
            assert_eq!(result.unwrap().bearer_token.as_deref(), Some(renewed.as_str()));
        }
        assert_eq!(f.coordinator.phase(), RefreshPhase::Idle);
        assert_eq!(f.coordinator.pending_count(), 0);
        assert_eq!(f.credentials.access_token().as_deref(), Some(renewed.as_str()));
        assert_eq!(f.credentials.refresh_token().as_deref(), Some("refresh-2"));
        assert_eq!(f.listener.count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_sends_stored_refresh_token() {
        let f = fixture(Duration::minutes(1));
        f.transport
            .push_response(REFRESH_PATH, 200, refresh_body(&f.renewed_token(), None));

        f.coordinator.ensure_fresh_token().await.unwrap();

        let refresh = f.transport.requests_to(REFRESH_PATH).remove(0);
        assert_eq!(refresh.method, Method::POST);
        assert!(refresh.bearer_token.is_none());
        assert_eq!(
            refresh.body,
            Some(serde_json::json!({ "refreshToken": "refresh-1" }))
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_first() {
        let f = fixture(Duration::minutes(-30));
        let renewed = f.renewed_token();
        f.transport
            .push_response(REFRESH_PATH, 200, refresh_body(&renewed, None));

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/persons"))
            .await
            .unwrap();

        assert_eq!(prepared.bearer_token.as_deref(), Some(renewed.as_str()));
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 1);
        // Not rotated, the original refresh token stays.
        assert_eq!(f.credentials.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_every_caller_and_clears_session() {
        let f = fixture(Duration::minutes(4));
        f.transport.push_response(
            REFRESH_PATH,
            401,
            r#"{"message":"refresh token revoked"}"#,
        );

        let requests = [
            ApiRequest::get("/contracts"),
            ApiRequest::get("/licenses"),
            ApiRequest::get("/movements"),
        ];
        let results = join_all(
            requests
                .iter()
                .map(|request| f.coordinator.prepare_request(request)),
        )
        .await;

        let errors: Vec<RelayError> = results.into_iter().map(|r| r.unwrap_err()).collect();
        assert_eq!(errors.len(), 3);
        for error in &errors {
            assert_eq!(error.code(), ErrorCode::TokenRefreshFailed);
            assert!(error.is_auth_error());
            assert_eq!(error.to_string(), errors[0].to_string());
        }
        assert!(errors[0].to_string().contains("refresh token revoked"));

        assert_eq!(f.transport.calls_to(REFRESH_PATH), 1);
        assert!(f.credentials.access_token().is_none());
        assert!(f.credentials.refresh_token().is_none());
        assert_eq!(f.listener.count(), 1);
        assert_eq!(f.listener.reasons(), vec![errors[0].to_string()]);
        assert_eq!(f.coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_network_failure_during_refresh_is_terminal() {
        let f = fixture(Duration::minutes(2));
        f.transport
            .push_error(REFRESH_PATH, RelayError::network("connection reset"));

        let (a, b) = tokio::join!(
            f.coordinator.ensure_fresh_token(),
            f.coordinator.ensure_fresh_token()
        );

        assert!(a.unwrap_err().to_string().contains("connection reset"));
        assert!(b.unwrap_err().to_string().contains("connection reset"));
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 1);
        assert!(!f.credentials.has_tokens());
        assert_eq!(f.listener.count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_refresh_response_ends_session() {
        let f = fixture(Duration::minutes(2));
        f.transport
            .push_response(REFRESH_PATH, 200, r#"{"accessToken":""}"#);

        let err = f.coordinator.ensure_fresh_token().await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::TokenRefreshFailed);
        assert!(!f.credentials.has_tokens());
        assert_eq!(f.listener.count(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network_call() {
        let f = fixture(Duration::minutes(1));
        f.credentials.clear().unwrap();
        f.credentials
            .save_pair(&make_jwt((f.clock.now() + Duration::minutes(1)).timestamp()), None)
            .unwrap();

        let err = f
            .coordinator
            .prepare_request(&ApiRequest::get("/contracts"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::TokenRefreshFailed);
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
        assert!(!f.credentials.has_tokens());
        assert_eq!(f.listener.count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_without_refresh_token_still_goes_through() {
        let f = fixture(Duration::minutes(30));
        let access = f.credentials.access_token().unwrap();
        f.credentials.clear().unwrap();
        f.credentials.save_pair(&access, None).unwrap();

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/persons"))
            .await
            .unwrap();

        assert_eq!(prepared.bearer_token.as_deref(), Some(access.as_str()));
        assert_eq!(f.listener.count(), 0);
    }

    #[tokio::test]
    async fn test_requests_without_stored_token() {
        let f = fixture(Duration::minutes(30));
        f.credentials.clear().unwrap();

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/public/rates"))
            .await
            .unwrap();
        assert!(prepared.bearer_token.is_none());

        let err = f
            .coordinator
            .prepare_request(&ApiRequest::get("/contracts").with_auth(AuthMode::Required))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_refresh_endpoint_and_anonymous_requests_bypass_refresh() {
        let f = fixture(Duration::minutes(1));

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::post(REFRESH_PATH, serde_json::json!({})))
            .await
            .unwrap();
        assert!(prepared.bearer_token.is_none());

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/health").with_auth(AuthMode::Anonymous))
            .await
            .unwrap();
        assert!(prepared.bearer_token.is_none());

        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_sequential_expiries_refresh_each_time() {
        let f = fixture(Duration::minutes(4));
        let first = f.renewed_token();
        f.transport
            .push_response(REFRESH_PATH, 200, refresh_body(&first, None));
        f.coordinator.ensure_fresh_token().await.unwrap();

        // Renewed token lives an hour; move close to its end.
        f.clock.advance(Duration::minutes(57));
        let second = f.renewed_token();
        f.transport
            .push_response(REFRESH_PATH, 200, refresh_body(&second, None));

        let prepared = f
            .coordinator
            .prepare_request(&ApiRequest::get("/chats"))
            .await
            .unwrap();

        assert_eq!(prepared.bearer_token.as_deref(), Some(second.as_str()));
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 2);
    }

    #[tokio::test]
    async fn test_abandoned_refresh_releases_queued_callers() {
        let f = fixture(Duration::minutes(1));
        let transport = Arc::new(MockTransport::new().with_latency(200));
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            test_config(),
            transport.clone(),
            f.credentials.clone(),
            f.clock.clone(),
            f.listener.clone(),
        ));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    std::time::Duration::from_millis(20),
                    coordinator.ensure_fresh_token(),
                )
                .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(coordinator.phase(), RefreshPhase::Refreshing);

        let queued = coordinator.ensure_fresh_token().await;

        assert_eq!(queued.unwrap_err().code(), ErrorCode::UnexpectedState);
        assert!(leader.await.unwrap().is_err());
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
        // Cancellation is not a refresh failure.
        assert!(f.credentials.has_tokens());
        assert_eq!(f.listener.count(), 0);
    }

    #[tokio::test]
    async fn test_response_error_reuses_token_renewed_elsewhere() {
        let f = fixture(Duration::minutes(10));
        let sent = f.credentials.access_token().unwrap();
        let renewed = f.renewed_token();
        f.credentials.save_pair(&renewed, None).unwrap();

        let mut request = ApiRequest::get("/contracts");
        let response = f
            .coordinator
            .handle_response_error(
                &mut request,
                Some(&sent),
                RelayError::unauthorized("jwt expired"),
            )
            .await
            .unwrap();

        assert!(request.retried);
        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
        let echoed: serde_json::Value = response.json().unwrap();
        assert_eq!(echoed["token"], renewed);
    }

    #[tokio::test]
    async fn test_response_error_ignores_other_failures_and_retried_requests() {
        let f = fixture(Duration::minutes(10));
        let sent = f.credentials.access_token();

        let mut request = ApiRequest::get("/contracts");
        let err = f
            .coordinator
            .handle_response_error(&mut request, sent.as_deref(), RelayError::api(500, "boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Api { status: 500, .. }));
        assert!(!request.retried);

        let mut request = ApiRequest::get("/contracts");
        request.retried = true;
        let err = f
            .coordinator
            .handle_response_error(
                &mut request,
                sent.as_deref(),
                RelayError::unauthorized("still no"),
            )
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        assert_eq!(f.transport.calls_to(REFRESH_PATH), 0);
        assert_eq!(f.transport.requests().len(), 0);
    }
}
