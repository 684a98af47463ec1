use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::operation::{OperationType, PendingOperation};
use crate::token::TokenManager;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Server error: {0} - {1}")]
    Server(u16, String),
    #[error("Validation error: {0} - {1}")]
    Validation(u16, String),
    #[error("Authorization failed")]
    Unauthorized,
    #[error("Refresh attempt throttled")]
    RefreshThrottled,
    #[error("Session expired, re-authentication required")]
    SessionExpired,
    #[error("Credential storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// Retryable failures leave the operation Pending for a backoff retry;
    /// everything else is terminal for the operation or the whole session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Server(_, _)
                | ApiError::RefreshThrottled
                | ApiError::Storage(_)
        )
    }
}

/// Token pair returned by `POST /auth/refresh`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// TTL of the access token in seconds
    pub expires_in: i64,
}

/// Full session returned by `POST /auth/verify-otp`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user_id: String,
    pub user_phone: String,
    pub user_role: String,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct VerifyOtpRequest<'a> {
    phone: &'a str,
    otp: &'a str,
}

/// Thin HTTP client for the backend. Holds no credential state; the
/// authenticated surface lives on `ResilientClient`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Exchange phone + OTP for a session.
    pub async fn verify_otp(&self, phone: &str, otp: &str) -> Result<SessionResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/verify-otp"))
            .json(&VerifyOtpRequest { phone, otp })
            .send()
            .await?;

        let response = classify_response(response).await?;
        Ok(response.json().await?)
    }

    /// Consume the refresh token for a new token pair. The backend rejects a
    /// refresh token on its second use, so this must only ever be called
    /// from inside the token manager's refresh lock.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        tracing::debug!("Refreshing session tokens");
        let response = self
            .client
            .post(self.url("/auth/refresh"))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let response = classify_response(response).await?;
        Ok(response.json().await?)
    }

    /// Reachability probe: any response at all means the server is reachable.
    pub async fn check_connectivity(&self) -> bool {
        match self.client.head(self.url("/")).send().await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Connectivity check successful");
                true
            }
            Err(e) => {
                tracing::debug!("Connectivity check failed: {}", e);
                false
            }
        }
    }
}

async fn classify_response(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let error_body = response.text().await.unwrap_or_default();

    match code {
        401 => Err(ApiError::Unauthorized),
        400..=499 => Err(ApiError::Validation(code, error_body)),
        _ => Err(ApiError::Server(code, error_body)),
    }
}

/// Wraps every authenticated call with the single-flight refresh protocol.
///
/// On a 401, exactly one concurrent caller performs the refresh under the
/// token manager's lock; all others await the same lock and retry with the
/// token the winner produced. No caller retries more than once per original
/// request.
pub struct ResilientClient {
    api: ApiClient,
    tokens: Arc<TokenManager>,
}

impl ResilientClient {
    pub fn new(api: ApiClient, tokens: Arc<TokenManager>) -> Self {
        Self { api, tokens }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Log in and persist the resulting session.
    pub async fn login(&self, phone: &str, otp: &str) -> Result<(), ApiError> {
        let session = self.api.verify_otp(phone, otp).await?;
        let mut credentials = crate::credentials::Credentials::new(
            session.access_token,
            session.refresh_token,
            session.expires_in,
        );
        credentials.user_id = Some(session.user_id);
        credentials.user_phone = Some(session.user_phone);
        credentials.user_role = Some(session.user_role);
        self.tokens
            .save_session(credentials)
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.tokens
            .clear_tokens()
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))
    }

    /// Execute a queued operation against the backend.
    ///
    /// The idempotency key is the operation id, so a retried submission of
    /// the same operation cannot create duplicate server-side effects.
    pub async fn submit_operation(&self, operation: &PendingOperation) -> Result<(), ApiError> {
        // Silent background refresh inside the proactive window, so
        // foreground requests are not blocked on an expired token later.
        if self.tokens.needs_refresh().await && self.tokens.try_begin_refresh() {
            if let Err(e) = self.run_refresh().await {
                tracing::debug!("Proactive refresh failed: {}", e);
            }
        }

        let token = self.tokens.access_token().await;
        if let Some(token) = &token {
            match self.send_once(operation, token).await {
                Err(ApiError::Unauthorized) => {}
                other => return other,
            }
        }

        // Either no usable token, or the backend rejected the one we had.
        self.refresh_after_unauthorized(token.as_deref()).await?;

        let fresh = match self.tokens.access_token().await {
            Some(fresh) => fresh,
            None => return Err(ApiError::SessionExpired),
        };
        match self.send_once(operation, &fresh).await {
            // A second 401 with a freshly refreshed token means the session
            // is truly invalid.
            Err(ApiError::Unauthorized) => {
                let _ = self.tokens.clear_tokens().await;
                Err(ApiError::SessionExpired)
            }
            other => other,
        }
    }

    async fn send_once(&self, operation: &PendingOperation, token: &str) -> Result<(), ApiError> {
        let (method, url) = self.endpoint_for(operation);
        let response = self
            .api
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("Idempotency-Key", operation.idempotency_key())
            .header("Content-Type", "application/json")
            .body(operation.payload.clone())
            .send()
            .await?;

        classify_response(response).await?;
        Ok(())
    }

    fn endpoint_for(&self, operation: &PendingOperation) -> (Method, String) {
        let entity = operation.related_entity_id.as_deref().unwrap_or_default();
        match operation.operation_type {
            OperationType::CreateBooking => (Method::POST, self.api.url("/bookings")),
            OperationType::UpdateBooking => {
                (Method::PUT, self.api.url(&format!("/bookings/{}", entity)))
            }
            OperationType::CancelBooking => (
                Method::POST,
                self.api.url(&format!("/bookings/{}/cancel", entity)),
            ),
            OperationType::UpdateProfile => (Method::PUT, self.api.url("/profile")),
            OperationType::SyncLocation => (Method::POST, self.api.url("/locations")),
            OperationType::Custom => (Method::POST, self.api.url("/operations")),
        }
    }

    /// Single-flight entry point after a 401. The winner refreshes under the
    /// lock; followers wait for the in-flight refresh and use its outcome;
    /// a rate-limited attempt with nothing in flight defers to backoff.
    async fn refresh_after_unauthorized(
        &self,
        stale_token: Option<&str>,
    ) -> Result<(), ApiError> {
        if self.tokens.try_begin_refresh() {
            return self.run_refresh().await;
        }

        if self.tokens.is_refreshing() {
            self.await_refresh_outcome().await;
            if self.tokens.access_token().await.is_some() {
                return Ok(());
            }
            return Err(ApiError::SessionExpired);
        }

        // Rate-limited with nothing in flight. Usable only if another caller
        // already rotated the token inside the window; the one the backend
        // just rejected is not worth resending.
        match self.tokens.access_token().await {
            Some(current) if Some(current.as_str()) != stale_token => Ok(()),
            _ => Err(ApiError::RefreshThrottled),
        }
    }

    /// Follower side of single-flight: block until the winner's critical
    /// section has finished. The flag is set before the winner takes the
    /// lock, so loop until it is actually cleared.
    async fn await_refresh_outcome(&self) {
        while self.tokens.is_refreshing() {
            self.tokens.wait_for_refresh().await;
            tokio::task::yield_now().await;
        }
    }

    /// Winner side of single-flight: perform the refresh network call and
    /// persist the new pair, all under the refresh lock.
    ///
    /// A backend rejection of the refresh token is fatal for the session:
    /// tokens are cleared and SessionExpired surfaces. Network failures keep
    /// the session for a later attempt.
    async fn run_refresh(&self) -> Result<(), ApiError> {
        let refresh_token = self.tokens.refresh_token().await;

        let result = self
            .tokens
            .with_refresh_lock(|| async {
                let refresh_token = refresh_token.ok_or(ApiError::SessionExpired)?;
                let pair = self.api.refresh(&refresh_token).await?;
                self.tokens
                    .save_tokens(pair.access_token, pair.refresh_token, pair.expires_in)
                    .await
                    .map_err(|e| ApiError::Storage(e.to_string()))?;
                Ok::<(), ApiError>(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::warn!("Token refresh failed (retryable): {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Refresh token rejected, clearing session: {}", e);
                let _ = self.tokens.clear_tokens().await;
                Err(ApiError::SessionExpired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore};
    use crate::operation::PendingOperation;
    use wiremock::matchers::{body_json_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seeded_client(server_uri: String, expires_in: i64) -> ResilientClient {
        let tm = Arc::new(TokenManager::new(Arc::new(MemoryCredentialStore::new())));
        tm.save_session(Credentials::new("access-token", "refresh-token", expires_in))
            .await
            .unwrap();
        ResilientClient::new(ApiClient::new(server_uri), tm)
    }

    #[tokio::test]
    async fn test_submit_operation_sends_idempotency_key() {
        let mock_server = MockServer::start().await;
        let op = PendingOperation::new(
            OperationType::CreateBooking,
            r#"{"pickup":"a","drop":"b"}"#.to_string(),
        );

        Mock::given(method("POST"))
            .and(path("/bookings"))
            .and(header("Idempotency-Key", op.id.as_str()))
            .and(header("Authorization", "Bearer access-token"))
            .and(body_json_string(op.payload.clone()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = seeded_client(mock_server.uri(), 3600).await;
        client.submit_operation(&op).await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_routing_uses_entity_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/bookings/booking-42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::UpdateBooking, "{}".to_string())
            .with_entity("booking-42");
        let client = seeded_client(mock_server.uri(), 3600).await;
        client.submit_operation(&op).await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad phone number"))
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::UpdateProfile, "{}".to_string());
        let client = seeded_client(mock_server.uri(), 3600).await;

        let err = client.submit_operation(&op).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(422, _)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_failure_is_retryable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/locations"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::SyncLocation, "{}".to_string());
        let client = seeded_client(mock_server.uri(), 3600).await;

        let err = client.submit_operation(&op).await.unwrap_err();
        assert!(matches!(err, ApiError::Server(503, _)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_401_triggers_refresh_and_retry() {
        let mock_server = MockServer::start().await;

        // Old token is rejected once; the refreshed one succeeds.
        Mock::given(method("POST"))
            .and(path("/bookings"))
            .and(header("Authorization", "Bearer access-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bookings"))
            .and(header("Authorization", "Bearer new-access"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::CreateBooking, "{}".to_string());
        let client = seeded_client(mock_server.uri(), 3600).await;

        client.submit_operation(&op).await.unwrap();
        assert_eq!(
            client.tokens().refresh_token().await.as_deref(),
            Some("new-refresh")
        );
    }

    #[tokio::test]
    async fn test_second_401_after_refresh_expires_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bookings"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::CreateBooking, "{}".to_string());
        let client = seeded_client(mock_server.uri(), 3600).await;

        let err = client.submit_operation(&op).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        // Terminal authorization failure clears credential state.
        assert!(client.tokens().current().await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_clears_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bookings"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let op = PendingOperation::new(OperationType::CreateBooking, "{}".to_string());
        let client = seeded_client(mock_server.uri(), 3600).await;

        let err = client.submit_operation(&op).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert!(client.tokens().current().await.is_none());
    }

    #[tokio::test]
    async fn test_login_persists_full_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/verify-otp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "session-access",
                "refresh_token": "session-refresh",
                "expires_in": 3600,
                "user_id": "user-7",
                "user_phone": "+917777777777",
                "user_role": "customer"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tm = Arc::new(TokenManager::new(Arc::new(MemoryCredentialStore::new())));
        let client = ResilientClient::new(ApiClient::new(mock_server.uri()), tm);

        client.login("+917777777777", "123456").await.unwrap();

        let session = client.tokens().current().await.unwrap();
        assert_eq!(session.access_token, "session-access");
        assert_eq!(session.user_id.as_deref(), Some("user-7"));
        assert_eq!(session.user_role.as_deref(), Some("customer"));
    }

    #[tokio::test]
    async fn test_check_connectivity() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let api = ApiClient::new(mock_server.uri());
        assert!(api.check_connectivity().await);

        let unreachable = ApiClient::new("http://127.0.0.1:1".to_string());
        assert!(!unreachable.check_connectivity().await);
    }
}
