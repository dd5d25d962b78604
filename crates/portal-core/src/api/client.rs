//! Request pipeline for the portal REST API.
//!
//! Every call made by a page goes through `ApiClient::execute`, which attaches
//! the current access token, refreshes it once on a 401 and backs off on
//! server faults and network failures. Retries and refreshes are invisible to
//! the caller: it gets the final success or the final classified error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{Navigator, SessionStore};
use crate::config::Config;
use crate::models::Identity;

use super::diagnostics::{DiagnosticsSink, ErrorReport, TracingSink};
use super::refresh::HttpRefresher;
use super::retry::{Decision, Outcome, RetryContext, RetryPolicy};
use super::{ApiError, ApiRequest, ApiResponse, HttpTransport, Transport};

// ============================================================================
// Constants
// ============================================================================

pub(crate) const LOGIN_PATH: &str = "/auth/login";
pub(crate) const REFRESH_PATH: &str = "/auth/refresh";
pub(crate) const ME_PATH: &str = "/auth/me";
pub(crate) const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";
pub(crate) const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

/// `/auth/me` payload: the identity plus the password-change flag
#[derive(Debug, Deserialize)]
struct MeResponse {
    #[serde(flatten)]
    identity: Identity,
    #[serde(default, alias = "forcePasswordChange")]
    force_password_change: bool,
}

#[derive(Debug, Serialize)]
struct ChangePasswordRequest<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

/// Resilient API client. Clone is cheap and clones share one session.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: SessionStore,
    policy: RetryPolicy,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, session: SessionStore) -> Self {
        Self {
            transport,
            session,
            policy: RetryPolicy::default(),
            diagnostics: Arc::new(TracingSink),
        }
    }

    /// Build the HTTP stack described by `config` and restore any saved session
    pub async fn connect(config: &Config, navigator: Arc<dyn Navigator>) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(
                config.api_base_url.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )
            .context("Failed to build HTTP client")?,
        );
        let storage = config.session_storage()?;
        let refresher = Arc::new(HttpRefresher::new(Arc::clone(&transport)));
        let session = SessionStore::new(storage, refresher, navigator);

        session.hydrate().await;
        let authenticated = session.check_auth().await;
        debug!(authenticated, "Session initialized");

        Ok(Self::new(transport, session))
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Run one logical call through the retry and refresh policy.
    ///
    /// Each pass of the loop is one attempt; the policy bounds the chain at
    /// one refresh and three backoff retries.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut ctx = RetryContext::default();

        loop {
            // Read the token per attempt so a refresh or logout is observed
            ctx.attached_token = self.session.access_token().await;
            let result = self
                .transport
                .send(request, ctx.attached_token.as_deref())
                .await;

            match self.policy.decide(&ctx, Outcome::of(&result)) {
                Decision::Return => return result,
                Decision::RefreshAndRetry => {
                    ctx = ctx.after_refresh();
                    let current = self.session.access_token().await;
                    if ctx.token_replaced(current.as_deref()) {
                        // Another call refreshed after this one was sent
                        debug!(path = %request.path, "Unauthorized with a replaced token, retrying");
                        continue;
                    }
                    debug!(path = %request.path, "Unauthorized, refreshing access token");
                    if self.session.refresh_access_token().await.is_none() {
                        return Err(self.surface(request, result));
                    }
                }
                Decision::RetryAfter(delay) => {
                    ctx = ctx.after_transient();
                    warn!(
                        path = %request.path,
                        retry = ctx.transient_retry_count,
                        backoff_ms = delay.as_millis() as u64,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Decision::Surface => return Err(self.surface(request, result)),
            }
        }
    }

    /// Turn the last attempt into the caller's error and report it
    fn surface(&self, request: &ApiRequest, result: Result<ApiResponse, ApiError>) -> ApiError {
        let error = match result {
            Ok(response) => ApiError::from_status(response.status, &response.body),
            Err(e) => e,
        };
        self.diagnostics
            .record(ErrorReport::new(request.method.as_str(), &request.path, &error));
        error
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.execute(&request).await?.json()
    }

    // ===== Page caller helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.call(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.call(ApiRequest::new(Method::PUT, path).json(body)?).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.call(ApiRequest::new(Method::PATCH, path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(ApiRequest::new(Method::DELETE, path)).await
    }

    // ===== Session lifecycle =====

    /// One attempt straight on the transport, outside the retry policy
    async fn send_direct<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<T, ApiError> {
        let response = self.transport.send(request, bearer).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        response.json()
    }

    /// Sign in and replace the session.
    ///
    /// Bypasses the refresh policy: a 401 here means bad credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).json(&LoginRequest { email, password })?;
        let tokens: TokenResponse = self.send_direct(&request, None).await?;

        let me: MeResponse = self
            .send_direct(&ApiRequest::get(ME_PATH), Some(&tokens.access_token))
            .await?;

        self.session
            .set_auth(
                tokens.access_token,
                tokens.refresh_token,
                me.identity.clone(),
                me.force_password_change,
            )
            .await;
        Ok(me.identity)
    }

    /// Re-read `/auth/me` and update identity and gate flag
    pub async fn refresh_identity(&self) -> Result<Identity, ApiError> {
        let me: MeResponse = self.get(ME_PATH).await?;
        self.session.set_identity(me.identity.clone()).await;
        self.session
            .set_force_password_change(me.force_password_change)
            .await;
        Ok(me.identity)
    }

    /// Change the password; success lifts the password-change gate
    pub async fn change_password(&self, current: &str, new: &str) -> Result<(), ApiError> {
        let body = ChangePasswordRequest {
            current_password: current,
            new_password: new,
        };
        let request = ApiRequest::post(CHANGE_PASSWORD_PATH).json(&body)?;
        self.execute(&request).await?;
        self.session.complete_password_change().await;
        Ok(())
    }

    /// Tell the backend (best effort), then end the local session
    pub async fn logout(&self) {
        if let Some(token) = self.session.access_token().await {
            match self
                .transport
                .send(&ApiRequest::post(LOGOUT_PATH), Some(&token))
                .await
            {
                Ok(response) if response.is_success() => debug!("Backend session revoked"),
                Ok(response) => warn!(status = response.status, "Backend logout rejected"),
                Err(e) => warn!(error = %e, "Backend logout failed"),
            }
        }
        self.session.logout().await;
        info!("Logged out");
    }
}
