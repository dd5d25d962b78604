use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::auth::TokenRefresher;

use super::client::REFRESH_PATH;
use super::{ApiError, ApiRequest, Transport};

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
}

/// Token refresh over HTTP: `POST /auth/refresh` with the refresh token as
/// the bearer credential.
///
/// Talks to the transport directly. Going through the request pipeline would
/// let a 401 from the refresh endpoint trigger another refresh.
pub struct HttpRefresher {
    transport: Arc<dyn Transport>,
}

impl HttpRefresher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let response = self
            .transport
            .send(&ApiRequest::post(REFRESH_PATH), Some(refresh_token))
            .await
            .context("Failed to send token refresh request")?;

        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body))
                .context("Token refresh rejected");
        }

        let parsed: RefreshResponse = response
            .json()
            .context("Failed to parse token refresh response")?;
        debug!("Token refresh response received");
        Ok(parsed.access_token)
    }
}
