//! Retry and refresh policy for one logical call.
//!
//! Rules, in order:
//! 1. 2xx returns unchanged.
//! 2. 401 with no auth retry yet: refresh the token, then retry once. If the
//!    store already holds a newer token than the one sent, retry with that
//!    token instead of refreshing again.
//! 3. 401 after the auth retry: surface it.
//! 4. 5xx or no response, fewer than 3 transient retries: back off and retry.
//! 5. Anything else: surface it.

use std::time::Duration;

use super::{ApiError, ApiResponse};

/// Maximum number of refresh-and-retry rounds per logical call
const MAX_AUTH_RETRIES: u8 = 1;

/// Maximum number of retries for 5xx and network failures.
/// 3 retries with exponential backoff ride out a deploy or a brief overload.
const MAX_TRANSIENT_RETRIES: u8 = 3;

/// Backoff base in milliseconds; the n-th retry waits base * 2^n.
const BACKOFF_BASE_MS: u64 = 500;

/// Retry state threaded through every attempt of one logical call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub auth_retry_count: u8,
    pub transient_retry_count: u8,
    /// Access token the latest attempt was sent with
    pub attached_token: Option<String>,
}

impl RetryContext {
    /// Whether the store moved on to another token since the latest attempt
    /// was sent, i.e. some other call already refreshed it.
    pub fn token_replaced(&self, current: Option<&str>) -> bool {
        current.is_some() && current != self.attached_token.as_deref()
    }

    pub fn after_refresh(self) -> Self {
        Self {
            auth_retry_count: self.auth_retry_count + 1,
            ..self
        }
    }

    pub fn after_transient(self) -> Self {
        Self {
            transient_retry_count: self.transient_retry_count + 1,
            ..self
        }
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthFailure,
    Transient,
    Fatal,
}

impl Outcome {
    pub fn of(result: &Result<ApiResponse, ApiError>) -> Self {
        match result {
            Ok(response) if response.is_success() => Outcome::Success,
            Ok(response) => Self::of_error(&ApiError::from_status(response.status, "")),
            Err(e) => Self::of_error(e),
        }
    }

    fn of_error(error: &ApiError) -> Self {
        if error.is_auth_failure() {
            Outcome::AuthFailure
        } else if error.is_transient() {
            Outcome::Transient
        } else {
            Outcome::Fatal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Return,
    RefreshAndRetry,
    RetryAfter(Duration),
    Surface,
}

/// The fixed policy applied to every call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_auth_retries: u8,
    pub max_transient_retries: u8,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auth_retries: MAX_AUTH_RETRIES,
            max_transient_retries: MAX_TRANSIENT_RETRIES,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
        }
    }
}

impl RetryPolicy {
    pub fn decide(&self, ctx: &RetryContext, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success => Decision::Return,
            Outcome::AuthFailure if ctx.auth_retry_count < self.max_auth_retries => {
                Decision::RefreshAndRetry
            }
            Outcome::Transient if ctx.transient_retry_count < self.max_transient_retries => {
                Decision::RetryAfter(self.backoff_delay(ctx.transient_retry_count + 1))
            }
            Outcome::AuthFailure | Outcome::Transient | Outcome::Fatal => Decision::Surface,
        }
    }

    /// Delay before the `retry`-th transient retry (1-based)
    pub fn backoff_delay(&self, retry: u8) -> Duration {
        self.backoff_base * 2u32.saturating_pow(u32::from(retry))
    }
}
