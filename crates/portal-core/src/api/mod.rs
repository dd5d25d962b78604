//! Resilient REST client for the portal backend.
//!
//! This module provides the `ApiClient` request pipeline used by every page.
//! It attaches the session's bearer token, refreshes it once when the backend
//! answers 401, and retries server faults and network failures with
//! exponential backoff before surfacing the error.

pub mod client;
pub mod diagnostics;
pub mod error;
pub mod refresh;
pub mod retry;
pub mod transport;

pub use client::ApiClient;
pub use diagnostics::{DiagnosticsSink, ErrorReport, ReportKind, TracingSink};
pub use error::ApiError;
pub use refresh::HttpRefresher;
pub use retry::{Decision, Outcome, RetryContext, RetryPolicy};
pub use reqwest::Method;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
