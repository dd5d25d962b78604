//! Scripted collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use tokio::time::Instant;

use crate::api::{ApiError, ApiRequest, ApiResponse, DiagnosticsSink, ErrorReport, Transport};
use crate::auth::{Navigator, TokenRefresher};
use crate::models::{Identity, Role};

pub fn identity(role: Role) -> Identity {
    Identity {
        id: "42".to_string(),
        email: format!("{}@example.com", role),
        display_name: None,
        role,
    }
}

pub fn reply(status: u16, body: &str) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse {
        status,
        body: body.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
    pub at: Instant,
}

type Handler =
    Box<dyn Fn(&ApiRequest, Option<&str>, usize) -> Result<ApiResponse, ApiError> + Send + Sync>;

/// Transport whose replies come from a closure. The closure also receives
/// how many earlier requests went to the same path.
pub struct ScriptedTransport {
    handler: Handler,
    latency: Duration,
    path_latency: HashMap<String, Duration>,
    sent: Mutex<Vec<SentRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, Option<&str>, usize) -> Result<ApiResponse, ApiError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            path_latency: HashMap::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Latency for one path, overriding the default
    pub fn with_path_latency(mut self, path: &str, latency: Duration) -> Self {
        self.path_latency.insert(path.to_string(), latency);
        self
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, path: &str) -> Vec<SentRequest> {
        self.sent().into_iter().filter(|r| r.path == path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        let nth = {
            let mut sent = self.sent.lock().unwrap();
            let nth = sent.iter().filter(|r| r.path == request.path).count();
            sent.push(SentRequest {
                method: request.method.clone(),
                path: request.path.clone(),
                bearer: bearer.map(str::to_owned),
                body: request.body.clone(),
                at: Instant::now(),
            });
            nth
        };
        let result = (self.handler)(request, bearer, nth);
        let latency = self
            .path_latency
            .get(&request.path)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }
}

pub struct CountingRefresher {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    outcome: std::result::Result<String, String>,
    delay: Duration,
}

impl CountingRefresher {
    pub fn succeeding(token: &str) -> Self {
        Self::with_outcome(Ok(token.to_string()))
    }

    pub fn failing(reason: &str) -> Self {
        Self::with_outcome(Err(reason.to_string()))
    }

    fn with_outcome(outcome: std::result::Result<String, String>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            outcome,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(refresh_token.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone().map_err(anyhow::Error::msg)
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_string());
    }
}

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn record(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}
