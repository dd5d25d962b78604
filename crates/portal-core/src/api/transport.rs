//! One HTTP attempt, without any retry or refresh policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::ApiError;

/// A logical call as issued by a page. Every attempt of its retry chain
/// sends this same value.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A received response of any status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        // 204 and friends carry no body; let `()` and Option targets through
        let body = if self.body.trim().is_empty() { "null" } else { &self.body };
        serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

/// Sends one attempt. `Ok` for any received status, `Err` only when no
/// response arrived (network failure or timeout).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError>;
}

/// Transport backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");

        for (name, value) in &request.headers {
            // The outbound policy owns the credential header
            if name.eq_ignore_ascii_case(header::AUTHORIZATION.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = %request.method, url = %url, status, "Response received");

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new("https://api.example.com/v1/", Duration::from_secs(5))
            .expect("client builds");
        assert_eq!(transport.base_url(), "https://api.example.com/v1");
        assert_eq!(transport.url("/client/balance"), "https://api.example.com/v1/client/balance");
        assert_eq!(transport.url("admin/stats"), "https://api.example.com/v1/admin/stats");
        assert_eq!(transport.url("https://other.example.com/x"), "https://other.example.com/x");
    }

    #[test]
    fn test_response_json_handles_empty_body() {
        let response = ApiResponse {
            status: 204,
            body: String::new(),
        };
        assert!(response.is_success());
        let parsed: Option<serde_json::Value> = response.json().expect("empty body parses");
        assert!(parsed.is_none());
    }

    #[test]
    fn test_response_json_reports_invalid_body() {
        let response = ApiResponse {
            status: 200,
            body: "<html>".to_string(),
        };
        assert!(matches!(
            response.json::<serde_json::Value>(),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::post("/admin/users")
            .json(&serde_json::json!({"email": "a@b.c"}))
            .expect("serializable")
            .header("X-Request-Source", "dashboard");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body, Some(serde_json::json!({"email": "a@b.c"})));
        assert_eq!(request.headers.len(), 1);
    }
}
