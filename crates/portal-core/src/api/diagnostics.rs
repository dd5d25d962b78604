use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::ApiError;

/// A surfaced request failure, as handed to the observability collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
    pub kind: ReportKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// 404 from an endpoint the dashboard expects to exist
    UnexpectedNotFound,
    Error,
}

impl ErrorReport {
    pub fn new(method: &str, path: &str, error: &ApiError) -> Self {
        let kind = match error {
            ApiError::NotFound(_) => ReportKind::UnexpectedNotFound,
            _ => ReportKind::Error,
        };
        Self {
            method: method.to_string(),
            path: path.to_string(),
            status: error.status(),
            kind,
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget destination for error reports. Implementations must not
/// block or fail the caller.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, report: ErrorReport);
}

/// Emits each report as a structured tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, report: ErrorReport) {
        warn!(
            method = %report.method,
            path = %report.path,
            status = ?report.status,
            kind = ?report.kind,
            at = %report.at,
            "{}",
            report.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_flagged() {
        let report = ErrorReport::new("GET", "/client/orders/9", &ApiError::from_status(404, ""));
        assert_eq!(report.kind, ReportKind::UnexpectedNotFound);
        assert_eq!(report.status, Some(404));
    }

    #[test]
    fn test_network_error_has_no_status() {
        let report = ErrorReport::new("POST", "/admin/stats", &ApiError::Timeout);
        assert_eq!(report.kind, ReportKind::Error);
        assert_eq!(report.status, None);
        assert_eq!(report.message, "Request timed out");
    }
}
