use crate::error::BoxError;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Current time as RFC 3339, second precision, UTC.
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builders for the responses the proxy generates itself.
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Response<ProxyBody> {
        Self::with_content_type(status, "application/json", value.to_string())
    }

    pub fn text(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Self::with_content_type(status, "text/plain; charset=utf-8", format!("{}\n", message))
    }

    /// `{"error": message, "timestamp": now}`
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Self::json(
            status,
            &json!({
                "error": message,
                "timestamp": rfc3339_now(),
            }),
        )
    }

    pub fn gateway_timeout() -> Response<ProxyBody> {
        Self::error(StatusCode::GATEWAY_TIMEOUT, "Request timeout")
    }

    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Proxy error")
    }

    pub fn method_not_allowed() -> Response<ProxyBody> {
        Self::text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    fn with_content_type(
        status: StatusCode,
        content_type: &'static str,
        body: String,
    ) -> Response<ProxyBody> {
        let mut response = Response::new(full(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }
}

/// Process-wide counters for forwarded traffic.
pub struct ProxyMetrics {
    started_at: Instant,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    response_bytes_total: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            response_bytes_total: AtomicU64::new(0),
        }
    }

    pub fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failures(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_bytes(&self, bytes: u64) {
        self.response_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime: self.started_at.elapsed(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            response_bytes_total: self.response_bytes_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime: Duration,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub response_bytes_total: u64,
}

impl MetricsSummary {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "metrics": {
                "uptime": format_uptime(self.uptime),
                "requests_total": self.requests_total,
                "requests_failed": self.requests_failed,
                "response_bytes_total": self.response_bytes_total,
            }
        })
    }
}

/// Renders whole seconds as `1h2m5s`, `2m5s` or `5s`.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Wall-clock timer for a single request.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    start_time: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}
