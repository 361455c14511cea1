use crate::common::{ProxyBody, ProxyMetrics, RequestTimer, ResponseBuilder, rfc3339_now};
use crate::error::{BoxError, ForwardError, error_chain};
use crate::forward::Forwarder;
use crate::headers::strip_hop_by_hop;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use log::{debug, error, info};
use serde_json::json;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::time::Instant;

pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

/// Result of one forwarding attempt, classified for the response.
pub enum ForwardOutcome {
    Success(Response<ProxyBody>),
    TimedOut(ForwardError),
    Failed(ForwardError),
}

impl From<Result<Response<ProxyBody>, ForwardError>> for ForwardOutcome {
    fn from(result: Result<Response<ProxyBody>, ForwardError>) -> Self {
        match result {
            Ok(response) => ForwardOutcome::Success(response),
            Err(err) if err.is_timeout() => ForwardOutcome::TimedOut(err),
            Err(err) => ForwardOutcome::Failed(err),
        }
    }
}

enum Route {
    Health,
    Metrics,
    Forward,
}

impl Route {
    fn of(path: &str) -> Self {
        match path {
            HEALTH_PATH => Route::Health,
            METRICS_PATH => Route::Metrics,
            _ => Route::Forward,
        }
    }
}

/// Entry point for every inbound request.
pub struct Dispatcher {
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<ProxyMetrics>,
}

impl Dispatcher {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            metrics: Arc::new(ProxyMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub async fn handle<B>(&self, request: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let route = Route::of(request.uri().path());
        let method = request.method().clone();
        match route {
            Route::Health => self.health(&method).await,
            Route::Metrics => self.metrics_report(&method),
            Route::Forward => {
                let request = request.map(|body| body.map_err(Into::into).boxed_unsync());
                self.proxy(request, remote_addr).await
            }
        }
    }

    async fn proxy(&self, request: Request<ProxyBody>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let timer = RequestTimer::new();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        info!(
            method:% = method,
            path = path.as_str(),
            query = request.uri().query().unwrap_or(""),
            user_agent = header_str(request.headers(), USER_AGENT),
            remote_addr:% = remote_addr;
            "Request received"
        );
        self.metrics.increment_requests();

        let deadline = Instant::now() + DISPATCH_TIMEOUT;
        let outcome = ForwardOutcome::from(self.forwarder.forward(request, remote_addr, deadline).await);

        match outcome {
            ForwardOutcome::Success(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);

                let completion = Completion {
                    content_type: header_str(&parts.headers, CONTENT_TYPE).to_string(),
                    status: parts.status,
                    method,
                    path,
                    timer,
                    metrics: Arc::clone(&self.metrics),
                };
                Response::from_parts(parts, RelayBody::new(body, completion).boxed_unsync())
            }
            ForwardOutcome::TimedOut(err) => {
                self.metrics.increment_failures();
                error!(
                    error = error_chain(&err).as_str(),
                    path = path.as_str(),
                    method:% = method,
                    elapsed:? = timer.elapsed(),
                    status_code = StatusCode::GATEWAY_TIMEOUT.as_u16(),
                    timeout = true;
                    "Failed to forward request"
                );
                ResponseBuilder::gateway_timeout()
            }
            ForwardOutcome::Failed(err) => {
                self.metrics.increment_failures();
                error!(
                    error = error_chain(&err).as_str(),
                    path = path.as_str(),
                    method:% = method,
                    elapsed:? = timer.elapsed(),
                    status_code = StatusCode::BAD_GATEWAY.as_u16(),
                    timeout = false;
                    "Failed to forward request"
                );
                ResponseBuilder::bad_gateway()
            }
        }
    }

    async fn health(&self, method: &Method) -> Response<ProxyBody> {
        if *method != Method::GET {
            return ResponseBuilder::method_not_allowed();
        }

        match self.forwarder.probe(Instant::now() + HEALTH_PROBE_TIMEOUT).await {
            Ok(status) => {
                debug!(status_code = status.as_u16(); "Health probe answered");
                ResponseBuilder::json(
                    StatusCode::OK,
                    &json!({
                        "status": "healthy",
                        "timestamp": rfc3339_now(),
                    }),
                )
            }
            Err(err) => {
                error!(error = error_chain(&err).as_str(); "Health check failed");
                ResponseBuilder::text(StatusCode::SERVICE_UNAVAILABLE, "Health check failed")
            }
        }
    }

    fn metrics_report(&self, method: &Method) -> Response<ProxyBody> {
        if *method != Method::GET {
            return ResponseBuilder::method_not_allowed();
        }
        ResponseBuilder::json(StatusCode::OK, &self.metrics.summary().to_json())
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Everything needed to log the end of a relayed response.
struct Completion {
    method: Method,
    path: String,
    status: StatusCode,
    content_type: String,
    timer: RequestTimer,
    metrics: Arc<ProxyMetrics>,
}

impl Completion {
    fn completed(self, bytes_written: u64) {
        self.metrics.record_response_bytes(bytes_written);
        info!(
            method:% = self.method,
            path = self.path.as_str(),
            status_code = self.status.as_u16(),
            bytes_written = bytes_written,
            elapsed:? = self.timer.elapsed(),
            content_type = self.content_type.as_str();
            "Request completed"
        );
    }

    fn failed(self, bytes_written: u64, error: &str) {
        self.metrics.record_response_bytes(bytes_written);
        error!(
            error = error,
            method:% = self.method,
            path = self.path.as_str(),
            status_code = self.status.as_u16(),
            bytes_written = bytes_written,
            elapsed:? = self.timer.elapsed();
            "Failed to copy response body"
        );
    }
}

/// Streams the forwarded body unchanged, counting bytes, and logs once
/// when the stream ends, fails, or is dropped early.
struct RelayBody {
    inner: ProxyBody,
    bytes_written: u64,
    completion: Option<Completion>,
}

impl RelayBody {
    fn new(inner: ProxyBody, completion: Completion) -> Self {
        Self {
            inner,
            bytes_written: 0,
            completion: Some(completion),
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes_written += data.len() as u64;
                }
            }
            Some(Err(err)) => {
                if let Some(completion) = this.completion.take() {
                    completion.failed(this.bytes_written, &error_chain(&**err));
                }
            }
            None => {
                if let Some(completion) = this.completion.take() {
                    completion.completed(this.bytes_written);
                }
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            // hyper stops polling once the body reports its end.
            if self.inner.is_end_stream() {
                completion.completed(self.bytes_written);
            } else {
                completion.failed(self.bytes_written, "client went away before the body finished");
            }
        }
    }
}
