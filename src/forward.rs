use crate::common::{ProxyBody, empty};
use crate::config::{Config, TargetConfig};
use crate::error::{BoxError, ForwardError, ProxyError};
use crate::headers::outbound_request_headers;
use crate::upstream::{ProxySelector, UpstreamConnector, UpstreamProxy, fixed_proxy};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::PROXY_AUTHORIZATION;
use http::uri::Scheme;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// The legacy client only caps idle connections per host. There is no
/// total idle cap; with a single proxy endpoint this is the effective limit.
pub const MAX_IDLE_PER_HOST: usize = 10;
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounds the whole round trip regardless of the caller's deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends requests to the target service.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Rewrites `request` to address the target and sends it. The returned
    /// body fails with [`ForwardError::Timeout`] once `deadline` passes.
    async fn forward(
        &self,
        request: Request<ProxyBody>,
        remote_addr: SocketAddr,
        deadline: Instant,
    ) -> Result<Response<ProxyBody>, ForwardError>;

    /// `HEAD` to the target root. Any response counts as reachable.
    async fn probe(&self, deadline: Instant) -> Result<StatusCode, ForwardError>;
}

/// Forwarder that reaches the target through the upstream forward proxy.
pub struct ForwardingClient {
    client: Client<UpstreamConnector, ProxyBody>,
    select: ProxySelector,
    target_scheme: String,
    target_host: String,
}

impl ForwardingClient {
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        let proxy = UpstreamProxy::new(
            &config.proxy.url,
            &config.proxy.username,
            &config.proxy.password,
        )?;
        Self::with_selector(&config.target, fixed_proxy(proxy))
    }

    pub fn with_selector(target: &TargetConfig, select: ProxySelector) -> Result<Self, ProxyError> {
        let connector = UpstreamConnector::new(select.clone())?;
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Ok(Self {
            client,
            select,
            target_scheme: target.scheme.clone(),
            target_host: target.host.clone(),
        })
    }

    /// `scheme://host` + the inbound path, plus `?query` when non-empty.
    /// Path and query pass through unmodified.
    pub fn target_uri(&self, inbound: &Uri) -> Result<Uri, ForwardError> {
        let mut target = format!("{}://{}{}", self.target_scheme, self.target_host, inbound.path());
        if let Some(query) = inbound.query().filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }
        target
            .parse()
            .map_err(|e| ForwardError::InvalidTarget(format!("{}: {}", target, e)))
    }

    /// Plain http requests travel in absolute form over the proxy
    /// connection itself and carry the credentials per request. https
    /// requests authenticate on the CONNECT instead.
    fn authorize(&self, uri: &Uri, headers: &mut HeaderMap) {
        if uri.scheme() == Some(&Scheme::HTTP) {
            let proxy = (self.select)(uri);
            headers.insert(PROXY_AUTHORIZATION, proxy.authorization().clone());
        }
    }

    async fn send(
        &self,
        request: Request<ProxyBody>,
        deadline: Instant,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let now = Instant::now();
        let deadline = deadline.min(now + REQUEST_TIMEOUT);
        let header_deadline = deadline.min(now + RESPONSE_HEADER_TIMEOUT);

        let response = tokio::time::timeout_at(header_deadline, self.client.request(request))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        Ok(response.map(|body| {
            DeadlineBody::new(body.map_err(BoxError::from).boxed_unsync(), deadline).boxed_unsync()
        }))
    }
}

#[async_trait]
impl Forwarder for ForwardingClient {
    async fn forward(
        &self,
        request: Request<ProxyBody>,
        remote_addr: SocketAddr,
        deadline: Instant,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let (parts, body) = request.into_parts();
        let uri = self.target_uri(&parts.uri)?;
        let mut headers = outbound_request_headers(&parts, remote_addr);
        self.authorize(&uri, &mut headers);

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)?;
        *outbound.headers_mut() = headers;

        self.send(outbound, deadline).await
    }

    async fn probe(&self, deadline: Instant) -> Result<StatusCode, ForwardError> {
        let uri = self.target_uri(&Uri::from_static("/"))?;
        let mut request = Request::builder()
            .method(Method::HEAD)
            .uri(uri.clone())
            .body(empty())?;
        self.authorize(&uri, request.headers_mut());

        let response = self.send(request, deadline).await?;
        Ok(response.status())
    }
}

/// A body that fails with [`ForwardError::Timeout`] once its deadline passes.
pub struct DeadlineBody<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes, Error = BoxError> + Unpin,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        if this.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(Box::new(ForwardError::Timeout))));
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::full;
    use http_body_util::StreamBody;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn client(scheme: &str, host: &str, proxy_url: &str) -> ForwardingClient {
        let target = TargetConfig {
            scheme: scheme.to_string(),
            host: host.to_string(),
        };
        let proxy = UpstreamProxy::new(proxy_url, "user", "pass").unwrap();
        ForwardingClient::with_selector(&target, fixed_proxy(proxy)).unwrap()
    }

    #[tokio::test]
    async fn test_target_uri_building() {
        let forwarder = client("https", "example.com", "http://127.0.0.1:3128");

        let uri = forwarder.target_uri(&Uri::from_static("/orders?id=5")).unwrap();
        assert_eq!(uri, "https://example.com/orders?id=5");

        let uri = forwarder.target_uri(&Uri::from_static("/api/users")).unwrap();
        assert_eq!(uri, "https://example.com/api/users");

        let uri = forwarder.target_uri(&Uri::from_static("/search?")).unwrap();
        assert_eq!(uri, "https://example.com/search");

        let uri = forwarder.target_uri(&Uri::from_static("/")).unwrap();
        assert_eq!(uri, "https://example.com/");
    }

    #[tokio::test]
    async fn test_target_uri_ignores_inbound_authority() {
        let forwarder = client("http", "orders.internal:8081", "http://127.0.0.1:3128");
        let uri = forwarder
            .target_uri(&Uri::from_static("http://evil.example.net/a/b?x=%20y"))
            .unwrap();
        assert_eq!(uri, "http://orders.internal:8081/a/b?x=%20y");
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let forwarder = client("http", "target.invalid", &format!("http://{}", addr));
        let request = Request::builder().uri("/slow").body(empty()).unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let started = std::time::Instant::now();
        let result = forwarder
            .forward(request, remote, Instant::now() + Duration::from_millis(200))
            .await;

        assert!(matches!(result, Err(ForwardError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_not_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = client("http", "target.invalid", &format!("http://{}", addr));
        let request = Request::builder().uri("/").body(full("payload")).unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let err = forwarder
            .forward(request, remote, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_probe_fails_without_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = client("https", "example.com", &format!("http://{}", addr));
        let result = forwarder.probe(Instant::now() + Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deadline_body_expires() {
        let stalled = futures::stream::pending::<Result<Frame<Bytes>, BoxError>>();
        let body = DeadlineBody::new(
            StreamBody::new(stalled).boxed_unsync(),
            Instant::now() + Duration::from_millis(50),
        );

        let err = body.collect().await.unwrap_err();
        let err = err.downcast::<ForwardError>().unwrap();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_deadline_body_passes_data_through() {
        let body = DeadlineBody::new(full("hello world"), Instant::now() + Duration::from_secs(5));
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "hello world");
    }

    #[test]
    fn test_selector_is_consulted_per_destination() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let proxy = Arc::new(UpstreamProxy::new("http://127.0.0.1:3128", "u", "p").unwrap());
        let counter = Arc::clone(&calls);
        let select: ProxySelector = Arc::new(move |_: &Uri| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Arc::clone(&proxy)
        });

        let target = TargetConfig {
            scheme: "http".to_string(),
            host: "example.com".to_string(),
        };
        let forwarder = ForwardingClient::with_selector(&target, select).unwrap();

        let mut headers = HeaderMap::new();
        forwarder.authorize(&Uri::from_static("http://example.com/"), &mut headers);
        forwarder.authorize(&Uri::from_static("https://example.com/"), &mut headers);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(headers[PROXY_AUTHORIZATION], "Basic dTpw");
    }
}
