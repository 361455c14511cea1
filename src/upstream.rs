//! Connections routed through the upstream forward proxy.
//!
//! Plain `http` destinations get a raw connection to the proxy and the
//! request goes out in absolute form. `https` destinations get a CONNECT
//! tunnel through the proxy with TLS negotiated end to end inside it.

use crate::error::{ProxyError, UpstreamError};
use base64::{Engine as _, engine::general_purpose};
use futures::future::BoxFuture;
use http::{HeaderValue, Uri};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tower_service::Service;
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the CONNECT reply header section.
const CONNECT_RESPONSE_MAX_LENGTH: usize = 8192;

/// The forward proxy endpoint with its precomputed credentials.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    endpoint: Endpoint,
    authorization: HeaderValue,
}

#[derive(Debug, Clone)]
enum Endpoint {
    Http { host: String, port: u16 },
    /// Parses as a URL reference but cannot be dialled. Every connection
    /// attempt fails with the reason.
    Unusable { url: String, reason: String },
}

impl UpstreamProxy {
    /// Fails only when `url` cannot be parsed at all. A URL without a
    /// scheme or host, or with a scheme other than `http`, is accepted
    /// here and fails each connection instead.
    pub fn new(url: &str, username: &str, password: &str) -> Result<Self, ProxyError> {
        let endpoint = match Url::parse(url) {
            Ok(parsed) => match unusable_reason(&parsed) {
                Some(reason) => Endpoint::Unusable {
                    url: url.to_string(),
                    reason,
                },
                None => Endpoint::Http {
                    host: parsed.host_str().unwrap_or_default().to_string(),
                    port: parsed.port_or_known_default().unwrap_or(80),
                },
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Endpoint::Unusable {
                url: url.to_string(),
                reason: "missing scheme and host".to_string(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            endpoint,
            authorization: basic_authorization(username, password)?,
        })
    }

    /// `host:port` of the proxy.
    pub fn address(&self) -> Result<String, UpstreamError> {
        match &self.endpoint {
            Endpoint::Http { host, port } => Ok(format!("{}:{}", host, port)),
            Endpoint::Unusable { url, reason } => Err(UpstreamError::Unusable {
                url: url.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// `Proxy-Authorization` value for this proxy.
    pub fn authorization(&self) -> &HeaderValue {
        &self.authorization
    }
}

/// Why a parsed proxy URL cannot be dialled, if it cannot.
pub fn unusable_reason(url: &Url) -> Option<String> {
    if url.scheme() != "http" {
        Some(format!("unsupported proxy scheme '{}'", url.scheme()))
    } else if url.host_str().is_none_or(str::is_empty) {
        Some("missing host".to_string())
    } else {
        None
    }
}

pub fn basic_authorization(username: &str, password: &str) -> Result<HeaderValue, ProxyError> {
    let credentials = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    let mut value = HeaderValue::try_from(format!("Basic {}", credentials))
        .map_err(|e| ProxyError::Config(format!("invalid proxy credentials: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Chooses the upstream proxy for a destination.
pub type ProxySelector = Arc<dyn Fn(&Uri) -> Arc<UpstreamProxy> + Send + Sync>;

/// A selector that routes every destination through `proxy`.
pub fn fixed_proxy(proxy: UpstreamProxy) -> ProxySelector {
    let proxy = Arc::new(proxy);
    Arc::new(move |_destination: &Uri| Arc::clone(&proxy))
}

/// hyper-util connector that dials the selected upstream proxy for every
/// destination.
#[derive(Clone)]
pub struct UpstreamConnector {
    select: ProxySelector,
    http: HttpConnector,
    tls: tokio_native_tls::TlsConnector,
}

impl UpstreamConnector {
    pub fn new(select: ProxySelector) -> Result<Self, ProxyError> {
        Ok(Self::with_tls(select, native_tls::TlsConnector::new()?))
    }

    pub fn with_tls(select: ProxySelector, tls: native_tls::TlsConnector) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.set_nodelay(true);

        Self {
            select,
            http,
            tls: tokio_native_tls::TlsConnector::from(tls),
        }
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = UpstreamError;
    type Future = BoxFuture<'static, Result<UpstreamStream, UpstreamError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        let proxy = (self.select)(&destination);
        Box::pin(connect_via(
            proxy,
            self.http.clone(),
            self.tls.clone(),
            destination,
        ))
    }
}

async fn connect_via(
    proxy: Arc<UpstreamProxy>,
    mut http: HttpConnector,
    tls: tokio_native_tls::TlsConnector,
    destination: Uri,
) -> Result<UpstreamStream, UpstreamError> {
    let address = proxy.address()?;
    let proxy_uri: Uri = format!("http://{}", address)
        .parse()
        .map_err(|e: http::uri::InvalidUri| UpstreamError::Dial {
            proxy: address.clone(),
            source: Box::new(e),
        })?;
    let stream = http
        .call(proxy_uri)
        .await
        .map_err(|e| UpstreamError::Dial {
            proxy: address.clone(),
            source: Box::new(e),
        })?
        .into_inner();

    if destination.scheme_str() != Some("https") {
        return Ok(UpstreamStream::Forwarded(TokioIo::new(stream)));
    }

    let host = destination
        .host()
        .ok_or_else(|| UpstreamError::MissingHost(destination.to_string()))?;
    let port = destination.port_u16().unwrap_or(443);
    let stream = establish_tunnel(stream, host, port, proxy.authorization()).await?;

    let domain = host.trim_start_matches('[').trim_end_matches(']');
    let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.connect(domain, stream))
        .await
        .map_err(|_| UpstreamError::TlsHandshakeTimeout(domain.to_string()))?
        .map_err(|source| UpstreamError::Tls {
            host: domain.to_string(),
            source,
        })?;

    Ok(UpstreamStream::Tunneled(TokioIo::new(tls_stream)))
}

/// Asks the proxy to open a tunnel to `host:port`. Any non-2xx reply fails
/// with the proxy's status line.
pub async fn establish_tunnel<S>(
    mut stream: S,
    host: &str,
    port: u16,
    authorization: &HeaderValue,
) -> Result<S, UpstreamError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n").into_bytes();
    request.extend_from_slice(b"Proxy-Authorization: ");
    request.extend_from_slice(authorization.as_bytes());
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpstreamError::MalformedResponse);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf).map_err(|_| UpstreamError::MalformedResponse)? {
            httparse::Status::Partial if buf.len() < CONNECT_RESPONSE_MAX_LENGTH => continue,
            httparse::Status::Partial => return Err(UpstreamError::MalformedResponse),
            httparse::Status::Complete(header_len) => {
                let code = response.code.ok_or(UpstreamError::MalformedResponse)?;
                if !(200..300).contains(&code) {
                    return Err(UpstreamError::Rejected {
                        target,
                        status_line: format!("{} {}", code, response.reason.unwrap_or(""))
                            .trim_end()
                            .to_string(),
                    });
                }
                // The tunnel is silent until the client speaks first.
                if header_len != buf.len() {
                    return Err(UpstreamError::MalformedResponse);
                }
                return Ok(stream);
            }
        }
    }
}

/// A connection to the upstream proxy, either used directly for absolute
/// form requests or carrying TLS through a CONNECT tunnel.
pub enum UpstreamStream {
    Forwarded(TokioIo<TcpStream>),
    Tunneled(TokioIo<TlsStream<TcpStream>>),
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        match self {
            UpstreamStream::Forwarded(_) => Connected::new().proxy(true),
            UpstreamStream::Tunneled(_) => Connected::new(),
        }
    }
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Forwarded(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tunneled(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Forwarded(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tunneled(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Forwarded(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            UpstreamStream::Tunneled(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            UpstreamStream::Forwarded(s) => s.is_write_vectored(),
            UpstreamStream::Tunneled(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Forwarded(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tunneled(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Forwarded(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tunneled(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
