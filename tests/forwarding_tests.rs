//! End-to-end tests: a real relay server in front of an in-process mock
//! upstream proxy that echoes what it received.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use relay_bridge::config::Config;
use relay_bridge::proxy::ProxyFactory;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PROXY_USER: &str = "relay-user";
const PROXY_PASS: &str = "relay-pass";

/// Echoes the request it received as forward proxy, decorated with
/// hop-by-hop response headers the relay must drop.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();

    let mut headers = serde_json::Map::new();
    for name in req.headers().keys() {
        let values: Vec<String> = req
            .headers()
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap_or_default().to_string())
            .collect();
        headers.insert(name.as_str().to_string(), json!(values));
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let payload = json!({
        "method": method,
        "uri": uri,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    let mut response = Response::new(Full::new(Bytes::from(payload.to_string())));
    if uri.ends_with("/status/404") {
        *response.status_mut() = StatusCode::NOT_FOUND;
    }
    let headers = response.headers_mut();
    headers.insert("content-type", "application/json".parse().unwrap());
    headers.insert("keep-alive", "timeout=5".parse().unwrap());
    headers.insert("proxy-authenticate", "Basic realm=\"relay\"".parse().unwrap());
    headers.insert("proxy-connection", "keep-alive".parse().unwrap());
    headers.insert("x-upstream", "mock".parse().unwrap());
    Ok(response)
}

async fn start_mock_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = ServerBuilder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// A proxy that answers every CONNECT with 407.
async fn start_rejecting_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut received = Vec::new();
                while !received.ends_with(b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });
    addr
}

async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_relay(target_scheme: &str, proxy_addr: SocketAddr) -> SocketAddr {
    start_relay_with_proxy_url(target_scheme, &format!("http://{}", proxy_addr)).await
}

async fn start_relay_with_proxy_url(target_scheme: &str, proxy_url: &str) -> SocketAddr {
    let mut config = Config::default();
    config.target.scheme = target_scheme.to_string();
    config.target.host = "target.invalid".to_string();
    config.proxy.url = proxy_url.to_string();
    config.proxy.username = PROXY_USER.to_string();
    config.proxy.password = PROXY_PASS.to_string();

    let server = ProxyFactory::create_proxy(&config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener, std::future::pending()));
    addr
}

async fn send(addr: SocketAddr, request: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}

fn get(path: &str) -> Request<Full<Bytes>> {
    request(Method::GET, path)
}

fn request(method: Method, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "relay.local")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn values<'a>(echoed: &'a Value, name: &str) -> Vec<&'a str> {
    echoed["headers"][name]
        .as_array()
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_request_is_routed_through_upstream_proxy() {
    let proxy = start_mock_proxy().await;
    let relay = start_relay("http", proxy).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/orders?id=5")
        .header("host", "relay.local")
        .header("content-type", "text/plain")
        .header("keep-alive", "timeout=30")
        .header("proxy-connection", "keep-alive")
        .header("PROXY-AUTHORIZATION", "Basic c3Bvb2Y6c3Bvb2Y=")
        .header("te", "trailers")
        .header("trailer", "Expires")
        .header("x-trace", "first")
        .header("x-trace", "second")
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();

    let (status, headers, body) = send(relay, request).await;
    assert_eq!(status, StatusCode::OK);

    let echoed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["uri"], "http://target.invalid/orders?id=5");
    assert_eq!(echoed["body"], "payload");

    let expected_auth = format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", PROXY_USER, PROXY_PASS))
    );
    assert_eq!(values(&echoed, "proxy-authorization"), [expected_auth.as_str()]);

    for hop in ["keep-alive", "proxy-connection", "te", "trailer", "upgrade"] {
        assert!(values(&echoed, hop).is_empty(), "{} reached the upstream", hop);
    }
    assert_eq!(values(&echoed, "x-trace"), ["first", "second"]);
    assert_eq!(values(&echoed, "host"), ["target.invalid"]);
    assert_eq!(values(&echoed, "x-forwarded-proto"), ["http"]);
    assert_eq!(values(&echoed, "x-forwarded-host"), ["relay.local"]);
    let forwarded_for = values(&echoed, "x-forwarded-for");
    assert_eq!(forwarded_for.len(), 1);
    assert!(forwarded_for[0].starts_with("127.0.0.1:"));

    assert_eq!(headers["x-upstream"], "mock");
    assert!(!headers.contains_key("keep-alive"));
    assert!(!headers.contains_key("proxy-authenticate"));
    assert!(!headers.contains_key("proxy-connection"));
}

#[tokio::test]
async fn test_upstream_status_is_relayed() {
    let proxy = start_mock_proxy().await;
    let relay = start_relay("http", proxy).await;

    let (status, headers, _) = send(relay, get("/status/404")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["content-type"], "application/json");
}

#[tokio::test]
async fn test_unreachable_proxy_returns_502() {
    let relay = start_relay("http", unused_addr().await).await;

    let (status, headers, body) = send(relay, get("/orders")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(headers["content-type"], "application/json");

    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "Proxy error");
    assert!(error["timestamp"].is_string());
}

#[tokio::test]
async fn test_rejected_tunnel_returns_502() {
    let relay = start_relay("https", start_rejecting_proxy().await).await;

    let (status, _, body) = send(relay, get("/secure")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "Proxy error");
}

#[tokio::test]
async fn test_health_endpoint() {
    let healthy = start_relay("http", start_mock_proxy().await).await;
    let (status, _, body) = send(healthy, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");

    let (status, _, _) = send(healthy, request(Method::POST, "/health")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let unhealthy = start_relay("http", unused_addr().await).await;
    let (status, _, body) = send(unhealthy, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(String::from_utf8_lossy(&body).contains("Health check failed"));
}

#[tokio::test]
async fn test_proxy_url_without_scheme_fails_per_request() {
    let relay = start_relay_with_proxy_url("http", "invalid-url-for-test").await;

    let (status, _, body) = send(relay, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(String::from_utf8_lossy(&body).contains("Health check failed"));

    let (status, _, body) = send(relay, get("/orders")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "Proxy error");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let relay = start_relay("http", start_mock_proxy().await).await;

    send(relay, get("/one")).await;
    send(relay, get("/two")).await;

    let (status, headers, body) = send(relay, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    let metrics: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["metrics"]["requests_total"], 2);
    assert!(metrics["metrics"]["uptime"].is_string());

    let (status, _, _) = send(relay, request(Method::PUT, "/metrics")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}
