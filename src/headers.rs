use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use std::net::SocketAddr;

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that only describe a single connection and are never relayed
/// in either direction. `HeaderName` is lowercase, so comparison against
/// it is case-insensitive with respect to the wire name.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(name)
}

/// Builds the header set for the outbound request.
///
/// Every inbound header except the hop-by-hop set and `Host` is copied with
/// its values in order. `Host` is derived from the target URL by the client.
/// The `X-Forwarded-*` trio is then set, overwriting anything the caller sent.
pub fn outbound_request_headers(parts: &Parts, remote_addr: SocketAddr) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 3);

    for (name, value) in parts.headers.iter() {
        if name != header::HOST && !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Ok(value) = HeaderValue::try_from(remote_addr.to_string()) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
    if let Some(host) = inbound_host(parts) {
        headers.insert(X_FORWARDED_HOST.clone(), host);
    }

    headers
}

/// Removes the hop-by-hop set from a response before it is relayed.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn inbound_host(parts: &Parts) -> Option<HeaderValue> {
    match parts.headers.get(header::HOST) {
        Some(host) if !host.is_empty() => Some(host.clone()),
        _ => parts
            .uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok()),
    }
}
