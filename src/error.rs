use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Startup and configuration failures. Any of these aborts the process
/// before it starts serving.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Hyper error: {0}")]
    Hyper(String),
}

/// Failure of a single forwarded request. Recovered at the dispatcher and
/// turned into a 502 or 504.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("request deadline exceeded")]
    Timeout,

    #[error("invalid target URI: {0}")]
    InvalidTarget(String),

    #[error("failed to create request: {0}")]
    Request(#[from] http::Error),

    #[error("proxy request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("response body failed: {0}")]
    Body(#[source] BoxError),
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Timeout)
    }
}

/// Failures while opening a connection through the upstream forward proxy.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream proxy URL '{url}' cannot be used: {reason}")]
    Unusable { url: String, reason: String },

    #[error("failed to connect to upstream proxy {proxy}: {source}")]
    Dial {
        proxy: String,
        #[source]
        source: BoxError,
    },

    #[error("upstream proxy rejected CONNECT to {target}: {status_line}")]
    Rejected { target: String, status_line: String },

    #[error("malformed CONNECT response from upstream proxy")]
    MalformedResponse,

    #[error("destination has no host: {0}")]
    MissingHost(String),

    #[error("TLS handshake with {0} timed out")]
    TlsHandshakeTimeout(String),

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: native_tls::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders an error with its whole source chain, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}
