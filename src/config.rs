use crate::config_validation::ConfigValidator;
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_SERVER_PORT: &str = "PROXY_PORT";
pub const ENV_SERVER_HOST: &str = "PROXY_HOST";
pub const ENV_TARGET_HOST: &str = "TARGET_HOST";
pub const ENV_TARGET_SCHEME: &str = "TARGET_SCHEME";
pub const ENV_PROXY_URL: &str = "PROXY_URL";
pub const ENV_PROXY_USERNAME: &str = "PROXY_USERNAME";
pub const ENV_PROXY_PASSWORD: &str = "PROXY_PASSWORD";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Minimum severity that reaches the log. Unrecognised names fall back to
/// `info` wherever they are read (file or `LOG_LEVEL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Strict, case-insensitive lookup. `warning` is accepted for `warn`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s).unwrap_or_default())
    }
}

impl From<String> for LogLevel {
    fn from(name: String) -> Self {
        Self::from_name(&name).unwrap_or_default()
    }
}

/// Line format. Anything other than `json` renders as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl From<String> for LogFormat {
    fn from(name: String) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    /// Output sinks. Empty means a single stdout sink.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<LogTarget>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub host: String,
}

/// The service every inbound request is rewritten to address.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub host: String,
}

/// The authenticated forward proxy all outbound traffic goes through.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for UpstreamProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub proxy: UpstreamProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8080,
                host: "0.0.0.0".to_string(),
            },
            target: TargetConfig {
                scheme: "https".to_string(),
                host: "example.com".to_string(),
            },
            proxy: UpstreamProxyConfig {
                url: "http://proxy.example.com:8000".to_string(),
                username: "proxy-user".to_string(),
                password: "change-me".to_string(),
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                targets: Vec::new(),
            },
        }
    }
}

impl Config {
    /// Loads, applies environment overrides and validates.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        Self::from_file_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn from_file_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to open config file {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to decode config: {}", e)))?;

        config.apply_env_overrides_with(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Loads `path`, or writes the default configuration there first when
    /// the file does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        Self::load_or_create_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_or_create_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Config::default().to_file(path)?;
        }
        Self::from_file_with_env(path, lookup)
    }

    /// Applies the documented environment overrides. Unset or empty
    /// variables leave the file value in place.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> Result<(), ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(port) = env(ENV_SERVER_PORT) {
            // A non-numeric port is ignored; a numeric one must be in range.
            if let Ok(port) = port.trim().parse::<i64>() {
                self.server.port = u16::try_from(port)
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ProxyError::Config(format!("invalid server port: {}", port)))?;
            }
        }
        if let Some(host) = env(ENV_SERVER_HOST) {
            self.server.host = host;
        }
        if let Some(host) = env(ENV_TARGET_HOST) {
            self.target.host = host;
        }
        if let Some(scheme) = env(ENV_TARGET_SCHEME) {
            self.target.scheme = scheme;
        }
        if let Some(url) = env(ENV_PROXY_URL) {
            self.proxy.url = url;
        }
        if let Some(username) = env(ENV_PROXY_USERNAME) {
            self.proxy.username = username;
        }
        if let Some(password) = env(ENV_PROXY_PASSWORD) {
            self.proxy.password = password;
        }
        if let Some(level) = env(ENV_LOG_LEVEL) {
            self.logging.level = LogLevel::from(level);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        ConfigValidator::new(self).validate().into_result()
    }

    /// Address to bind, `host:port`. An empty host listens on all interfaces.
    pub fn listen_addr(&self) -> String {
        let host = if self.server.host.is_empty() {
            "0.0.0.0"
        } else {
            self.server.host.as_str()
        };
        format!("{}:{}", host, self.server.port)
    }

    /// `scheme://host` of the target service.
    pub fn target_origin(&self) -> String {
        format!("{}://{}", self.target.scheme, self.target.host)
    }
}
