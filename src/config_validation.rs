//! Rule-based validation of a loaded [`Config`].
//!
//! Errors make the configuration unusable and abort startup. Warnings are
//! logged once the logger is up and never stop the proxy.

use crate::config::Config;
use crate::error::ProxyError;
use crate::upstream::unusable_reason;
use url::Url;

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn into_result(self) -> Result<(), ProxyError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ProxyError::Config(format!(
                "invalid configuration: {}",
                self.errors.join("; ")
            )))
        }
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_server(&mut result);
        self.validate_target(&mut result);
        self.validate_upstream_proxy(&mut result);

        result
    }

    fn validate_server(&self, result: &mut ValidationResult) {
        let server = &self.config.server;

        if server.port == 0 {
            result.add_error(format!("invalid server port: {}", server.port));
        } else if server.port < 1024 {
            result.add_warning(format!(
                "Using privileged port {} - may require elevated privileges",
                server.port
            ));
        }

        if server.host.is_empty() {
            result.add_warning("server host is empty, listening on all interfaces".to_string());
        }
    }

    fn validate_target(&self, result: &mut ValidationResult) {
        let target = &self.config.target;

        if target.host.is_empty() {
            result.add_error("target host is required".to_string());
        } else if target.host.contains("://") || target.host.contains('/') {
            result.add_warning(format!(
                "target host '{}' looks like a URL; expected a bare host[:port]",
                target.host
            ));
        }

        if target.scheme != "http" && target.scheme != "https" {
            result.add_error(format!("invalid target scheme: {}", target.scheme));
        }
    }

    fn validate_upstream_proxy(&self, result: &mut ValidationResult) {
        let proxy = &self.config.proxy;

        if proxy.url.is_empty() {
            result.add_error("proxy URL is required".to_string());
        } else {
            // Only a URL that cannot be parsed at all is fatal. One that parses
            // but cannot be dialled fails every request until it is fixed.
            match Url::parse(&proxy.url) {
                Ok(url) => {
                    if let Some(reason) = unusable_reason(&url) {
                        result.add_warning(format!(
                            "proxy URL '{}' cannot be used ({}); requests will fail",
                            proxy.url, reason
                        ));
                    }
                }
                Err(url::ParseError::RelativeUrlWithoutBase) => result.add_warning(format!(
                    "proxy URL '{}' has no scheme or host; requests will fail",
                    proxy.url
                )),
                Err(e) => result.add_error(format!("invalid proxy URL '{}': {}", proxy.url, e)),
            }
        }

        if proxy.username.is_empty() {
            result.add_error("proxy username is required".to_string());
        }

        if proxy.password.is_empty() {
            result.add_error("proxy password is required".to_string());
        }
    }
}
