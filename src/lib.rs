pub mod common;
pub mod config;
pub mod config_validation;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod headers;
pub mod logging;
pub mod proxy;
pub mod upstream;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{ForwardError, ProxyError};
pub use forward::{ForwardingClient, Forwarder};
pub use proxy::{ProxyFactory, ProxyServer};
