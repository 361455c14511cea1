use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ProxyError;
use crate::forward::ForwardingClient;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How long in-flight connections may run after a shutdown signal.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxyFactory;

impl ProxyFactory {
    /// Wires the forwarding client and dispatcher for `config`. An upstream
    /// proxy URL that cannot be parsed fails here, before serving.
    pub fn create_proxy(config: &Config) -> Result<ProxyServer, ProxyError> {
        debug!(
            target_origin = config.target_origin().as_str(),
            listen_addr = config.listen_addr().as_str();
            "Creating proxy instance"
        );

        let forwarder = ForwardingClient::new(config)?;
        let dispatcher = Dispatcher::new(Arc::new(forwarder));
        Ok(ProxyServer::new(config.listen_addr(), dispatcher))
    }
}

pub struct ProxyServer {
    listen_addr: String,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    pub fn new(listen_addr: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.listen_addr.as_str())
            .await
            .inspect_err(|e| error!(listen_addr = self.listen_addr.as_str(), error:% = e; "Failed to bind listener"))?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from `listener` until `shutdown` resolves, then
    /// drains in-flight connections for up to [`SHUTDOWN_GRACE_PERIOD`].
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!(listen_addr:% = local_addr; "Proxy server listening");

        let graceful = GracefulShutdown::new();
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!(error:% = e; "Failed to accept connection");
                            continue;
                        }
                    };

                    let dispatcher = Arc::clone(&self.dispatcher);
                    let service = service_fn(move |req| {
                        let dispatcher = Arc::clone(&dispatcher);
                        async move { Ok::<_, Infallible>(dispatcher.handle(req, remote_addr).await) }
                    });

                    let connection = ServerBuilder::new()
                        .keep_alive(true)
                        .timer(TokioTimer::new())
                        .header_read_timeout(HEADER_READ_TIMEOUT)
                        .serve_connection(TokioIo::new(stream), service);
                    let connection = graceful.watch(connection);

                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            debug!(remote_addr:% = remote_addr, error:% = err; "Error serving connection");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD) => {
                warn!(grace_period:? = SHUTDOWN_GRACE_PERIOD; "Grace period elapsed, abandoning open connections");
            }
        }

        Ok(())
    }
}
