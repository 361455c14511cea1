use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use relay_bridge::config::Config;
use relay_bridge::config_validation::ConfigValidator;
use relay_bridge::logging;
use relay_bridge::proxy::ProxyFactory;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    version,
    about = "Reverse proxy that forwards every request to a fixed target through an authenticated upstream HTTP proxy"
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/config.json",
        help = "Configuration file path (written with defaults if missing)"
    )]
    config: PathBuf,

    #[arg(long, value_name = "FILE", help = "Generate a sample configuration file and exit")]
    generate_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        Config::default()
            .to_file(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Sample configuration file generated: {}", path.display());
        return Ok(());
    }

    let config = Config::load_or_create(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    logging::init(&config.logging).context("failed to initialize logging")?;

    for warning in ConfigValidator::new(&config).validate().warnings {
        warn!(warning = warning.as_str(); "Configuration warning");
    }

    info!(
        listen_addr = config.listen_addr().as_str(),
        target = config.target_origin().as_str();
        "Starting proxy server"
    );

    let server = ProxyFactory::create_proxy(&config)?;
    server.run(shutdown_signal()).await?;

    info!("Proxy server stopped");
    log::Log::flush(log::logger());
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error:% = e; "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error:% = e; "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
