//! Airlock relay - internet-facing tunnel server CLI

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use airlock_config::Config;
use airlock_relay::listener::PortListener;
use airlock_relay::{server, RelayState, DRAIN_WINDOW};
use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Airlock relay - exposes selected in-network TCP services through
/// agent-initiated tunnels, without any inbound connection to the
/// protected network.
#[derive(Parser, Debug)]
#[command(name = "airlock-relay")]
#[command(about = "Airlock tunnel relay server")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "TUNNEL_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<String>,

    /// Authentication token, overrides the config file
    #[arg(long, env = "TUNNEL_TOKEN")]
    token: Option<String>,

    /// TLS certificate file, overrides the config file
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS key file, overrides the config file
    #[arg(long)]
    key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        let contents = std::fs::read_to_string(&args.config)
            .with_context(|| format!("Failed to read config file: {}", args.config.display()))?;
        let config = Config::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", args.config.display()))?;
        info!(path = %args.config.display(), "Loaded configuration");
        config
    } else {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
        Config::default()
    };

    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(token) = &args.token {
        config.server.token = token.clone();
    }
    if let Some(cert) = &args.cert {
        config.server.tls.cert = cert.display().to_string();
    }
    if let Some(key) = &args.key {
        config.server.tls.key = key.display().to_string();
    }

    config
        .resolve()
        .context("Configuration validation failed")
}

/// Accepts both ":8443" and "host:8443" forms.
fn parse_listen_addr(listen: &str) -> Result<SocketAddr> {
    let normalized = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };

    normalized
        .parse()
        .with_context(|| format!("Invalid listen address: {listen}"))
}

fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = load_config(&args)?;
    let addr = parse_listen_addr(&config.server.listen)?;

    let state = Arc::new(RelayState::new(config.server.token.clone()));

    // Start one TCP port listener per enabled forwarder. The listener
    // routes to an agent id; targets stay on the agent side.
    for forwarder in config.enabled_forwarders() {
        let listener = Arc::new(PortListener::new(
            &forwarder.name,
            forwarder.port,
            &forwarder.client_id,
        ));

        match listener.bind().await {
            Ok(bound) => {
                tokio::spawn(listener.run(state.clone(), bound));
            }
            Err(err) if forwarder.warn_on_fail => {
                warn!(
                    forwarder = %forwarder.name,
                    port = forwarder.port,
                    error = %err,
                    "Forwarder not started (may be expected)"
                );
                state
                    .monitor
                    .record_error("warn", format!("bind {} failed: {err}", forwarder.port));
            }
            Err(err) => {
                anyhow::bail!(
                    "failed to start forwarder '{}' on port {}: {err}",
                    forwarder.name,
                    forwarder.port
                );
            }
        }
    }

    let app = server::router(state.clone());
    let handle = axum_server::Handle::new();

    // Graceful shutdown: stop accepting, cancel agents and sessions,
    // give in-flight work a drain window.
    {
        let state = state.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down relay...");
                state.shutdown.cancel();
                handle.graceful_shutdown(Some(DRAIN_WINDOW));
            }
        });
    }

    info!(
        addr = %addr,
        tls = config.server.tls.enabled(),
        forwarders = config.enabled_forwarders().count(),
        "Starting tunnel relay"
    );

    if config.server.tls.enabled() {
        ensure_crypto_provider();
        let tls = RustlsConfig::from_pem_file(&config.server.tls.cert, &config.server.tls.key)
            .await
            .context("Failed to load TLS certificate")?;

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("Relay server failed")?;
    } else {
        warn!("Running without TLS - not recommended for production");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("Relay server failed")?;
    }

    state.sessions.shutdown().await;
    info!("Relay stopped");

    Ok(())
}
