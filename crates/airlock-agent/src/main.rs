//! Airlock agent - in-network tunnel agent CLI

use std::path::PathBuf;
use std::sync::Arc;

use airlock_agent::{Agent, AgentConfig, LocalForward};
use airlock_config::{Config, ForwarderConfig, ServerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Airlock agent - connects outbound to the relay and forwards tunneled
/// sessions to targets inside the protected network.
#[derive(Parser, Debug)]
#[command(name = "airlock-agent")]
#[command(about = "Airlock tunnel agent")]
#[command(version)]
#[command(long_about = r#"
The agent initiates the control channel outbound to the relay and keeps
it alive with exponential backoff. Forwarder definitions map relay listen
ports to targets in the local network; targets are chosen here, never on
the relay.

EXAMPLES:
  # Single forwarder from the command line
  airlock-agent --server wss://relay.example.com:8443/tunnel \
    --id a-web --forward 8080:webapp:80

  # Full configuration from a file
  airlock-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  TUNNEL_SERVER     Relay URL
  TUNNEL_TOKEN      Authentication token
  TUNNEL_CLIENT_ID  Agent identifier
"#)]
struct Args {
    /// Relay URL (e.g. wss://relay.example.com:8443/tunnel)
    #[arg(long, env = "TUNNEL_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "TUNNEL_TOKEN")]
    token: Option<String>,

    /// Agent identifier (auto-generated if not specified)
    #[arg(long, env = "TUNNEL_CLIENT_ID")]
    id: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Forwarder in `port:host:port` form, may repeat
    #[arg(long)]
    forward: Vec<String>,

    /// Extra root certificate to trust (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    forwarders: Vec<ForwarderConfig>,
    local_forwards: Vec<LocalForwardSection>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ServerSection {
    url: String,
    token: String,
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalForwardSection {
    port: u16,
    target: String,
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

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse a `port:host:port` forward specification.
fn parse_forward_spec(spec: &str) -> Result<ForwarderConfig> {
    let parts: Vec<&str> = spec.splitn(2, ':').collect();
    let (port, target) = match parts.as_slice() {
        [port, target] if target.contains(':') => (port, target),
        _ => anyhow::bail!("invalid forward '{spec}', expected port:host:port"),
    };

    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in forward '{spec}'"))?;

    Ok(ForwarderConfig {
        name: format!("forward-{port}"),
        port,
        target: target.to_string(),
        enabled: true,
        ..Default::default()
    })
}

fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let server_url = args
        .server
        .or_else(|| (!file.server.url.is_empty()).then(|| file.server.url.clone()))
        .unwrap_or_else(|| "wss://localhost:8443/tunnel".to_string());

    let token = args
        .token
        .or_else(|| (!file.server.token.is_empty()).then(|| file.server.token.clone()))
        .unwrap_or_default();

    let agent_id = args
        .id
        .or_else(|| (!file.server.id.is_empty()).then(|| file.server.id.clone()))
        .unwrap_or_else(|| {
            let id = format!("agent-{}", uuid::Uuid::new_v4());
            info!(agent_id = %id, "Auto-generated agent ID");
            id
        });

    let mut forwarders = file.forwarders;
    for spec in &args.forward {
        forwarders.push(parse_forward_spec(spec)?);
    }

    // Reuse the shared model for expansion, overrides and validation;
    // listen/tls stay at their defaults on the agent side.
    let shared = Config {
        server: ServerConfig {
            token,
            ..Default::default()
        },
        forwarders,
    };
    let shared = shared
        .resolve()
        .context("Configuration validation failed")?;

    Ok(AgentConfig {
        server_url,
        auth_token: shared.server.token,
        agent_id,
        insecure: args.insecure,
        ca_cert: args.ca,
        forwarders: shared.forwarders,
        local_forwards: file
            .local_forwards
            .into_iter()
            .map(|f| LocalForward {
                port: f.port,
                target: f.target,
            })
            .collect(),
        reconnect: Default::default(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!("Airlock agent starting...");

    let config = build_agent_config(args)?;

    info!(
        agent_id = %config.agent_id,
        server = %config.server_url,
        forwarders = config.forwarders.iter().filter(|f| f.enabled).count(),
        "Agent configured"
    );

    let agent = Arc::new(Agent::new(config)?);

    {
        let agent = agent.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down agent...");
                agent.stop();
            }
        });
    }

    agent.run().await?;

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_spec() {
        let forwarder = parse_forward_spec("8080:webapp:80").unwrap();
        assert_eq!(forwarder.port, 8080);
        assert_eq!(forwarder.target, "webapp:80");
        assert!(forwarder.enabled);

        assert!(parse_forward_spec("8080").is_err());
        assert!(parse_forward_spec("8080:webapp").is_err());
        assert!(parse_forward_spec("nope:webapp:80").is_err());
    }

    #[test]
    fn test_config_file_parsing() {
        let yaml = r#"
server:
  url: wss://relay.example.com:8443/tunnel
  token: "t"
  id: a-web
forwarders:
  - name: web
    port: 8080
    target: webapp:80
local_forwards:
  - port: 9000
    target: example.com:443
"#;

        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.server.url, "wss://relay.example.com:8443/tunnel");
        assert_eq!(file.server.id, "a-web");
        assert_eq!(file.forwarders.len(), 1);
        assert_eq!(file.local_forwards.len(), 1);
        assert_eq!(file.local_forwards[0].target, "example.com:443");
    }
}
