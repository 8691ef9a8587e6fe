//! In-network agent for the airlock tunnel
//!
//! The agent initiates the outbound control channel to the relay,
//! re-initiating with exponential backoff on loss. It announces its
//! forwarder targets at registration, dials targets on `connect`, and
//! shuttles session bytes both ways. It may additionally run local port
//! listeners whose accepts produce `connect` frames toward the relay.

pub mod agent;
pub mod forwarder;
pub mod listener;
pub mod reconnect;
pub mod tls;

pub use agent::{Agent, AgentError};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

use std::path::PathBuf;
use std::time::Duration;

use airlock_config::ForwarderConfig;

/// Deadline for the relay's `registered` reply.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout for target dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the relay's `connected` on agent-initiated sessions.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// A local listen port whose accepted connections are tunneled out
/// through the relay (the symmetric, agent-initiated direction).
#[derive(Debug, Clone)]
pub struct LocalForward {
    pub port: u16,
    pub target: String,
}

/// Agent configuration, resolved and validated by the caller.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control channel URL, e.g. `wss://relay.example.com:8443/tunnel`.
    pub server_url: String,
    pub auth_token: String,
    pub agent_id: String,
    /// Skip relay certificate verification (development only).
    pub insecure: bool,
    /// Extra root certificate to trust, e.g. for a self-signed relay.
    pub ca_cert: Option<PathBuf>,
    /// Forwarder definitions; enabled entries are announced to the
    /// relay and key target resolution on `connect`.
    pub forwarders: Vec<ForwarderConfig>,
    /// Local listeners for the agent-initiated direction.
    pub local_forwards: Vec<LocalForward>,
    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://localhost:8443/tunnel".to_string(),
            auth_token: String::new(),
            agent_id: format!("agent-{}", uuid::Uuid::new_v4()),
            insecure: false,
            ca_cert: None,
            forwarders: Vec::new(),
            local_forwards: Vec::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}
