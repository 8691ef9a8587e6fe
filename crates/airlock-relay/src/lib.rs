//! Internet-facing relay for the airlock tunnel
//!
//! The relay accepts the duplex control channel from agents at
//! `GET /tunnel` (token-authenticated WebSocket upgrade), keeps an agent
//! registry keyed by agent id, and runs one TCP port listener per
//! configured forwarder. Each accepted TCP connection becomes a
//! relay-owned session driven against the owning agent: `connect` out,
//! readiness barrier, then `data` both ways until either side closes.

pub mod channel;
pub mod listener;
pub mod registry;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use airlock_monitor::Monitor;
use airlock_session::SessionManager;
use registry::AgentRegistry;
use tokio_util::sync::CancellationToken;

/// Deadline for the agent's `register` frame after the upgrade.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the agent's `connected` reply before a session is
/// abandoned with no bytes transmitted.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial deadline for agent-initiated sessions terminated on the relay.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the per-agent liveness sweep.
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Window allowed for in-flight sessions to drain on shutdown.
pub const DRAIN_WINDOW: Duration = Duration::from_secs(30);

/// Shared state behind the relay's HTTP surface and port listeners.
pub struct RelayState {
    token: String,
    pub registry: AgentRegistry,
    pub sessions: SessionManager,
    pub monitor: Arc<Monitor>,
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            registry: AgentRegistry::new(),
            sessions: SessionManager::new(),
            monitor: Arc::new(Monitor::new("relay")),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }
}
