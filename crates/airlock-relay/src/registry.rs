//! Registry of connected agents

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use airlock_proto::{Envelope, TargetAnnouncement};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Failure to queue a message onto an agent's control channel.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("agent send queue full")]
    QueueFull,

    #[error("agent channel closed")]
    ChannelClosed,
}

/// One connected agent's control channel, as seen by the rest of the
/// relay. Lifetime is bounded by the channel: the handle is registered
/// after a successful `register` and dropped when the channel dies.
pub struct AgentHandle {
    agent_id: String,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    last_seen: AtomicI64,
    targets: RwLock<HashMap<u16, String>>,
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl AgentHandle {
    pub fn new(
        agent_id: String,
        outbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            outbound,
            cancel,
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp()),
            targets: RwLock::new(HashMap::new()),
            connected_at: chrono::Utc::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// Record liveness; called for every inbound frame.
    pub fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last inbound frame.
    pub fn idle_secs(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.last_seen.load(Ordering::Relaxed)
    }

    pub fn last_seen(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.last_seen.load(Ordering::Relaxed), 0)
            .unwrap_or_else(chrono::Utc::now)
    }

    /// Replace the announced `port → target` map from a `register`.
    pub fn set_targets(&self, announcements: &[TargetAnnouncement]) {
        if let Ok(mut targets) = self.targets.write() {
            targets.clear();
            for a in announcements {
                targets.insert(a.port, a.target.clone());
            }
        }
    }

    /// Target this agent announced for a listen port, if any. The relay
    /// echoes this literally into `connect`; it never resolves targets
    /// from its own configuration.
    pub fn target_for(&self, port: u16) -> Option<String> {
        self.targets.read().ok()?.get(&port).cloned()
    }

    /// Clone of the outbound queue, for session pumps.
    pub fn outbound(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Queue a control message without blocking. A full queue is
    /// surfaced, never silently dropped.
    pub fn send(&self, msg: Envelope) -> Result<(), SendError> {
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SendError::ChannelClosed),
        }
    }
}

/// Thread-safe registry of connected agents keyed by agent id.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<AgentHandle>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any prior entry with the same id.
    /// Returns the displaced handle so the caller can cancel its channel
    /// and terminate its sessions.
    pub fn register_or_replace(&self, handle: Arc<AgentHandle>) -> Option<Arc<AgentHandle>> {
        let mut agents = self.agents.write().expect("agent registry lock poisoned");
        let old = agents.insert(handle.agent_id().to_string(), handle.clone());

        if old.is_some() {
            tracing::info!(
                agent_id = %handle.agent_id(),
                "Re-registered agent, replacing stale channel"
            );
        } else {
            tracing::info!(agent_id = %handle.agent_id(), "Registered agent");
        }

        old
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Remove an agent only if the registered handle is still `handle`.
    /// Keeps a dying channel from unregistering its replacement.
    pub fn remove_if(&self, handle: &Arc<AgentHandle>) -> bool {
        let mut agents = self.agents.write().expect("agent registry lock poisoned");

        match agents.get(handle.agent_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                agents.remove(handle.agent_id());
                tracing::info!(agent_id = %handle.agent_id(), "Unregistered agent");
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<Arc<AgentHandle>> {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> Arc<AgentHandle> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(AgentHandle::new(
            id.to_string(),
            tx,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        registry.register_or_replace(handle("a-web"));

        assert!(registry.get("a-web").is_some());
        assert!(registry.get("a-db").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_replace_returns_displaced_handle() {
        let registry = AgentRegistry::new();
        let first = handle("a-web");
        let second = handle("a-web");

        assert!(registry.register_or_replace(first.clone()).is_none());
        let displaced = registry.register_or_replace(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&displaced, &first));
        assert_eq!(registry.count(), 1);
        assert!(Arc::ptr_eq(&registry.get("a-web").unwrap(), &second));
    }

    #[test]
    fn test_remove_if_ignores_replaced_handle() {
        let registry = AgentRegistry::new();
        let first = handle("a-web");
        let second = handle("a-web");

        registry.register_or_replace(first.clone());
        registry.register_or_replace(second.clone());

        // The displaced channel must not unregister its replacement.
        assert!(!registry.remove_if(&first));
        assert_eq!(registry.count(), 1);

        assert!(registry.remove_if(&second));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_target_announcements() {
        let agent = handle("a-web");
        agent.set_targets(&[
            TargetAnnouncement {
                port: 8080,
                target: "webapp:80".to_string(),
            },
            TargetAnnouncement {
                port: 5432,
                target: "database:5432".to_string(),
            },
        ]);

        assert_eq!(agent.target_for(8080).as_deref(), Some("webapp:80"));
        assert_eq!(agent.target_for(5432).as_deref(), Some("database:5432"));
        assert_eq!(agent.target_for(22), None);

        // A re-announcement replaces the whole map.
        agent.set_targets(&[TargetAnnouncement {
            port: 8080,
            target: "webapp-v2:80".to_string(),
        }]);
        assert_eq!(agent.target_for(8080).as_deref(), Some("webapp-v2:80"));
        assert_eq!(agent.target_for(5432), None);
    }

    #[test]
    fn test_send_surfaces_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let agent = Arc::new(AgentHandle::new(
            "a-web".to_string(),
            tx,
            CancellationToken::new(),
        ));

        assert!(agent.send(Envelope::Ping).is_ok());
        assert!(matches!(
            agent.send(Envelope::Ping),
            Err(SendError::QueueFull)
        ));
    }
}
