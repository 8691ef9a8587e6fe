//! Indexed collection of live sessions

use std::collections::HashMap;
use std::sync::Arc;

use airlock_proto::Envelope;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::session::{Session, SessionError};

/// Snapshot of one live session, for health reporting.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: String,
    pub target: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Thread-safe registry of live sessions keyed by session id.
///
/// Both endpoints hold one: the relay for sessions whose external TCP
/// connection it accepted, the agent for sessions whose target it
/// dialed. Removal is idempotent and always funnels through
/// [`Session::close`].
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session around an established local TCP endpoint
    /// and start its write pump. Fails if the id is already live.
    pub async fn create(
        &self,
        id: String,
        agent_id: String,
        target: String,
        stream: TcpStream,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateId(id));
        }

        let session = Session::spawn(id.clone(), agent_id, target, stream, outbound);
        sessions.insert(id, session.clone());

        tracing::debug!(
            session_id = %session.id(),
            active_sessions = sessions.len(),
            "Session created"
        );

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove and close a session. Safe to call any number of times.
    pub async fn remove(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);

        if let Some(session) = removed {
            session.close();
            tracing::debug!(session_id = %id, "Session removed");
        }
    }

    /// Tear down every session owned by one agent. Used when that
    /// agent's control channel goes away.
    pub async fn shutdown_agent(&self, agent_id: &str) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.agent_id() == agent_id)
                .map(|s| s.id().to_string())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        if drained.is_empty() {
            return;
        }

        for session in &drained {
            // The channel is gone, nobody is listening for a disconnect.
            session.mark_peer_notified();
            session.close();
        }

        tracing::info!(
            agent_id = %agent_id,
            sessions = drained.len(),
            "Cancelled sessions for departed agent"
        );
    }

    /// Tear down every session. Used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        for session in &drained {
            session.close();
        }

        if !drained.is_empty() {
            tracing::info!(sessions = drained.len(), "All sessions shut down");
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Count of live sessions owned by one agent.
    pub async fn count_for_agent(&self, agent_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.agent_id() == agent_id)
            .count()
    }

    /// Snapshot of live sessions, capped to `limit` entries.
    pub async fn list(&self, limit: usize) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .take(limit)
            .map(|s| SessionInfo {
                id: s.id().to_string(),
                agent_id: s.agent_id().to_string(),
                target: s.target().to_string(),
                created_at: s.created_at(),
            })
            .collect()
    }
}
