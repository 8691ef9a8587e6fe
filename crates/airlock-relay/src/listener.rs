//! Relay port listeners and session dispatcher
//!
//! One listener per configured `{port, agent_id}` pair. The listener
//! only knows which agent its accepts belong to; targets are chosen on
//! the agent side and at most echoed from the agent's registration
//! announcement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use airlock_proto::{Envelope, SessionFrame};
use airlock_session::SessionError;
use tokio::net::{TcpListener, TcpStream};

use crate::{RelayState, READY_TIMEOUT};

/// TCP listener bound to one relay port, routing to one agent.
pub struct PortListener {
    name: String,
    port: u16,
    agent_id: String,
    counter: AtomicU64,
}

impl PortListener {
    pub fn new(name: impl Into<String>, port: u16, agent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            agent_id: agent_id.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the listen socket. Kept separate from [`PortListener::run`]
    /// so startup can decide whether a bind failure is fatal
    /// (`warn_on_fail`).
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        tracing::info!(
            forwarder = %self.name,
            port = self.port,
            agent_id = %self.agent_id,
            "Port listener started"
        );
        Ok(listener)
    }

    /// Accept loop. Each accepted connection is dispatched on its own
    /// task; the loop ends on process shutdown.
    pub async fn run(self: Arc<Self>, state: Arc<RelayState>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer_addr)) => {
                            tracing::debug!(
                                port = self.port,
                                peer_addr = %peer_addr,
                                "Accepted external connection"
                            );
                            let listener = self.clone();
                            let state = state.clone();
                            tokio::spawn(async move {
                                listener.dispatch(state, conn).await;
                            });
                        }
                        Err(err) => {
                            tracing::error!(port = self.port, error = %err, "Accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!(port = self.port, "Port listener stopped");
    }

    /// Drive one accepted TCP connection through the session protocol.
    async fn dispatch(&self, state: Arc<RelayState>, conn: TcpStream) {
        // Strictly monotonic per-listener counter keeps ids unique
        // within the agent across reconnects.
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("{}-{}-{}", self.agent_id, self.port, seq);

        let Some(agent) = state.registry.get(&self.agent_id) else {
            // No frame is emitted for an absent agent; the external
            // client just sees the connection close.
            tracing::warn!(
                agent_id = %self.agent_id,
                port = self.port,
                "Agent not connected, dropping external connection"
            );
            return;
        };

        let target = agent.target_for(self.port).unwrap_or_default();

        let session = match state
            .sessions
            .create(
                session_id.clone(),
                self.agent_id.clone(),
                target.clone(),
                conn,
                agent.outbound(),
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "Session create failed");
                return;
            }
        };

        state.monitor.metrics().session_opened();

        tracing::info!(
            session_id = %session_id,
            agent_id = %self.agent_id,
            target = %target,
            "Starting session"
        );

        let connect = Envelope::forward(SessionFrame::Connect {
            session_id: session_id.clone(),
            target,
            port: self.port,
        });
        if let Err(err) = agent.send(connect) {
            state
                .monitor
                .record_error("error", format!("connect not queued: {err}"));
            session.mark_peer_notified();
            state.sessions.remove(&session_id).await;
            state.monitor.metrics().session_closed();
            return;
        }

        // Readiness barrier: no local reads are pumped until the agent
        // confirms the target dial.
        match session.await_ready(READY_TIMEOUT).await {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "Agent confirmed, starting data flow");
                session.clone().start_reader();
            }
            Err(SessionError::ReadyTimeout) => {
                tracing::warn!(session_id = %session_id, "Timed out waiting for agent readiness");
                state
                    .monitor
                    .record_error("warn", format!("session {session_id} readiness timeout"));
                state.sessions.remove(&session_id).await;
                state.monitor.metrics().session_closed();
                return;
            }
            Err(_) => {
                // Torn down before readiness (agent error or channel loss).
                state.sessions.remove(&session_id).await;
                state.monitor.metrics().session_closed();
                return;
            }
        }

        session.closed().await;
        state.sessions.remove(&session_id).await;
        state.monitor.metrics().session_closed();

        tracing::info!(session_id = %session_id, "Session ended");
    }
}
