//! Agent-side local listeners (agent-initiated sessions)
//!
//! The symmetric entry point: a local TCP accept produces a `connect`
//! frame toward the relay, which dials the target in its network. The
//! session machinery is identical to the relay-initiated direction,
//! only the initiator differs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use airlock_proto::{Envelope, SessionFrame};
use airlock_session::SessionError;
use tokio::net::{TcpListener, TcpStream};

use crate::agent::Agent;
use crate::{LocalForward, READY_TIMEOUT};

/// One local listen port tunneled out through the relay.
pub struct LocalListener {
    agent: Arc<Agent>,
    forward: LocalForward,
    counter: AtomicU64,
}

impl LocalListener {
    pub fn new(agent: Arc<Agent>, forward: LocalForward) -> Self {
        Self {
            agent,
            forward,
            counter: AtomicU64::new(0),
        }
    }

    /// Accept loop; persists across relay reconnects.
    pub async fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(("0.0.0.0", self.forward.port)).await {
            Ok(listener) => {
                tracing::info!(
                    port = self.forward.port,
                    target = %self.forward.target,
                    "Local listener started"
                );
                listener
            }
            Err(err) => {
                tracing::error!(
                    port = self.forward.port,
                    error = %err,
                    "Failed to bind local listener"
                );
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.agent.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer_addr)) => {
                            tracing::debug!(
                                port = self.forward.port,
                                peer_addr = %peer_addr,
                                "Accepted local connection"
                            );
                            let listener = self.clone();
                            tokio::spawn(async move {
                                listener.dispatch(conn).await;
                            });
                        }
                        Err(err) => {
                            tracing::error!(
                                port = self.forward.port,
                                error = %err,
                                "Local accept failed"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(port = self.forward.port, "Local listener stopped");
    }

    async fn dispatch(&self, conn: TcpStream) {
        let outbound = self
            .agent
            .current
            .read()
            .ok()
            .and_then(|current| current.as_ref().cloned());

        let Some(outbound) = outbound else {
            tracing::warn!(
                port = self.forward.port,
                "Relay channel unavailable, dropping local connection"
            );
            return;
        };

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!(
            "{}-out-{}-{}",
            self.agent.agent_id(),
            self.forward.port,
            seq
        );

        let session = match self
            .agent
            .sessions
            .create(
                session_id.clone(),
                self.agent.agent_id().to_string(),
                self.forward.target.clone(),
                conn,
                outbound.clone(),
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "Session create failed");
                return;
            }
        };

        self.agent.monitor.metrics().session_opened();

        let connect = Envelope::forward(SessionFrame::Connect {
            session_id: session_id.clone(),
            target: self.forward.target.clone(),
            port: self.forward.port,
        });
        if outbound.try_send(connect).is_err() {
            self.agent
                .monitor
                .record_error("error", "connect not queued");
            session.mark_peer_notified();
            self.agent.sessions.remove(&session_id).await;
            self.agent.monitor.metrics().session_closed();
            return;
        }

        match session.await_ready(READY_TIMEOUT).await {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "Relay confirmed, starting data flow");
                session.clone().start_reader();
            }
            Err(SessionError::ReadyTimeout) => {
                tracing::warn!(session_id = %session_id, "Timed out waiting for relay readiness");
                self.agent
                    .monitor
                    .record_error("warn", format!("session {session_id} readiness timeout"));
                self.agent.sessions.remove(&session_id).await;
                self.agent.monitor.metrics().session_closed();
                return;
            }
            Err(_) => {
                self.agent.sessions.remove(&session_id).await;
                self.agent.monitor.metrics().session_closed();
                return;
            }
        }

        session.closed().await;
        self.agent.sessions.remove(&session_id).await;
        self.agent.monitor.metrics().session_closed();
    }
}
