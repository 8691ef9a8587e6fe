//! Session frame handling and target dialing

use std::sync::Arc;

use airlock_monitor::BreakerError;
use airlock_proto::{codec, Envelope, SessionFrame};
use airlock_session::SessionError;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::agent::{Agent, AgentError};
use crate::DIAL_TIMEOUT;

/// Dispatch one session frame from the relay.
pub(crate) async fn handle_frame(
    agent: &Arc<Agent>,
    outbound: &mpsc::Sender<Envelope>,
    frame: SessionFrame,
) -> Result<(), AgentError> {
    match frame {
        SessionFrame::Connect {
            session_id,
            target,
            port,
        } => {
            // The target comes from this agent's own announcement, or
            // from the local forwarder definition for the port.
            let resolved = if !target.is_empty() {
                Some(target)
            } else {
                agent
                    .config
                    .forwarders
                    .iter()
                    .find(|f| f.enabled && f.port == port)
                    .map(|f| f.target.clone())
            };

            let Some(target) = resolved else {
                tracing::warn!(
                    session_id = %session_id,
                    port,
                    "No forwarder definition for requested port"
                );
                let frame =
                    SessionFrame::error(&session_id, format!("no forwarder for port {port}"));
                if outbound.try_send(Envelope::forward(frame)).is_err() {
                    tracing::debug!(session_id = %session_id, "Error frame not delivered");
                }
                return Ok(());
            };

            let agent = agent.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                dial_and_serve(agent, outbound, session_id, target).await;
            });
            Ok(())
        }

        SessionFrame::Connected { session_id } => {
            // Readiness for an agent-initiated (local listener) session.
            match agent.sessions.get(&session_id).await {
                Some(session) => session.mark_ready(),
                None => {
                    tracing::warn!(
                        session_id = %session_id,
                        "Dropping connected for unknown session"
                    );
                }
            }
            Ok(())
        }

        SessionFrame::Data { session_id, data } => {
            let bytes = codec::decode_payload(&data)
                .map_err(|err| AgentError::Protocol(err.to_string()))?;

            let Some(session) = agent.sessions.get(&session_id).await else {
                tracing::warn!(session_id = %session_id, "Dropping data for unknown session");
                return Ok(());
            };

            if !session.is_ready() {
                tracing::warn!(
                    session_id = %session_id,
                    "Dropping data received before readiness"
                );
                return Ok(());
            }

            match session.write(bytes) {
                Ok(()) => {}
                Err(SessionError::QueueFull) => {
                    agent
                        .monitor
                        .record_error("error", format!("session {session_id} write queue full"));
                    session.close_with_error("session write queue full");
                    agent.sessions.remove(&session_id).await;
                }
                Err(_) => {
                    agent.sessions.remove(&session_id).await;
                }
            }
            Ok(())
        }

        SessionFrame::Disconnect { session_id } => {
            if let Some(session) = agent.sessions.get(&session_id).await {
                session.mark_peer_notified();
                agent.sessions.remove(&session_id).await;
            } else {
                tracing::warn!(
                    session_id = %session_id,
                    "Dropping disconnect for unknown session"
                );
            }
            Ok(())
        }

        SessionFrame::Error { session_id, error } => {
            tracing::error!(
                session_id = %session_id,
                error = %error,
                "Relay reported session error"
            );
            agent.monitor.record_error("error", error);

            if let Some(session) = agent.sessions.get(&session_id).await {
                session.mark_peer_notified();
                agent.sessions.remove(&session_id).await;
            }
            Ok(())
        }
    }
}

/// Dial the target and, on success, serve the session until either side
/// ends it. A dial failure produces an `error` frame and no session.
async fn dial_and_serve(
    agent: Arc<Agent>,
    outbound: mpsc::Sender<Envelope>,
    session_id: String,
    target: String,
) {
    let breaker = agent.breaker_for(&target);

    let dialed = breaker
        .call(|| async {
            match timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timeout",
                )),
            }
        })
        .await;

    let stream = match dialed {
        Ok(stream) => stream,
        Err(err) => {
            let reason = match err {
                BreakerError::Open(_) => "target circuit open".to_string(),
                BreakerError::Inner(io) => io.to_string(),
            };

            tracing::warn!(
                session_id = %session_id,
                target = %target,
                reason = %reason,
                "Failed to connect to local service"
            );
            agent
                .monitor
                .record_error("warn", format!("dial {target} failed: {reason}"));

            let frame = SessionFrame::error(&session_id, reason);
            if outbound.try_send(Envelope::forward(frame)).is_err() {
                tracing::debug!(session_id = %session_id, "Error frame not delivered");
            }
            return;
        }
    };

    let session = match agent
        .sessions
        .create(
            session_id.clone(),
            agent.config.agent_id.clone(),
            target.clone(),
            stream,
            outbound.clone(),
        )
        .await
    {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(session_id = %session_id, error = %err, "Session create failed");
            let frame = SessionFrame::error(&session_id, err.to_string());
            let _ = outbound.try_send(Envelope::forward(frame));
            return;
        }
    };

    // No barrier on the dialing side: bytes may flow as soon as the
    // peer learns the dial completed.
    session.mark_ready();
    agent.monitor.metrics().session_opened();

    let connected = Envelope::forward(SessionFrame::Connected {
        session_id: session_id.clone(),
    });
    if outbound.try_send(connected).is_err() {
        tracing::warn!(session_id = %session_id, "Connected frame not queued, aborting");
        session.mark_peer_notified();
        agent.sessions.remove(&session_id).await;
        agent.monitor.metrics().session_closed();
        return;
    }

    session.clone().start_reader();

    tracing::info!(
        session_id = %session_id,
        target = %target,
        "Connected to local service"
    );

    session.closed().await;
    agent.sessions.remove(&session_id).await;
    agent.monitor.metrics().session_closed();
}
