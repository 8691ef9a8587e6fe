//! Per-agent control channel driver
//!
//! One reader loop (this task), one writer task that owns the WebSocket
//! sink, and one liveness sweep per channel. Any protocol violation,
//! codec error, deadline miss or write error terminates the channel;
//! termination unregisters the agent and cancels every session it owns.

use std::sync::Arc;

use airlock_proto::{
    codec, Decoded, Envelope, SessionFrame, TargetAnnouncement, PING_INTERVAL, PONG_TIMEOUT,
    SEND_QUEUE_CAPACITY,
};
use airlock_session::SessionError;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::registry::AgentHandle;
use crate::{RelayState, DIAL_TIMEOUT, LIVENESS_SWEEP_INTERVAL, REGISTER_TIMEOUT};

#[derive(Error, Debug)]
enum ChannelError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("channel closed before registration")]
    ClosedEarly,
}

/// Drive one agent control channel to completion.
pub async fn run(state: Arc<RelayState>, socket: WebSocket, header_id: Option<String>) {
    let (ws_tx, mut ws_rx) = socket.split();

    let registered = match timeout(REGISTER_TIMEOUT, await_register(&mut ws_rx)).await {
        Ok(Ok(registration)) => registration,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Registration failed");
            return;
        }
        Err(_) => {
            tracing::warn!("Agent did not register in time");
            return;
        }
    };

    let agent_id = resolve_agent_id(registered.0, header_id);
    let announcements = registered.1;

    let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let cancel = state.shutdown.child_token();
    let handle = Arc::new(AgentHandle::new(
        agent_id.clone(),
        outbound_tx,
        cancel.clone(),
    ));
    handle.set_targets(&announcements);

    // Re-registration atomically replaces the prior record; the
    // displaced channel and all sessions it owned are terminated.
    if let Some(displaced) = state.registry.register_or_replace(handle.clone()) {
        displaced.cancel_token().cancel();
        state.sessions.shutdown_agent(&agent_id).await;
    }

    state.monitor.metrics().connection_opened();

    if let Err(err) = handle.send(Envelope::Registered {
        agent_id: agent_id.clone(),
    }) {
        tracing::error!(agent_id = %agent_id, error = %err, "Failed to confirm registration");
    }

    tokio::spawn(write_loop(
        ws_tx,
        outbound_rx,
        cancel.clone(),
        state.clone(),
    ));
    tokio::spawn(liveness_sweep(handle.clone(), cancel.clone()));

    let result = read_loop(&state, &handle, &mut ws_rx).await;
    if let Err(err) = result {
        state.monitor.record_error("error", err.to_string());
        tracing::warn!(agent_id = %agent_id, error = %err, "Control channel terminated");
    }

    cancel.cancel();
    if state.registry.remove_if(&handle) {
        state.sessions.shutdown_agent(&agent_id).await;
    }
    state.monitor.metrics().connection_closed();

    tracing::info!(agent_id = %agent_id, "Control channel closed");
}

/// Consume frames until the agent's `register` arrives.
async fn await_register(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<(String, Vec<TargetAnnouncement>), ChannelError> {
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return Err(ChannelError::ClosedEarly),
            Ok(other) => {
                return Err(ChannelError::Protocol(format!(
                    "unexpected frame before register: {other:?}"
                )))
            }
        };

        match codec::decode(&text) {
            Ok(Decoded::Message(Envelope::Register {
                agent_id,
                forwarders,
            })) => return Ok((agent_id, forwarders)),
            Ok(Decoded::Message(other)) => {
                return Err(ChannelError::Protocol(format!(
                    "expected register, got {other:?}"
                )))
            }
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!(kind = %kind, "Ignoring unknown frame before register");
            }
            Err(err) => return Err(ChannelError::Protocol(err.to_string())),
        }
    }

    Err(ChannelError::ClosedEarly)
}

fn resolve_agent_id(frame_id: String, header_id: Option<String>) -> String {
    if let Some(header_id) = header_id {
        if !frame_id.is_empty() && frame_id != header_id {
            tracing::warn!(
                header = %header_id,
                frame = %frame_id,
                "X-Client-ID and register id disagree, using register id"
            );
            return frame_id;
        }
        return header_id;
    }

    if frame_id.is_empty() {
        let generated = format!("agent-{}", uuid::Uuid::new_v4());
        tracing::info!(agent_id = %generated, "Agent supplied no id, generated one");
        generated
    } else {
        frame_id
    }
}

/// Single writer for the transport: drains the outbound queue and emits
/// transport pings on the keepalive cadence.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    state: Arc<RelayState>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };

                match codec::encode(&msg) {
                    Ok(text) => {
                        state.monitor.metrics().record_message(text.len());
                        if let Err(err) = ws_tx.send(Message::Text(text)).await {
                            tracing::debug!(error = %err, "Transport write failed");
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to encode outbound message");
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = ws_tx.close().await;
}

/// Declare the agent dead once two pong intervals pass unobserved.
async fn liveness_sweep(handle: Arc<AgentHandle>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if handle.idle_secs() > 2 * PONG_TIMEOUT.as_secs() as i64 {
                    tracing::warn!(
                        agent_id = %handle.agent_id(),
                        "Agent liveness timeout"
                    );
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn read_loop(
    state: &Arc<RelayState>,
    handle: &Arc<AgentHandle>,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<(), ChannelError> {
    loop {
        let frame = tokio::select! {
            _ = handle.cancel_token().cancelled() => return Ok(()),
            frame = timeout(PONG_TIMEOUT, ws_rx.next()) => frame,
        };

        let frame = match frame {
            Err(_) => {
                return Err(ChannelError::Protocol(
                    "pong deadline missed".to_string(),
                ))
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(_))) => return Ok(()),
            Ok(Some(Ok(frame))) => frame,
        };

        handle.touch();

        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(()),
            Message::Binary(_) => {
                tracing::warn!(agent_id = %handle.agent_id(), "Ignoring binary frame");
                continue;
            }
        };

        state.monitor.metrics().record_message(text.len());

        match codec::decode(&text) {
            Ok(Decoded::Message(msg)) => handle_message(state, handle, msg).await?,
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!(
                    agent_id = %handle.agent_id(),
                    kind = %kind,
                    "Ignoring unknown message type"
                );
            }
            Err(err) => return Err(ChannelError::Protocol(err.to_string())),
        }
    }
}

async fn handle_message(
    state: &Arc<RelayState>,
    handle: &Arc<AgentHandle>,
    msg: Envelope,
) -> Result<(), ChannelError> {
    match msg {
        Envelope::Ping => {
            if let Err(err) = handle.send(Envelope::Pong) {
                state.monitor.record_error("error", "pong reply not queued");
                tracing::error!(agent_id = %handle.agent_id(), error = %err, "Failed to queue pong");
            }
            Ok(())
        }
        Envelope::Pong => Ok(()),
        Envelope::Register { forwarders, .. } => {
            // In-band re-announcement on a live channel.
            handle.set_targets(&forwarders);
            if let Err(err) = handle.send(Envelope::Registered {
                agent_id: handle.agent_id().to_string(),
            }) {
                tracing::error!(agent_id = %handle.agent_id(), error = %err, "Failed to re-confirm registration");
            }
            Ok(())
        }
        Envelope::Registered { .. } => {
            tracing::warn!(agent_id = %handle.agent_id(), "Unexpected registered frame from agent");
            Ok(())
        }
        Envelope::Forward { data } => handle_frame(state, handle, data).await,
    }
}

async fn handle_frame(
    state: &Arc<RelayState>,
    handle: &Arc<AgentHandle>,
    frame: SessionFrame,
) -> Result<(), ChannelError> {
    match frame {
        SessionFrame::Connected { session_id } => {
            match state.sessions.get(&session_id).await {
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
                .map_err(|err| ChannelError::Protocol(err.to_string()))?;

            let Some(session) = state.sessions.get(&session_id).await else {
                tracing::warn!(session_id = %session_id, "Dropping data for unknown session");
                return Ok(());
            };

            // Readiness barrier: nothing flows before `connected`.
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
                    state
                        .monitor
                        .record_error("error", format!("session {session_id} write queue full"));
                    session.close_with_error("session write queue full");
                    state.sessions.remove(&session_id).await;
                }
                Err(_) => {
                    state.sessions.remove(&session_id).await;
                }
            }
            Ok(())
        }

        SessionFrame::Disconnect { session_id } => {
            if let Some(session) = state.sessions.get(&session_id).await {
                session.mark_peer_notified();
                state.sessions.remove(&session_id).await;
            } else {
                tracing::warn!(session_id = %session_id, "Dropping disconnect for unknown session");
            }
            Ok(())
        }

        SessionFrame::Error { session_id, error } => {
            tracing::error!(
                agent_id = %handle.agent_id(),
                session_id = %session_id,
                error = %error,
                "Agent reported session error"
            );
            state.monitor.record_error("error", error);

            if let Some(session) = state.sessions.get(&session_id).await {
                session.mark_peer_notified();
                state.sessions.remove(&session_id).await;
            }
            Ok(())
        }

        SessionFrame::Connect {
            session_id,
            target,
            ..
        } => {
            // Agent-initiated session: the relay dials the target in its
            // own network and mirrors the readiness handshake.
            let state = state.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                handle_agent_connect(state, handle, session_id, target).await;
            });
            Ok(())
        }
    }
}

/// Dial and drive a session requested by the agent (`connect` toward
/// the relay, the symmetric entry point).
async fn handle_agent_connect(
    state: Arc<RelayState>,
    handle: Arc<AgentHandle>,
    session_id: String,
    target: String,
) {
    let fail = |reason: String| {
        tracing::warn!(
            session_id = %session_id,
            target = %target,
            reason = %reason,
            "Agent-initiated connect failed"
        );
        state.monitor.record_error("warn", reason.clone());
        if handle
            .send(Envelope::forward(SessionFrame::error(&session_id, reason)))
            .is_err()
        {
            tracing::debug!(session_id = %session_id, "Error frame not delivered");
        }
    };

    if target.is_empty() {
        fail("no target requested".to_string());
        return;
    }

    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            fail(err.to_string());
            return;
        }
        Err(_) => {
            fail("dial timeout".to_string());
            return;
        }
    };

    let session = match state
        .sessions
        .create(
            session_id.clone(),
            handle.agent_id().to_string(),
            target.clone(),
            stream,
            handle.outbound(),
        )
        .await
    {
        Ok(session) => session,
        Err(err) => {
            fail(err.to_string());
            return;
        }
    };

    state.monitor.metrics().session_opened();

    if handle
        .send(Envelope::forward(SessionFrame::Connected {
            session_id: session_id.clone(),
        }))
        .is_err()
    {
        state.sessions.remove(&session_id).await;
        state.monitor.metrics().session_closed();
        return;
    }

    tracing::info!(
        agent_id = %handle.agent_id(),
        session_id = %session_id,
        target = %target,
        "Established relay-side connection for agent"
    );

    session.mark_ready();
    session.clone().start_reader();

    session.closed().await;
    state.sessions.remove(&session_id).await;
    state.monitor.metrics().session_closed();
}
