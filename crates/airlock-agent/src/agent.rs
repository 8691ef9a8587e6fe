//! Agent control channel management

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use airlock_monitor::{CircuitBreaker, Monitor};
use airlock_proto::{
    codec, Decoded, Envelope, TargetAnnouncement, PING_INTERVAL, PONG_TIMEOUT, SEND_QUEUE_CAPACITY,
};
use airlock_session::SessionManager;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::forwarder;
use crate::listener::LocalListener;
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::tls::{self, TlsError};
use crate::{AgentConfig, REGISTER_TIMEOUT};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors that can occur in the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("authentication rejected by relay")]
    Unauthorized,

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// The tunnel agent. Owns the reconnect loop, the per-channel reader,
/// writer and keepalive tasks, and the agent-side session manager.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) sessions: SessionManager,
    pub(crate) monitor: Arc<Monitor>,
    pub(crate) cancel: CancellationToken,
    /// Outbound queue of the currently established channel, if any.
    /// Local listeners read this to reach the relay.
    pub(crate) current: Arc<RwLock<Option<mpsc::Sender<Envelope>>>>,
    pub(crate) connected: Arc<AtomicBool>,
    /// Per-target dial breakers: a dead target fails fast instead of
    /// eating a 10 s dial timeout per session.
    pub(crate) breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let url = url::Url::parse(&config.server_url)
            .map_err(|e| AgentError::InvalidConfig(format!("invalid server URL: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(AgentError::InvalidConfig(format!(
                "server URL must be ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }

        if config.agent_id.is_empty() {
            return Err(AgentError::InvalidConfig("agent id is empty".to_string()));
        }

        Ok(Self {
            config,
            sessions: SessionManager::new(),
            monitor: Arc::new(Monitor::new("agent")),
            cancel: CancellationToken::new(),
            current: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            breakers: RwLock::new(HashMap::new()),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Request a graceful stop; `run` returns after the current channel
    /// winds down.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the agent: local listeners persist across reconnects, the
    /// control channel is re-established with exponential backoff.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        for forward in &self.config.local_forwards {
            let listener = Arc::new(LocalListener::new(self.clone(), forward.clone()));
            tokio::spawn(listener.run());
        }

        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match connect_once(&self).await {
                Ok(()) => {
                    // Was registered; the backoff restarts from the
                    // initial delay.
                    reconnect.reset();
                    self.monitor.metrics().record_reconnect();
                    tracing::info!("Connection lost, reconnecting");
                }
                Err(AgentError::Unauthorized) => {
                    self.monitor.record_error("error", "authentication rejected");
                    tracing::error!("Relay rejected credentials, retrying with backoff");
                }
                Err(err) => {
                    self.monitor.record_error("error", err.to_string());
                    tracing::error!(
                        error = %err,
                        next_delay_secs = reconnect.current_delay().as_secs(),
                        "Connection attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                waited = reconnect.wait() => waited?,
            }
        }
    }

    pub(crate) fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Ok(breakers) = self.breakers.read() {
            if let Some(breaker) = breakers.get(target) {
                return breaker.clone();
            }
        }

        let breaker = Arc::new(CircuitBreaker::with_defaults(format!("dial:{target}")));
        if let Ok(mut breakers) = self.breakers.write() {
            breakers
                .entry(target.to_string())
                .or_insert_with(|| breaker.clone())
                .clone()
        } else {
            breaker
        }
    }
}

/// Establish one control channel: upgrade, register, then drive the
/// reader until the channel dies. `Ok` means registration succeeded at
/// some point, whatever ended the channel afterwards.
async fn connect_once(agent: &Arc<Agent>) -> Result<(), AgentError> {
    let mut request = agent.config.server_url.as_str().into_client_request()?;
    let auth = HeaderValue::from_str(&format!("Bearer {}", agent.config.auth_token))
        .map_err(|_| AgentError::InvalidConfig("token is not header-safe".to_string()))?;
    let client_id = HeaderValue::from_str(&agent.config.agent_id)
        .map_err(|_| AgentError::InvalidConfig("agent id is not header-safe".to_string()))?;
    request.headers_mut().insert("Authorization", auth);
    request.headers_mut().insert("X-Client-ID", client_id);

    let connector = tls::build_connector(agent.config.insecure, agent.config.ca_cert.as_deref())?;

    tracing::info!(url = %agent.config.server_url, "Connecting to relay");

    let (ws, _response) =
        match connect_async_tls_with_config(request, None, false, Some(connector)).await {
            Ok(established) => established,
            Err(tungstenite::Error::Http(response))
                if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
            {
                return Err(AgentError::Unauthorized);
            }
            Err(err) => return Err(err.into()),
        };

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Announce enabled forwarder targets with the registration so the
    // relay can echo them into `connect` frames.
    let announcements: Vec<TargetAnnouncement> = agent
        .config
        .forwarders
        .iter()
        .filter(|f| f.enabled)
        .map(|f| TargetAnnouncement {
            port: f.port,
            target: f.target.clone(),
        })
        .collect();

    let register = Envelope::Register {
        agent_id: agent.config.agent_id.clone(),
        forwarders: announcements,
    };
    let text = codec::encode(&register).map_err(|e| AgentError::Protocol(e.to_string()))?;
    ws_tx.send(WsMessage::Text(text)).await?;

    match timeout(REGISTER_TIMEOUT, await_registered(&mut ws_rx)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(AgentError::RegistrationFailed(
                "timed out waiting for confirmation".to_string(),
            ))
        }
    }

    tracing::info!(agent_id = %agent.config.agent_id, "Connected and registered");

    let channel_cancel = agent.cancel.child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

    if let Ok(mut current) = agent.current.write() {
        *current = Some(outbound_tx.clone());
    }
    agent.connected.store(true, Ordering::SeqCst);
    agent.monitor.metrics().connection_opened();

    tokio::spawn(write_loop(
        ws_tx,
        outbound_rx,
        channel_cancel.clone(),
        agent.monitor.clone(),
    ));
    tokio::spawn(keepalive(outbound_tx.clone(), channel_cancel.clone()));

    let result = read_loop(agent, &mut ws_rx, &outbound_tx, &channel_cancel).await;

    // Channel teardown cascades: cancel tasks, drop the outbound
    // handle, terminate every session this channel owned.
    channel_cancel.cancel();
    agent.connected.store(false, Ordering::SeqCst);
    if let Ok(mut current) = agent.current.write() {
        *current = None;
    }
    agent.sessions.shutdown().await;
    agent.monitor.metrics().connection_closed();

    if let Err(err) = result {
        agent.monitor.record_error("error", err.to_string());
        tracing::warn!(error = %err, "Control channel terminated");
    }

    Ok(())
}

async fn read_loop(
    agent: &Arc<Agent>,
    ws_rx: &mut SplitStream<WsStream>,
    outbound: &mpsc::Sender<Envelope>,
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = timeout(PONG_TIMEOUT, ws_rx.next()) => frame,
        };

        let frame = match frame {
            Err(_) => return Err(AgentError::Protocol("pong deadline missed".to_string())),
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => {
                tracing::debug!(error = %err, "Transport read failed");
                return Ok(());
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => return Ok(()),
            other => {
                tracing::warn!(frame = ?other, "Ignoring non-text frame");
                continue;
            }
        };

        agent.monitor.metrics().record_message(text.len());

        match codec::decode(&text) {
            Ok(Decoded::Message(msg)) => handle_message(agent, outbound, msg).await?,
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!(kind = %kind, "Ignoring unknown message type");
            }
            Err(err) => return Err(AgentError::Protocol(err.to_string())),
        }
    }
}

async fn handle_message(
    agent: &Arc<Agent>,
    outbound: &mpsc::Sender<Envelope>,
    msg: Envelope,
) -> Result<(), AgentError> {
    match msg {
        Envelope::Ping => {
            if outbound.try_send(Envelope::Pong).is_err() {
                agent.monitor.record_error("error", "pong reply not queued");
            }
            Ok(())
        }
        Envelope::Pong => Ok(()),
        Envelope::Registered { agent_id } => {
            tracing::debug!(agent_id = %agent_id, "Registration re-confirmed");
            Ok(())
        }
        Envelope::Register { .. } => {
            tracing::warn!("Unexpected register frame from relay");
            Ok(())
        }
        Envelope::Forward { data } => forwarder::handle_frame(agent, outbound, data).await,
    }
}

/// Wait for the relay's `registered` confirmation.
async fn await_registered(ws_rx: &mut SplitStream<WsStream>) -> Result<(), AgentError> {
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) | Err(_) => {
                return Err(AgentError::RegistrationFailed(
                    "channel closed during registration".to_string(),
                ))
            }
            Ok(other) => {
                return Err(AgentError::Protocol(format!(
                    "unexpected frame during registration: {other:?}"
                )))
            }
        };

        match codec::decode(&text) {
            Ok(Decoded::Message(Envelope::Registered { agent_id })) => {
                tracing::debug!(agent_id = %agent_id, "Registration confirmed");
                return Ok(());
            }
            Ok(Decoded::Message(other)) => {
                return Err(AgentError::RegistrationFailed(format!(
                    "unexpected response: {other:?}"
                )))
            }
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!(kind = %kind, "Ignoring unknown frame during registration");
            }
            Err(err) => return Err(AgentError::Protocol(err.to_string())),
        }
    }

    Err(AgentError::RegistrationFailed(
        "channel closed during registration".to_string(),
    ))
}

/// Single writer for the transport; also emits transport pings.
async fn write_loop(
    mut ws_tx: SplitSink<WsStream, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    monitor: Arc<Monitor>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };

                match codec::encode(&msg) {
                    Ok(text) => {
                        monitor.metrics().record_message(text.len());
                        if let Err(err) = ws_tx.send(WsMessage::Text(text)).await {
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

/// Application-level liveness: one `ping` per interval. A ping that
/// cannot even be queued means the channel is wedged, so drop it.
async fn keepalive(outbound: mpsc::Sender<Envelope>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = outbound.try_send(Envelope::Ping) {
                    tracing::warn!(error = %err, "Failed to queue ping, dropping channel");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_rejects_bad_server_url() {
        let config = AgentConfig {
            server_url: "https://relay:8443/tunnel".to_string(),
            auth_token: "t".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidConfig(_))
        ));

        let config = AgentConfig {
            server_url: "not a url".to_string(),
            auth_token: "t".to_string(),
            ..Default::default()
        };
        assert!(Agent::new(config).is_err());
    }

    #[test]
    fn test_agent_rejects_empty_id() {
        let config = AgentConfig {
            agent_id: String::new(),
            auth_token: "t".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_agent_starts_disconnected() {
        let agent = Agent::new(AgentConfig {
            auth_token: "t".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(!agent.is_connected());
    }
}
