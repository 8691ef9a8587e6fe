//! Control channel message types

use serde::{Deserialize, Serialize};

/// Top-level control channel message.
///
/// Serialized as a JSON object with a `type` discriminator, e.g.
/// `{"type":"register","id":"a-web"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// First frame from the agent after the upgrade completes.
    Register {
        #[serde(rename = "id")]
        agent_id: String,
        /// Targets this agent serves, keyed by relay listen port.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        forwarders: Vec<TargetAnnouncement>,
    },
    /// First frame from the relay once auth and registration succeed.
    Registered {
        #[serde(rename = "id")]
        agent_id: String,
    },
    /// Application-level liveness probe.
    Ping,
    /// Reply to [`Envelope::Ping`].
    Pong,
    /// Wrapper carrying a session-level frame.
    Forward { data: SessionFrame },
}

/// A forwarder declaration sent with `register`: the agent announces
/// which target it dials for sessions accepted on a given relay port.
///
/// The relay stores these opaquely and echoes the target back in
/// `connect`; it never resolves targets from its own configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetAnnouncement {
    pub port: u16,
    pub target: String,
}

/// Session-level frame carried inside a `forward` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionFrame {
    /// Open the target for a new session. Sent by the side that accepted
    /// the external TCP connection.
    #[serde(rename_all = "camelCase")]
    Connect {
        session_id: String,
        /// Target address, or empty when the receiver resolves it from
        /// its local forwarder definitions.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        target: String,
        /// Listen port the session was accepted on; keys the receiver's
        /// forwarder lookup when `target` is empty.
        #[serde(default, skip_serializing_if = "is_zero")]
        port: u16,
    },
    /// The target dial completed; the session is readable and writable.
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String },
    /// One chunk of the TCP byte stream, base64-encoded.
    #[serde(rename_all = "camelCase")]
    Data { session_id: String, data: String },
    /// Full close of the session by the sender.
    #[serde(rename_all = "camelCase")]
    Disconnect { session_id: String },
    /// The session failed; it terminates on both sides.
    #[serde(rename_all = "camelCase")]
    Error { session_id: String, error: String },
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl SessionFrame {
    /// Session this frame refers to.
    pub fn session_id(&self) -> &str {
        match self {
            SessionFrame::Connect { session_id, .. }
            | SessionFrame::Connected { session_id }
            | SessionFrame::Data { session_id, .. }
            | SessionFrame::Disconnect { session_id }
            | SessionFrame::Error { session_id, .. } => session_id,
        }
    }

    /// Wire name of the frame, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionFrame::Connect { .. } => "connect",
            SessionFrame::Connected { .. } => "connected",
            SessionFrame::Data { .. } => "data",
            SessionFrame::Disconnect { .. } => "disconnect",
            SessionFrame::Error { .. } => "error",
        }
    }

    /// Build a `data` frame from raw TCP bytes.
    pub fn data(session_id: impl Into<String>, payload: &[u8]) -> Self {
        SessionFrame::Data {
            session_id: session_id.into(),
            data: crate::codec::encode_payload(payload),
        }
    }

    pub fn disconnect(session_id: impl Into<String>) -> Self {
        SessionFrame::Disconnect {
            session_id: session_id.into(),
        }
    }

    pub fn error(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionFrame::Error {
            session_id: session_id.into(),
            error: reason.into(),
        }
    }
}

impl Envelope {
    /// Wrap a session frame in a `forward` envelope.
    pub fn forward(frame: SessionFrame) -> Self {
        Envelope::Forward { data: frame }
    }
}
