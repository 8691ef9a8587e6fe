//! JSON codec for control channel messages
//!
//! Distinguishes two failure classes: a message that is well-formed JSON
//! with an unrecognized `type` is tolerated (the channel logs and drops
//! it), while malformed or over-bound input is a protocol violation that
//! terminates the channel.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;

use crate::messages::Envelope;
use crate::MAX_MESSAGE_SIZE;

/// Codec errors. All of these are fatal to the control channel.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message of {len} bytes exceeds the {max} byte bound")]
    Oversize { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// Result of decoding one inbound message.
#[derive(Debug)]
pub enum Decoded {
    Message(Envelope),
    /// Well-formed JSON whose top-level or session frame `type` is not
    /// recognized. Carries the offending type name for the log line.
    Unknown(String),
}

const ENVELOPE_KINDS: &[&str] = &["register", "registered", "ping", "pong", "forward"];
const FRAME_KINDS: &[&str] = &["connect", "connected", "data", "disconnect", "error"];

/// Decode one inbound text message.
pub fn decode(text: &str) -> Result<Decoded, CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversize {
            len: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    match serde_json::from_str::<Envelope>(text) {
        Ok(msg) => Ok(Decoded::Message(msg)),
        Err(err) => probe_unknown(text).ok_or(CodecError::Malformed(err)),
    }
}

/// Encode one outbound message.
pub fn encode(msg: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Encode raw TCP bytes for transport inside a `data` frame.
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a `data` frame payload back to raw TCP bytes.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(data)?)
}

/// Check whether a parse failure was caused only by an unrecognized
/// `type` value, at the envelope or the session frame level.
fn probe_unknown(text: &str) -> Option<Decoded> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;

    if !ENVELOPE_KINDS.contains(&kind) {
        return Some(Decoded::Unknown(kind.to_string()));
    }

    if kind == "forward" {
        let inner = value.get("data")?.get("type")?.as_str()?;
        if !FRAME_KINDS.contains(&inner) {
            return Some(Decoded::Unknown(format!("forward/{inner}")));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SessionFrame;

    #[test]
    fn test_decode_known_message() {
        let decoded = decode(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(decoded, Decoded::Message(Envelope::Ping)));
    }

    #[test]
    fn test_decode_unknown_type_is_tolerated() {
        let decoded = decode(r#"{"type":"telemetry","id":"x"}"#).unwrap();
        match decoded {
            Decoded::Unknown(kind) => assert_eq!(kind, "telemetry"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_session_frame_is_tolerated() {
        let text = r#"{"type":"forward","data":{"type":"resize","sessionId":"s1"}}"#;
        match decode(text).unwrap() {
            Decoded::Unknown(kind) => assert_eq!(kind, "forward/resize"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_is_fatal() {
        assert!(matches!(
            decode("{not json"),
            Err(CodecError::Malformed(_))
        ));
        // Well-formed JSON without a string `type` is malformed too.
        assert!(matches!(
            decode(r#"{"type":42}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"id":"a-web"}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_oversize_is_fatal() {
        let padding = "x".repeat(MAX_MESSAGE_SIZE);
        let text = format!(r#"{{"type":"ping","pad":"{padding}"}}"#);
        assert!(matches!(decode(&text), Err(CodecError::Oversize { .. })));
    }

    #[test]
    fn test_payload_round_trip() {
        let buffers: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"GET / HTTP/1.0\r\n\r\n".to_vec(),
            (0u8..=255).collect(),
            vec![0u8; 32 * 1024],
        ];

        for buf in buffers {
            let encoded = encode_payload(&buf);
            assert_eq!(decode_payload(&encoded).unwrap(), buf);
        }
    }

    #[test]
    fn test_bad_payload_encoding() {
        assert!(matches!(
            decode_payload("not/base64!!"),
            Err(CodecError::Payload(_))
        ));
    }

    #[test]
    fn test_encode_decode_envelope_round_trip() {
        let msg = Envelope::forward(SessionFrame::data("a-web-8080-1", b"\x00\x01\x02"));
        let text = encode(&msg).unwrap();
        match decode(&text).unwrap() {
            Decoded::Message(parsed) => assert_eq!(parsed, msg),
            other => panic!("expected Message, got {other:?}"),
        }
    }
}
