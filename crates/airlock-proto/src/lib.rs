//! Wire protocol for the airlock control channel
//!
//! The control channel is a duplex, message-oriented link carrying JSON
//! text frames. Top-level [`Envelope`] messages handle registration and
//! liveness; `forward` envelopes wrap per-session [`SessionFrame`]s that
//! multiplex TCP byte streams over the channel.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, decode_payload, encode_payload, CodecError, Decoded};
pub use messages::{Envelope, SessionFrame, TargetAnnouncement};

/// HTTP upgrade path for the control channel.
pub const TUNNEL_PATH: &str = "/tunnel";

/// Maximum size of a single control message (1 MiB).
///
/// A message exceeding this bound is a protocol violation and terminates
/// the channel.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Cadence of both transport-level and application-level pings.
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// A channel with no inbound frames for this long has missed its pong
/// deadline and is torn down.
pub const PONG_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Capacity of the per-channel outbound message queue.
pub const SEND_QUEUE_CAPACITY: usize = 512;
