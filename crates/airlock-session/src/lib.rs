//! Session lifecycle for the airlock tunnel
//!
//! A session is the end-to-end state for one external TCP connection
//! multiplexed over the control channel. Each side owns the sessions
//! whose local TCP endpoint it holds: the relay owns sessions for
//! connections accepted on its port listeners, the agent owns sessions
//! for the targets it dialed. The [`SessionManager`] indexes live
//! sessions and guarantees idempotent teardown.

mod manager;
mod session;

pub use manager::{SessionInfo, SessionManager};
pub use session::{Session, SessionError};

use std::time::Duration;

/// Capacity of the per-session write queue.
pub const WRITE_QUEUE_CAPACITY: usize = 256;

/// Chunk size for local TCP reads.
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Idle deadline renewed per local read.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Deadline for one local write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
