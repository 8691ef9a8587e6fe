//! A single tunneled TCP session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use airlock_proto::{Envelope, SessionFrame};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{READ_CHUNK_SIZE, READ_IDLE_TIMEOUT, WRITE_QUEUE_CAPACITY, WRITE_TIMEOUT};

/// Errors scoped to a single session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} already exists")]
    DuplicateId(String),

    #[error("session closed")]
    Closed,

    #[error("session write queue full")]
    QueueFull,

    #[error("timed out waiting for session readiness")]
    ReadyTimeout,
}

/// One tunneled TCP session.
///
/// The session owns its local TCP endpoint, split into a write pump fed
/// by a bounded queue and a read pump that turns chunks into `data`
/// frames on the control channel. Closing is a one-shot: every path into
/// teardown funnels through [`Session::close`].
pub struct Session {
    id: String,
    agent_id: String,
    target: String,
    created_at: chrono::DateTime<chrono::Utc>,
    write_tx: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    closed: AtomicBool,
    ready: AtomicBool,
    ready_notify: Notify,
    peer_notified: AtomicBool,
    // Held until the readiness barrier lifts, then taken by the reader.
    read_half: Mutex<Option<OwnedReadHalf>>,
}

impl Session {
    /// Create a session around an established local TCP endpoint and
    /// start its write pump. The read pump is started separately with
    /// [`Session::start_reader`] so the owner can enforce a readiness
    /// barrier first.
    pub fn spawn(
        id: String,
        agent_id: String,
        target: String,
        stream: TcpStream,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let session = Arc::new(Self {
            id,
            agent_id,
            target,
            created_at: chrono::Utc::now(),
            write_tx,
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            peer_notified: AtomicBool::new(false),
            read_half: Mutex::new(Some(read_half)),
        });

        tokio::spawn(Self::write_pump(session.clone(), write_half, write_rx));

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves when the session has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Queue bytes for the local TCP endpoint. Never blocks: a full
    /// queue is a fatal backpressure condition surfaced to the caller.
    pub fn write(&self, data: Vec<u8>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        match self.write_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SessionError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    /// Whether the readiness barrier has lifted for this session.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Signal that the peer confirmed the target dial.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    /// Wait until the peer reports `connected`, the session closes, or
    /// the deadline passes.
    pub async fn await_ready(&self, deadline: Duration) -> Result<(), SessionError> {
        let until = tokio::time::Instant::now() + deadline;

        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            if self.ready.load(Ordering::SeqCst) {
                return Ok(());
            }

            if tokio::time::timeout_at(until, notified).await.is_err() {
                return Err(SessionError::ReadyTimeout);
            }
        }
    }

    /// Start the local read pump. A no-op if the reader already ran.
    pub fn start_reader(self: Arc<Self>) {
        let taken = self.read_half.lock().ok().and_then(|mut half| half.take());
        match taken {
            Some(read_half) => {
                tokio::spawn(Self::read_pump(self, read_half));
            }
            None => {
                tracing::warn!(session_id = %self.id, "Reader already started");
            }
        }
    }

    /// Record that the peer already knows the session is gone, so close
    /// will not echo a `disconnect` back.
    pub fn mark_peer_notified(&self) {
        self.peer_notified.store(true, Ordering::SeqCst);
    }

    /// Terminate the session with an `error` frame to the peer.
    pub fn close_with_error(&self, reason: &str) {
        if !self.peer_notified.swap(true, Ordering::SeqCst) {
            let frame = Envelope::forward(SessionFrame::error(&self.id, reason));
            if self.outbound.try_send(frame).is_err() {
                tracing::debug!(session_id = %self.id, "Error frame not delivered");
            }
        }
        self.close();
    }

    /// Idempotent one-shot teardown: cancel both pumps, release any
    /// readiness waiter, and best-effort notify the peer.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.cancel.cancel();
        self.ready_notify.notify_waiters();

        if !self.peer_notified.swap(true, Ordering::SeqCst) {
            let frame = Envelope::forward(SessionFrame::disconnect(&self.id));
            if self.outbound.try_send(frame).is_err() {
                tracing::debug!(session_id = %self.id, "Disconnect frame not delivered");
            }
        }

        tracing::debug!(session_id = %self.id, "Session closed");
    }

    /// Drains the write queue into the local TCP endpoint.
    async fn write_pump(
        session: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut write_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                received = write_rx.recv() => {
                    let Some(data) = received else { break };

                    match timeout(WRITE_TIMEOUT, write_half.write_all(&data)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::debug!(
                                session_id = %session.id,
                                error = %err,
                                "Local write failed"
                            );
                            session.close_with_error(&format!("local write failed: {err}"));
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(
                                session_id = %session.id,
                                "Local write deadline exceeded"
                            );
                            session.close_with_error("local write deadline exceeded");
                            break;
                        }
                    }
                }
            }
        }

        let _ = write_half.shutdown().await;
        tracing::trace!(session_id = %session.id, "Write pump ended");
    }

    /// Reads chunks from the local TCP endpoint and emits them as
    /// `data` frames. EOF and errors end the session; the close path
    /// emits the single `disconnect` toward the peer.
    async fn read_pump(session: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                read = timeout(READ_IDLE_TIMEOUT, read_half.read(&mut buf)) => {
                    match read {
                        Ok(Ok(0)) => {
                            tracing::debug!(session_id = %session.id, "Local endpoint closed");
                            break;
                        }
                        Ok(Ok(n)) => {
                            let frame = Envelope::forward(SessionFrame::data(&session.id, &buf[..n]));
                            if session.outbound.send(frame).await.is_err() {
                                tracing::debug!(
                                    session_id = %session.id,
                                    "Control channel gone, stopping reader"
                                );
                                session.mark_peer_notified();
                                break;
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(
                                session_id = %session.id,
                                error = %err,
                                "Local read failed"
                            );
                            break;
                        }
                        Err(_) => {
                            tracing::info!(
                                session_id = %session.id,
                                "Idle read deadline exceeded"
                            );
                            break;
                        }
                    }
                }
            }
        }

        session.close();
        tracing::trace!(session_id = %session.id, "Read pump ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        let (server, _) = server.unwrap();
        (client.unwrap(), server)
    }

    fn outbound() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (_peer, local) = socket_pair().await;
        let (tx, _rx) = outbound();
        let session = Session::spawn(
            "s1".to_string(),
            "a-web".to_string(),
            "webapp:80".to_string(),
            local,
            tx,
        );

        session.close();
        assert!(matches!(
            session.write(b"x".to_vec()),
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_one_disconnect() {
        let (_peer, local) = socket_pair().await;
        let (tx, mut rx) = outbound();
        let session = Session::spawn(
            "s1".to_string(),
            "a-web".to_string(),
            "webapp:80".to_string(),
            local,
            tx,
        );

        session.close();
        session.close();

        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame,
            Envelope::forward(SessionFrame::disconnect("s1"))
        );
        assert!(rx.try_recv().is_err(), "exactly one disconnect expected");
    }

    #[tokio::test]
    async fn test_close_after_peer_notified_is_silent() {
        let (_peer, local) = socket_pair().await;
        let (tx, mut rx) = outbound();
        let session = Session::spawn(
            "s1".to_string(),
            "a-web".to_string(),
            "webapp:80".to_string(),
            local,
            tx,
        );

        session.mark_peer_notified();
        session.close();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_queue_overflow() {
        let (_peer, local) = socket_pair().await;
        let (tx, _rx) = outbound();
        let session = Session::spawn(
            "s1".to_string(),
            "a-web".to_string(),
            "webapp:80".to_string(),
            local,
            tx,
        );

        // The single-threaded test runtime never yields to the write
        // pump inside this loop, so the queue must overflow after
        // exactly WRITE_QUEUE_CAPACITY accepted buffers.
        let mut accepted = 0usize;
        let overflowed = loop {
            match session.write(vec![0u8; 16]) {
                Ok(()) => accepted += 1,
                Err(SessionError::QueueFull) => break true,
                Err(other) => panic!("unexpected error: {other}"),
            }
            if accepted > WRITE_QUEUE_CAPACITY {
                break false;
            }
        };

        assert!(overflowed);
        assert_eq!(accepted, WRITE_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_await_ready_paths() {
        let (_peer, local) = socket_pair().await;
        let (tx, _rx) = outbound();
        let session = Session::spawn(
            "s1".to_string(),
            "a-web".to_string(),
            "webapp:80".to_string(),
            local,
            tx,
        );

        // Times out while nothing signals readiness.
        assert!(matches!(
            session.await_ready(Duration::from_millis(20)).await,
            Err(SessionError::ReadyTimeout)
        ));

        // Resolves immediately once marked ready.
        session.mark_ready();
        assert!(session.await_ready(Duration::from_millis(20)).await.is_ok());

        // A closed session reports Closed instead of readiness.
        session.close();
        assert!(matches!(
            session.await_ready(Duration::from_millis(20)).await,
            Err(SessionError::Closed)
        ));
    }
}
