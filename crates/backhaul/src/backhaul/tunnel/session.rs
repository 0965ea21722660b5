use std::{
    fmt,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{
    mpsc::{self, error::TryRecvError},
    watch,
};

use crate::backhaul::tunnel::frame::ConnectionId;

/// Queue sizing for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Chunks the local socket reader may queue ahead of the control stream.
    pub queue_capacity: usize,
    /// Bytes from the control stream that may wait for the local socket.
    /// Exceeding it closes the session with `InboundOverflow`.
    pub inbound_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            inbound_limit: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Open,
    Closing,
    Closed,
}

/// Why a session left the `Open` state. The first trigger wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Local socket reached EOF.
    LocalEof,
    /// Local socket read/write failed.
    LocalError,
    /// Local socket idle or write deadline expired.
    Timeout,
    /// Target could not be dialed (client side only).
    DialFailed,
    /// The peer sent `CLOSE`, or the owner asked the session to stop.
    Remote,
    /// The control stream went away.
    StreamLost,
    /// The local socket fell too far behind the control stream.
    InboundOverflow,
}

impl CloseReason {
    /// Whether the peer still holds a matching session that must be told.
    pub fn notifies_peer(self) -> bool {
        matches!(
            self,
            CloseReason::LocalEof
                | CloseReason::LocalError
                | CloseReason::Timeout
                | CloseReason::DialFailed
                | CloseReason::InboundOverflow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::LocalEof => "local_eof",
            CloseReason::LocalError => "local_error",
            CloseReason::Timeout => "timeout",
            CloseReason::DialFailed => "dial_failed",
            CloseReason::Remote => "remote",
            CloseReason::StreamLost => "stream_lost",
            CloseReason::InboundOverflow => "inbound_overflow",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection state shared between the local socket pumps and the
/// multiplexer.
///
/// The inbound queue carries bytes from the control stream to the local
/// socket; the outbound queue carries bytes read from the local socket toward
/// the control stream. Each direction has exactly one producer and one
/// consumer.
///
/// The inbound queue is bounded in bytes rather than slots, and pushing onto
/// it never waits: it is fed by the one task reading the shared control
/// stream.
pub struct Session {
    id: ConnectionId,
    state: watch::Sender<SessionState>,
    reason: OnceLock<CloseReason>,
    inbound: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    inbound_limit: usize,
    outbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    started_at_unix_ms: u64,
}

/// The socket-facing ends of a session's queues, owned by the pumps.
#[derive(Debug)]
pub struct LocalEnd {
    pub inbound: InboundQueue,
    pub outbound: mpsc::Sender<Bytes>,
}

/// Consumer side of a session's inbound queue. Taking a chunk out releases
/// its bytes from the session's inbound budget.
#[derive(Debug)]
pub struct InboundQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl InboundQueue {
    pub async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await?;
        self.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
        Some(chunk)
    }

    pub fn try_recv(&mut self) -> Result<Bytes, TryRecvError> {
        let chunk = self.rx.try_recv()?;
        self.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
        Ok(chunk)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: ConnectionId, opts: SessionOptions) -> (Arc<Self>, LocalEnd) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(opts.queue_capacity.max(1));
        let buffered = Arc::new(AtomicUsize::new(0));
        let (state, _) = watch::channel(SessionState::Created);

        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let session = Arc::new(Self {
            id,
            state,
            reason: OnceLock::new(),
            inbound: in_tx,
            buffered: buffered.clone(),
            inbound_limit: opts.inbound_limit.max(1),
            outbound: Mutex::new(Some(out_rx)),
            started_at_unix_ms,
        });
        let local = LocalEnd {
            inbound: InboundQueue {
                rx: in_rx,
                buffered,
            },
            outbound: out_tx,
        };
        (session, local)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn started_at_unix_ms(&self) -> u64 {
        self.started_at_unix_ms
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// `Created -> Open`. Returns false if the session already moved on.
    pub fn mark_open(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == SessionState::Created {
                *s = SessionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Starts teardown. Safe to call any number of times from any task; only
    /// the first call records its reason and returns true.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|s| {
            if *s < SessionState::Closing {
                let _ = self.reason.set(reason);
                *s = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Terminal transition. Implies `close` if nobody closed the session yet.
    pub fn finish(&self) {
        self.state.send_if_modified(|s| {
            if *s == SessionState::Closed {
                return false;
            }
            if *s < SessionState::Closing {
                let _ = self.reason.set(CloseReason::Remote);
            }
            *s = SessionState::Closed;
            true
        });
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= SessionState::Closing
    }

    /// Resolves once the session reaches `Closing` (or `Closed`).
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s >= SessionState::Closing).await;
    }

    /// Pushes bytes from the control stream toward the local socket without
    /// waiting.
    ///
    /// Returns false when the bytes were refused: the session is closing, its
    /// local end is gone, or they would push the bytes waiting for the local
    /// socket past the inbound limit. The last case closes the session with
    /// `InboundOverflow`, so the peer is told instead of losing bytes
    /// silently. Empty payloads are accepted and discarded.
    pub fn deliver(&self, data: Bytes) -> bool {
        if self.is_closing() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        let n = data.len();
        let waiting = self.buffered.fetch_add(n, Ordering::AcqRel) + n;
        if waiting > self.inbound_limit {
            self.buffered.fetch_sub(n, Ordering::AcqRel);
            if self.close(CloseReason::InboundOverflow) {
                tracing::warn!(
                    cid = %self.id,
                    waiting,
                    limit = self.inbound_limit,
                    "tunnel: local socket too slow, closing connection"
                );
            }
            return false;
        }
        if self.inbound.send(data).is_err() {
            self.buffered.fetch_sub(n, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Hands the outbound queue's consumer to the multiplexer. Only the first
    /// caller gets it.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn session() -> (Arc<Session>, LocalEnd) {
        Session::new(ConnectionId::generate(), SessionOptions::default())
    }

    #[test]
    fn walks_the_lifecycle_forward_only() {
        let (s, _local) = session();
        assert_eq!(s.state(), SessionState::Created);

        assert!(s.mark_open());
        assert!(!s.mark_open());
        assert_eq!(s.state(), SessionState::Open);

        assert!(s.close(CloseReason::LocalEof));
        assert_eq!(s.state(), SessionState::Closing);
        assert!(!s.mark_open());

        s.finish();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.close(CloseReason::Remote));
        assert_eq!(s.close_reason(), Some(CloseReason::LocalEof));
    }

    #[test]
    fn finish_without_close_records_remote() {
        let (s, _local) = session();
        s.finish();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.close_reason(), Some(CloseReason::Remote));
    }

    #[test]
    fn repeated_close_is_a_no_op() {
        let (s, _local) = session();
        assert!(s.close(CloseReason::Remote));
        assert!(!s.close(CloseReason::Remote));
        assert!(!s.close(CloseReason::LocalError));
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(s.close_reason(), Some(CloseReason::Remote));
    }

    #[tokio::test]
    async fn concurrent_close_has_exactly_one_winner() {
        for _ in 0..64 {
            let (s, _local) = session();
            let a = {
                let s = s.clone();
                tokio::spawn(async move { s.close(CloseReason::Remote) })
            };
            let b = {
                let s = s.clone();
                tokio::spawn(async move { s.close(CloseReason::LocalEof) })
            };
            let (a, b) = (a.await.unwrap(), b.await.unwrap());
            assert!(a ^ b, "exactly one close must win");

            let reason = s.close_reason().unwrap();
            if a {
                assert_eq!(reason, CloseReason::Remote);
            } else {
                assert_eq!(reason, CloseReason::LocalEof);
            }
        }
    }

    #[tokio::test]
    async fn closing_wakes_waiters() {
        let (s, _local) = session();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.closing().await })
        };
        tokio::task::yield_now().await;
        s.close(CloseReason::StreamLost);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn deliver_reaches_local_end_until_closing() {
        let (s, mut local) = session();
        assert!(s.deliver(Bytes::from_static(b"abc")));
        assert!(s.deliver(Bytes::new()));
        assert_eq!(local.inbound.recv().await.unwrap(), Bytes::from_static(b"abc"));

        s.close(CloseReason::Remote);
        assert!(!s.deliver(Bytes::from_static(b"late")));
        assert!(local.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliver_past_inbound_limit_closes_with_overflow() {
        let opts = SessionOptions {
            queue_capacity: 1,
            inbound_limit: 8,
        };
        let (s, mut local) = Session::new(ConnectionId::generate(), opts);
        assert!(s.deliver(Bytes::from_static(b"1234")));
        assert!(s.deliver(Bytes::from_static(b"5678")));
        assert!(!s.is_closing());

        assert!(!s.deliver(Bytes::from_static(b"9")));
        assert_eq!(s.close_reason(), Some(CloseReason::InboundOverflow));
        assert!(CloseReason::InboundOverflow.notifies_peer());

        // Bytes accepted before the overflow are still there to flush.
        assert_eq!(local.inbound.recv().await.unwrap(), Bytes::from_static(b"1234"));
        assert_eq!(local.inbound.recv().await.unwrap(), Bytes::from_static(b"5678"));
        assert!(local.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn draining_the_local_end_frees_inbound_budget() {
        let opts = SessionOptions {
            queue_capacity: 1,
            inbound_limit: 4,
        };
        let (s, mut local) = Session::new(ConnectionId::generate(), opts);
        for _ in 0..16 {
            assert!(s.deliver(Bytes::from_static(b"abcd")));
            assert_eq!(local.inbound.recv().await.unwrap(), Bytes::from_static(b"abcd"));
        }
        assert!(!s.is_closing());
    }

    #[test]
    fn outbound_is_handed_out_once() {
        let (s, _local) = session();
        assert!(s.take_outbound().is_some());
        assert!(s.take_outbound().is_none());
    }
}
