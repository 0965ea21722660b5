use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use crate::backhaul::{
    telemetry::{self, Side},
    tunnel::{
        frame::{ConnectionId, Frame},
        protocol::{self, ProtocolError},
        registry::{Registry, RegistryError},
        session::{CloseReason, Session},
        transport::BoxedStream,
    },
};

/// Upper bound on bytes coalesced into one write to the control stream.
const MAX_BATCH_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("a control stream is already bound")]
    AlreadyBound,
    #[error("no control stream is bound")]
    NotBound,
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("control stream closed")]
    StreamClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for TunnelError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Duplicate(id) => TunnelError::DuplicateConnection(id),
        }
    }
}

/// Producer handle onto the single outbound frame queue of a bound stream.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::StreamClosed)
    }
}

/// Receives every frame read off a bound control stream, in stream order.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, frame: Frame);
}

struct Bound {
    generation: u64,
    sink: FrameSink,
}

/// Bind slot, session registry and outbound frame queue shared by both tunnel
/// ends.
///
/// At most one control stream is bound at a time. All session traffic for the
/// bound stream is funneled through one frame queue drained by one writer task.
pub struct Multiplexer {
    side: Side,
    registry: Arc<Registry>,
    slot: Mutex<Option<Bound>>,
    generation: AtomicU64,
    frame_queue: usize,
}

impl Multiplexer {
    pub fn new(side: Side, frame_queue: usize) -> Arc<Self> {
        Arc::new(Self {
            side,
            registry: Arc::new(Registry::new()),
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
            frame_queue: frame_queue.max(1),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn slot(&self) -> MutexGuard<'_, Option<Bound>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the bind slot. Fails with `AlreadyBound` while another stream
    /// holds it; the existing binding is left untouched.
    pub fn try_bind(self: &Arc<Self>) -> Result<Binding, TunnelError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(TunnelError::AlreadyBound);
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.frame_queue);
        *slot = Some(Bound {
            generation,
            sink: FrameSink { tx },
        });
        Ok(Binding {
            mux: self.clone(),
            generation,
            frames: Some(rx),
        })
    }

    /// Sink of the currently bound stream, if any.
    pub fn sink(&self) -> Option<FrameSink> {
        self.slot().as_ref().map(|b| b.sink.clone())
    }

    pub fn is_bound(&self) -> bool {
        self.slot().is_some()
    }

    pub fn bound_generation(&self) -> Option<u64> {
        self.slot().as_ref().map(|b| b.generation)
    }

    /// Cascades a lost stream to every registered session, then frees the
    /// slot so a new stream may bind.
    fn teardown(&self, generation: u64) {
        if self.bound_generation() != Some(generation) {
            return;
        }
        let sessions = self.registry.drain();
        let n = sessions.len();
        for s in sessions {
            s.close(CloseReason::StreamLost);
        }
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|b| b.generation == generation) {
            *slot = None;
        }
        drop(slot);
        tracing::info!(
            side = self.side.as_str(),
            generation,
            sessions = n,
            "tunnel: control stream unbound"
        );
    }
}

/// Exclusive claim on the bind slot. Dropping it unbinds.
pub struct Binding {
    mux: Arc<Multiplexer>,
    generation: u64,
    frames: Option<mpsc::Receiver<Frame>>,
}

impl Binding {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drives `stream` until it ends: one spawned task writes queued frames,
    /// the calling task reads frames and hands them to `handler`. Either side
    /// failing ends both. A clean EOF from the peer returns `Ok(())`.
    pub async fn run(
        mut self,
        stream: BoxedStream,
        handler: &dyn FrameHandler,
    ) -> Result<(), TunnelError> {
        let frames = self.frames.take().ok_or(TunnelError::StreamClosed)?;
        let (rd, wr) = tokio::io::split(stream);
        let mut writer = WriterTask(tokio::spawn(write_loop(wr, frames)));

        tracing::info!(
            side = self.mux.side.as_str(),
            generation = self.generation,
            "tunnel: control stream bound"
        );

        let mut writer_done = false;
        let res = tokio::select! {
            r = read_loop(BufReader::new(rd), handler) => r,
            r = &mut writer.0 => {
                writer_done = true;
                match r {
                    Ok(r) => r,
                    Err(err) => Err(TunnelError::Io(std::io::Error::other(err))),
                }
            }
        };

        if !writer_done {
            writer.0.abort();
            let _ = (&mut writer.0).await;
        }
        // `self` drops here and tears the binding down.
        res
    }
}

/// Aborts the stream writer when the binding stops, including when the
/// future driving `Binding::run` is dropped.
struct WriterTask(tokio::task::JoinHandle<Result<(), TunnelError>>);

impl Drop for WriterTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.frames.take();
        self.mux.teardown(self.generation);
    }
}

async fn read_loop<R>(mut rd: R, handler: &dyn FrameHandler) -> Result<(), TunnelError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    while let Some(frame) = protocol::read_frame(&mut rd).await? {
        handler.on_frame(frame).await;
    }
    Ok(())
}

async fn write_loop<W>(mut wr: W, mut frames: mpsc::Receiver<Frame>) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    while let Some(frame) = frames.recv().await {
        buf.clear();
        protocol::encode_frame(&frame, &mut buf)?;
        while buf.len() < MAX_BATCH_BYTES {
            match frames.try_recv() {
                Ok(frame) => protocol::encode_frame(&frame, &mut buf)?,
                Err(_) => break,
            }
        }
        wr.write_all(&buf).await?;
        wr.flush().await?;
    }
    let _ = wr.shutdown().await;
    Ok(())
}

/// Moves one session's outbound bytes onto the frame queue as `DATA`, then
/// retires the session: a `CLOSE` goes to the peer when it still holds a
/// matching session, the registry entry is dropped and the session finishes.
///
/// Runs until every producer of `outbound` is gone, so bytes read before a
/// local EOF still reach the peer ahead of the `CLOSE`.
pub fn spawn_forwarder(
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Bytes>,
    sink: FrameSink,
    registry: Arc<Registry>,
    side: Side,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let id = session.id().clone();
        while let Some(chunk) = outbound.recv().await {
            if session.close_reason().is_some_and(|r| !r.notifies_peer()) {
                break;
            }
            let n = chunk.len() as u64;
            if sink.send(Frame::data(id.clone(), chunk)).await.is_err() {
                session.close(CloseReason::StreamLost);
                break;
            }
            telemetry::bytes(side, "up", n);
        }
        drop(outbound);

        session.close(CloseReason::LocalEof);
        let reason = session.close_reason().unwrap_or(CloseReason::LocalEof);
        if reason.notifies_peer() && sink.send(Frame::close(id.clone())).await.is_err() {
            tracing::debug!(cid = %id, "tunnel: stream gone before close frame");
        }

        registry.remove(&session);
        session.finish();
        telemetry::session_closed(side, reason);
        tracing::debug!(side = side.as_str(), cid = %id, reason = %reason, "tunnel: session closed");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;
    use crate::backhaul::tunnel::{
        frame::Action,
        session::{SessionOptions, SessionState},
    };

    struct Collect(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl FrameHandler for Collect {
        async fn on_frame(&self, frame: Frame) {
            let _ = self.0.send(frame);
        }
    }

    #[test]
    fn second_bind_is_rejected_until_the_first_drops() {
        let mux = Multiplexer::new(Side::Server, 8);
        let first = mux.try_bind().unwrap();
        assert!(matches!(mux.try_bind(), Err(TunnelError::AlreadyBound)));
        assert!(mux.is_bound());
        assert_eq!(mux.bound_generation(), Some(first.generation()));

        drop(first);
        assert!(!mux.is_bound());
        let second = mux.try_bind().unwrap();
        assert_eq!(second.generation(), 2);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let mux = Multiplexer::new(Side::Server, 8);
        let binding = mux.try_bind().unwrap();
        let sink = mux.sink().unwrap();

        let (ours, mut theirs) = duplex(64 * 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(async move { binding.run(Box::new(ours), &Collect(tx)).await });

        sink.send(Frame::open(ConnectionId::from("a"))).await.unwrap();
        sink.send(Frame::data(ConnectionId::from("a"), Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let f1 = protocol::read_frame(&mut theirs).await.unwrap().unwrap();
        let f2 = protocol::read_frame(&mut theirs).await.unwrap().unwrap();
        assert_eq!(f1.action, Action::Open);
        assert_eq!(f2.payload, Bytes::from_static(b"hi"));

        protocol::write_frame(&mut theirs, &Frame::close(ConnectionId::from("b")))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.action, Action::Close);
        assert_eq!(got.id.as_str(), "b");

        drop(theirs);
        run.await.unwrap().unwrap();
        assert!(!mux.is_bound());
        assert!(sink.send(Frame::close(ConnectionId::from("a"))).await.is_err());
    }

    #[tokio::test]
    async fn malformed_stream_unbinds_and_closes_sessions() {
        let mux = Multiplexer::new(Side::Client, 8);
        let binding = mux.try_bind().unwrap();
        let (s, _local) = Session::new(ConnectionId::from("x"), SessionOptions::default());
        mux.registry().register(s.clone()).unwrap();

        let (ours, mut theirs) = duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(async move { binding.run(Box::new(ours), &Collect(tx)).await });

        theirs.write_all(&[0xEE]).await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run returned")
            .unwrap();
        assert!(matches!(
            res,
            Err(TunnelError::Protocol(ProtocolError::MalformedFrame(0xEE)))
        ));
        assert!(!mux.is_bound());
        assert!(mux.registry().is_empty());
        assert_eq!(s.close_reason(), Some(CloseReason::StreamLost));
    }

    #[tokio::test]
    async fn forwarder_sends_data_then_close_on_local_eof() {
        let mux = Multiplexer::new(Side::Server, 8);
        let mut binding = mux.try_bind().unwrap();
        let mut frames = binding.frames.take().unwrap();
        let sink = mux.sink().unwrap();

        let (s, local) = Session::new(ConnectionId::from("f"), SessionOptions::default());
        mux.registry().register(s.clone()).unwrap();
        let outbound = s.take_outbound().unwrap();
        let fwd = spawn_forwarder(s.clone(), outbound, sink, mux.registry().clone(), Side::Server);

        local.outbound.send(Bytes::from_static(b"one")).await.unwrap();
        local.outbound.send(Bytes::from_static(b"two")).await.unwrap();
        s.close(CloseReason::LocalEof);
        drop(local);
        fwd.await.unwrap();

        let a = frames.recv().await.unwrap();
        let b = frames.recv().await.unwrap();
        let c = frames.recv().await.unwrap();
        assert_eq!((a.action, a.payload.as_ref()), (Action::Data, &b"one"[..]));
        assert_eq!((b.action, b.payload.as_ref()), (Action::Data, &b"two"[..]));
        assert_eq!(c.action, Action::Close);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(mux.registry().is_empty());
    }

    #[tokio::test]
    async fn forwarder_stays_quiet_after_remote_close() {
        let mux = Multiplexer::new(Side::Client, 8);
        let mut binding = mux.try_bind().unwrap();
        let mut frames = binding.frames.take().unwrap();
        let sink = mux.sink().unwrap();

        let (s, local) = Session::new(ConnectionId::from("r"), SessionOptions::default());
        let outbound = s.take_outbound().unwrap();
        let fwd = spawn_forwarder(s.clone(), outbound, sink, mux.registry().clone(), Side::Client);

        s.close(CloseReason::Remote);
        local.outbound.send(Bytes::from_static(b"late")).await.unwrap();
        drop(local);
        fwd.await.unwrap();

        drop(binding);
        assert!(frames.recv().await.is_none());
        assert_eq!(s.state(), SessionState::Closed);
    }
}
