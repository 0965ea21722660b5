use std::sync::Arc;

use async_trait::async_trait;

use crate::backhaul::{
    telemetry::{self, Side},
    tunnel::{
        frame::{Action, Frame},
        mux::{self, Binding, FrameHandler, Multiplexer, TunnelError},
        registry::Registry,
        session::{CloseReason, Session},
        transport::BoxedStream,
    },
};

/// Server end of the tunnel: owns the registry of public connections and the
/// single bound control stream.
#[derive(Clone)]
pub struct TunnelService {
    mux: Arc<Multiplexer>,
}

impl TunnelService {
    pub fn new(frame_queue: usize) -> Self {
        Self {
            mux: Multiplexer::new(Side::Server, frame_queue),
        }
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.mux.registry()
    }

    pub fn is_bound(&self) -> bool {
        self.mux.is_bound()
    }

    /// Announces `session` to the bound client with an `OPEN` frame and
    /// starts forwarding its outbound bytes as `DATA`.
    ///
    /// Fails with `NotBound` when no client is attached and with
    /// `DuplicateConnection` when the id is still live.
    pub async fn register_connection(&self, session: &Arc<Session>) -> Result<(), TunnelError> {
        let sink = self.mux.sink().ok_or(TunnelError::NotBound)?;
        self.mux.registry().register(session.clone())?;

        let Some(outbound) = session.take_outbound() else {
            self.mux.registry().remove(session);
            return Err(TunnelError::DuplicateConnection(session.id().clone()));
        };

        if let Err(err) = sink.send(Frame::open(session.id().clone())).await {
            self.mux.registry().remove(session);
            session.close(CloseReason::StreamLost);
            session.finish();
            return Err(err);
        }

        telemetry::session_opened(Side::Server);
        mux::spawn_forwarder(
            session.clone(),
            outbound,
            sink,
            self.mux.registry().clone(),
            Side::Server,
        );
        tracing::debug!(cid = %session.id(), "tunnel: connection registered");
        Ok(())
    }

    /// Claims the bind slot without attaching a stream yet, so the caller can
    /// answer the bind handshake first.
    pub fn try_bind(&self) -> Result<Binding, TunnelError> {
        let res = self.mux.try_bind();
        telemetry::bind_result(
            Side::Server,
            if res.is_ok() { "accepted" } else { "already_bound" },
        );
        res
    }

    pub async fn serve_binding(
        &self,
        binding: Binding,
        stream: BoxedStream,
    ) -> Result<(), TunnelError> {
        binding.run(stream, self).await
    }

    /// Binds `stream` and serves it until it ends. Returns `AlreadyBound`
    /// immediately when another stream holds the slot.
    pub async fn bind_stream(&self, stream: BoxedStream) -> Result<(), TunnelError> {
        let binding = self.try_bind()?;
        self.serve_binding(binding, stream).await
    }
}

#[async_trait]
impl FrameHandler for TunnelService {
    async fn on_frame(&self, frame: Frame) {
        match frame.action {
            Action::Open => {
                tracing::warn!(cid = %frame.id, "tunnel: ignoring OPEN from client");
            }
            Action::Data => match self.mux.registry().lookup(&frame.id) {
                Some(session) => {
                    let n = frame.payload.len() as u64;
                    if session.deliver(frame.payload) {
                        telemetry::bytes(Side::Server, "down", n);
                    } else {
                        telemetry::frame_dropped(Side::Server);
                    }
                }
                None => {
                    tracing::debug!(cid = %frame.id, "tunnel: DATA for unknown connection dropped");
                    telemetry::frame_dropped(Side::Server);
                }
            },
            Action::Close => {
                if let Some(session) = self.mux.registry().remove_id(&frame.id) {
                    session.close(CloseReason::Remote);
                    tracing::debug!(cid = %frame.id, "tunnel: client closed connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;
    use crate::backhaul::tunnel::{
        frame::ConnectionId,
        protocol,
        session::{SessionOptions, SessionState},
    };

    #[tokio::test]
    async fn register_without_client_is_not_bound() {
        let svc = TunnelService::new(8);
        let (s, _local) = Session::new(ConnectionId::generate(), SessionOptions::default());
        assert!(matches!(
            svc.register_connection(&s).await,
            Err(TunnelError::NotBound)
        ));
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn second_bind_fails_without_disturbing_the_first() {
        let svc = TunnelService::new(8);
        let (ours, mut theirs) = duplex(64 * 1024);
        let serving = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.bind_stream(Box::new(ours)).await })
        };
        while !svc.is_bound() {
            tokio::task::yield_now().await;
        }

        let (s, _local) = Session::new(ConnectionId::from("keep"), SessionOptions::default());
        svc.register_connection(&s).await.unwrap();
        let open = protocol::read_frame(&mut theirs).await.unwrap().unwrap();
        assert_eq!(open.action, Action::Open);

        let (other, _peer) = duplex(1024);
        assert!(matches!(
            svc.bind_stream(Box::new(other)).await,
            Err(TunnelError::AlreadyBound)
        ));
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(svc.registry().len(), 1);

        drop(theirs);
        serving.await.unwrap().unwrap();
        assert_eq!(s.close_reason(), Some(CloseReason::StreamLost));
    }

    #[tokio::test]
    async fn data_and_close_route_by_id() {
        let svc = TunnelService::new(8);
        let (ours, mut theirs) = duplex(64 * 1024);
        let serving = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.bind_stream(Box::new(ours)).await })
        };
        while !svc.is_bound() {
            tokio::task::yield_now().await;
        }

        let (a, mut la) = Session::new(ConnectionId::from("a"), SessionOptions::default());
        let (b, mut lb) = Session::new(ConnectionId::from("b"), SessionOptions::default());
        svc.register_connection(&a).await.unwrap();
        svc.register_connection(&b).await.unwrap();

        for f in [
            Frame::data(ConnectionId::from("b"), Bytes::from_static(b"BBB")),
            Frame::data(ConnectionId::from("zzz"), Bytes::from_static(b"lost")),
            Frame::data(ConnectionId::from("a"), Bytes::from_static(b"AAA")),
            Frame::close(ConnectionId::from("a")),
        ] {
            protocol::write_frame(&mut theirs, &f).await.unwrap();
        }

        assert_eq!(la.inbound.recv().await.unwrap(), Bytes::from_static(b"AAA"));
        assert_eq!(lb.inbound.recv().await.unwrap(), Bytes::from_static(b"BBB"));
        tokio::time::timeout(Duration::from_secs(1), a.closing())
            .await
            .unwrap();
        assert_eq!(a.close_reason(), Some(CloseReason::Remote));
        assert!(svc.registry().lookup(&ConnectionId::from("a")).is_none());
        assert!(!b.is_closing());

        drop(theirs);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stalled_connection_does_not_hold_up_the_others() {
        let svc = TunnelService::new(8);
        let (ours, mut theirs) = duplex(64 * 1024);
        let serving = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.bind_stream(Box::new(ours)).await })
        };
        while !svc.is_bound() {
            tokio::task::yield_now().await;
        }

        let tight = SessionOptions {
            queue_capacity: 1,
            ..SessionOptions::default()
        };
        let (slow, _never_drained) = Session::new(ConnectionId::from("slow"), tight);
        let (fast, mut lf) = Session::new(ConnectionId::from("fast"), tight);
        svc.register_connection(&slow).await.unwrap();
        svc.register_connection(&fast).await.unwrap();

        for f in [
            Frame::data(ConnectionId::from("slow"), Bytes::from_static(b"1")),
            Frame::data(ConnectionId::from("slow"), Bytes::from_static(b"2")),
            Frame::data(ConnectionId::from("slow"), Bytes::from_static(b"3")),
            Frame::data(ConnectionId::from("fast"), Bytes::from_static(b"F")),
        ] {
            protocol::write_frame(&mut theirs, &f).await.unwrap();
        }

        let got = tokio::time::timeout(Duration::from_secs(2), lf.inbound.recv())
            .await
            .expect("fast connection starved by the slow one");
        assert_eq!(got.unwrap(), Bytes::from_static(b"F"));
        assert!(!slow.is_closing());
        assert!(!fast.is_closing());

        drop(theirs);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbound_overflow_closes_the_connection_and_tells_the_client() {
        let svc = TunnelService::new(8);
        let (ours, mut theirs) = duplex(64 * 1024);
        let serving = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.bind_stream(Box::new(ours)).await })
        };
        while !svc.is_bound() {
            tokio::task::yield_now().await;
        }

        let opts = SessionOptions {
            queue_capacity: 1,
            inbound_limit: 4,
        };
        let (s, local) = Session::new(ConnectionId::from("s"), opts);
        svc.register_connection(&s).await.unwrap();
        let open = protocol::read_frame(&mut theirs).await.unwrap().unwrap();
        assert_eq!(open.action, Action::Open);

        // Stand-in for the socket reader: gives up its queue once the
        // session starts closing.
        let reader = {
            let s = s.clone();
            let outbound = local.outbound;
            tokio::spawn(async move {
                s.closing().await;
                drop(outbound);
            })
        };

        for f in [
            Frame::data(ConnectionId::from("s"), Bytes::from_static(b"abc")),
            Frame::data(ConnectionId::from("s"), Bytes::from_static(b"de")),
        ] {
            protocol::write_frame(&mut theirs, &f).await.unwrap();
        }

        let close = tokio::time::timeout(Duration::from_secs(2), protocol::read_frame(&mut theirs))
            .await
            .expect("close frame")
            .unwrap()
            .unwrap();
        assert_eq!(close.action, Action::Close);
        assert_eq!(close.id, ConnectionId::from("s"));
        assert_eq!(s.close_reason(), Some(CloseReason::InboundOverflow));
        reader.await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !svc.registry().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        drop(theirs);
        serving.await.unwrap().unwrap();
    }
}
