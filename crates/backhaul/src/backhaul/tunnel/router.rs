use std::sync::Arc;

use async_trait::async_trait;

use crate::backhaul::{
    telemetry::{self, Side},
    tunnel::{
        frame::{Action, ConnectionId, Frame},
        handler::{ConnectionHandler, HandlerOptions},
        mux::{self, Binding, FrameHandler, Multiplexer, TunnelError},
        registry::Registry,
        session::{CloseReason, Session, SessionOptions},
        transport::BoxedStream,
    },
};

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub session: SessionOptions,
    pub frame_queue: usize,
    pub handler: HandlerOptions,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            frame_queue: 256,
            handler: HandlerOptions::default(),
        }
    }
}

/// Client end of the tunnel. Turns `OPEN` frames into connection handlers
/// dialing the target and routes `DATA`/`CLOSE` to them by connection id.
///
/// The registry outlives any single control stream; every reconnect binds a
/// fresh stream into the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    target: Arc<str>,
    mux: Arc<Multiplexer>,
    opts: RouterOptions,
}

impl Router {
    pub fn new(target: impl Into<Arc<str>>, opts: RouterOptions) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                target: target.into(),
                mux: Multiplexer::new(Side::Client, opts.frame_queue),
                opts,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.inner.mux
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.inner.mux.registry()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.mux.is_bound()
    }

    pub fn try_bind(&self) -> Result<Binding, TunnelError> {
        let res = self.inner.mux.try_bind();
        telemetry::bind_result(
            Side::Client,
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

    /// Binds `stream` and serves it until it ends.
    pub async fn bind_stream(&self, stream: BoxedStream) -> Result<(), TunnelError> {
        let binding = self.try_bind()?;
        self.serve_binding(binding, stream).await
    }

    fn open(&self, id: ConnectionId) {
        let Some(sink) = self.inner.mux.sink() else {
            tracing::debug!(cid = %id, "tunnel: OPEN after unbind ignored");
            return;
        };

        let (session, local) = Session::new(id.clone(), self.inner.opts.session);
        if let Err(err) = self.registry().register(session.clone()) {
            tracing::warn!(cid = %id, err = %err, "tunnel: duplicate OPEN ignored");
            return;
        }
        let Some(outbound) = session.take_outbound() else {
            return;
        };

        telemetry::session_opened(Side::Client);
        mux::spawn_forwarder(
            session.clone(),
            outbound,
            sink,
            self.registry().clone(),
            Side::Client,
        );

        let handler = ConnectionHandler::new(
            self.inner.target.clone(),
            session,
            self.inner.opts.handler.clone(),
        );
        tokio::spawn(async move { handler.run(local).await });
    }
}

#[async_trait]
impl FrameHandler for Router {
    async fn on_frame(&self, frame: Frame) {
        match frame.action {
            Action::Open => self.open(frame.id),
            Action::Data => match self.registry().lookup(&frame.id) {
                Some(session) => {
                    let n = frame.payload.len() as u64;
                    if session.deliver(frame.payload) {
                        telemetry::bytes(Side::Client, "down", n);
                    } else {
                        telemetry::frame_dropped(Side::Client);
                    }
                }
                None => {
                    tracing::debug!(cid = %frame.id, "tunnel: DATA for unknown connection dropped");
                    telemetry::frame_dropped(Side::Client);
                }
            },
            Action::Close => {
                if let Some(session) = self.registry().remove_id(&frame.id) {
                    session.close(CloseReason::Remote);
                    tracing::debug!(cid = %frame.id, "tunnel: server closed connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::duplex, net::TcpListener};

    use super::*;
    use crate::backhaul::tunnel::protocol;

    #[tokio::test]
    async fn duplicate_open_keeps_the_live_session() {
        // Target accepts and holds connections open.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((c, _)) = ln.accept().await {
                held.push(c);
            }
        });

        let router = Router::new(addr, RouterOptions::default());
        let (ours, mut theirs) = duplex(64 * 1024);
        let serving = {
            let r = router.clone();
            tokio::spawn(async move { r.bind_stream(Box::new(ours)).await })
        };

        let id = ConnectionId::from("dup");
        protocol::write_frame(&mut theirs, &Frame::open(id.clone())).await.unwrap();
        let mut first = None;
        for _ in 0..100 {
            if let Some(s) = router.registry().lookup(&id) {
                first = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let first = first.expect("session registered");

        protocol::write_frame(&mut theirs, &Frame::open(id.clone())).await.unwrap();
        // A DATA frame after the duplicate proves the reader processed it.
        protocol::write_frame(&mut theirs, &Frame::data(id.clone(), bytes::Bytes::from_static(b"x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let still = router.registry().lookup(&id).unwrap();
        assert!(Arc::ptr_eq(&first, &still));
        assert!(!first.is_closing());

        drop(theirs);
        serving.await.unwrap().unwrap();
        assert!(router.registry().is_empty());
        assert_eq!(first.close_reason(), Some(CloseReason::StreamLost));
    }

    #[tokio::test]
    async fn close_for_unknown_id_is_ignored() {
        let router = Router::new("127.0.0.1:1", RouterOptions::default());
        router
            .on_frame(Frame::close(ConnectionId::from("nope")))
            .await;
        router
            .on_frame(Frame::data(ConnectionId::from("nope"), bytes::Bytes::from_static(b"z")))
            .await;
        assert!(router.registry().is_empty());
    }
}
