use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::backhaul::net;
use crate::backhaul::tunnel::transport::{
    Accepted, BoxedStream, Transport, TransportDialOptions, TransportListenOptions,
    TransportListener,
};

/// Plain TCP control stream. Suitable for trusted networks and tests; the
/// stream is carried as-is.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind control tcp {addr}"))?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str, _opts: TransportDialOptions) -> anyhow::Result<BoxedStream> {
        let c = net::connect_tcp(addr, None)
            .await
            .with_context(|| format!("dial control tcp {addr}"))?;
        Ok(Box::new(c))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Accepted> {
        let (c, remote) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Accepted {
            stream: Box::new(c),
            remote: Some(remote),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // TcpListener doesn't have async close; drop closes.
        Ok(())
    }
}
