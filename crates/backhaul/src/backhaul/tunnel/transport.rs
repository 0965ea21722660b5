use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// Anything that can carry the control stream: read and write halves in one
/// object-safe trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// The control stream as the tunnel core sees it.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub quic: QuicDialOptions,
}

/// An accepted control stream and where it came from.
pub struct Accepted {
    pub stream: BoxedStream,
    pub remote: Option<SocketAddr>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Accepted>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic)"),
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![b"backhaul-tunnel".to_vec()]
}

pub mod quic;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "quic" => Ok(Arc::new(quic::QuicTransport::new())),
        _ => Ok(Arc::new(tcp::TcpTransport::new())),
    }
}
