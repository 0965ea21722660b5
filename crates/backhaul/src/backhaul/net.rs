use std::{borrow::Cow, net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, time};

/// Normalize a bind/listen address.
///
/// Config files and flags use the shorthand `":PORT"` to mean "bind on all
/// interfaces". `SocketAddr` parsing and Tokio bind APIs do not accept it, so
/// it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Dials `addr` over TCP, bounded by `timeout` when one is given (a zero
/// duration means no bound). The returned stream has `TCP_NODELAY` set.
pub async fn connect_tcp(addr: &str, timeout: Option<Duration>) -> anyhow::Result<TcpStream> {
    let c = match timeout.filter(|t| !t.is_zero()) {
        Some(t) => time::timeout(t, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))??,
        None => TcpStream::connect(addr).await?,
    };
    let _ = c.set_nodelay(true);
    Ok(c)
}

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {addr:?}"))
}
