use std::time::Duration;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::backhaul::{net, tunnel::controller::Controller};

/// Binds the public port and hands every accepted socket to `controller`.
pub async fn serve_public(
    listen_addr: &str,
    controller: Controller,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind public tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "public: listening");
    serve_listener(ln, controller, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    controller: Controller,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(err = %err, "public: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let _ = conn.set_nodelay(true);
                let c = controller.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "public: accepted");
                    }
                    c.handle(conn).await;
                });
            }
        }
    }

    Ok(())
}
