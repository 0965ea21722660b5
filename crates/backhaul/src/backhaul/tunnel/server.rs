use std::time::Duration;

use anyhow::Context;
use tokio::{io::AsyncWriteExt, sync::watch, time};

use crate::backhaul::tunnel::{
    mux::TunnelError,
    protocol::{self, BindStatus},
    service::TunnelService,
    transport::{
        Accepted, QuicListenOptions, TransportListenOptions, TransportListener,
        transport_by_name,
    },
};

#[derive(Debug, Clone, Default)]
pub struct QuicServerOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub handshake_timeout: Duration,
    pub quic: QuicServerOptions,
}

/// Accepts control streams and binds them into the tunnel service.
pub struct Server {
    opts: ServerOptions,
    service: TunnelService,
}

impl Server {
    pub fn new(mut opts: ServerOptions, service: TunnelService) -> Self {
        if opts.handshake_timeout.is_zero() {
            opts.handshake_timeout = Duration::from_secs(5);
        }
        Self { opts, service }
    }

    pub async fn listen(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr
            .listen(
                &self.opts.listen_addr,
                TransportListenOptions {
                    quic: QuicListenOptions {
                        cert_file: self.opts.quic.cert_file.clone(),
                        key_file: self.opts.quic.key_file.clone(),
                        next_protos: vec![],
                    },
                },
            )
            .await?;

        tracing::info!(
            addr = %self.opts.listen_addr,
            local_addr = ?ln.local_addr(),
            transport = %tr.name(),
            "control: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = ln.accept() => {
                    let accepted = match accepted {
                        Ok(a) => a,
                        Err(err) => {
                            tracing::warn!(err = %err, "control: accept failed");
                            time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let svc = self.service.clone();
                    let handshake_timeout = self.opts.handshake_timeout;
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_control(svc, accepted, handshake_timeout, stop).await {
                            tracing::warn!(err = %format!("{err:#}"), "control: stream ended with error");
                        }
                    });
                }
            }
        }

        ln.close().await?;
        Ok(())
    }
}

async fn handle_control(
    service: TunnelService,
    accepted: Accepted,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let Accepted { mut stream, remote } = accepted;
    let remote = remote.map(|a| a.to_string()).unwrap_or_default();

    time::timeout(handshake_timeout, protocol::read_hello(&mut stream))
        .await
        .context("control: handshake timeout")??;

    let binding = match service.try_bind() {
        Ok(b) => b,
        Err(TunnelError::AlreadyBound) => {
            tracing::warn!(client = %remote, "control: rejecting bind, a client is already bound");
            protocol::write_reply(&mut stream, BindStatus::AlreadyBound).await?;
            let _ = time::timeout(Duration::from_secs(1), stream.shutdown()).await;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    protocol::write_reply(&mut stream, BindStatus::Accepted).await?;

    tracing::info!(client = %remote, generation = binding.generation(), "control: client bound");
    tokio::select! {
        res = service.serve_binding(binding, stream) => match res {
            Ok(()) => tracing::info!(client = %remote, "control: client disconnected"),
            Err(err) => tracing::warn!(client = %remote, err = %err, "control: client stream failed"),
        },
        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
            tracing::info!(client = %remote, "control: unbinding for shutdown");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backhaul::tunnel::transport::{TransportDialOptions, tcp::TcpTransport, Transport};

    fn server(svc: TunnelService) -> Server {
        Server::new(
            ServerOptions {
                listen_addr: "127.0.0.1:0".into(),
                transport: "tcp".into(),
                handshake_timeout: Duration::from_secs(1),
                quic: QuicServerOptions::default(),
            },
            svc,
        )
    }

    #[tokio::test]
    async fn second_client_gets_already_bound() {
        let svc = TunnelService::new(16);
        let srv = server(svc.clone());
        let ln = srv.listen().await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let serving = tokio::spawn(async move { srv.serve(ln, stop_rx).await });

        let tr = TcpTransport::new();
        let mut first = tr.dial(&addr, TransportDialOptions::default()).await.unwrap();
        protocol::write_hello(&mut first).await.unwrap();
        assert_eq!(protocol::read_reply(&mut first).await.unwrap(), BindStatus::Accepted);

        let mut second = tr.dial(&addr, TransportDialOptions::default()).await.unwrap();
        protocol::write_hello(&mut second).await.unwrap();
        assert_eq!(
            protocol::read_reply(&mut second).await.unwrap(),
            BindStatus::AlreadyBound
        );
        assert!(svc.is_bound());

        drop(first);
        for _ in 0..100 {
            if !svc.is_bound() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!svc.is_bound());

        stop_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_hello_never_binds() {
        let svc = TunnelService::new(16);
        let srv = server(svc.clone());
        let ln = srv.listen().await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let serving = tokio::spawn(async move { srv.serve(ln, stop_rx).await });

        let mut c = TcpTransport::new()
            .dial(&addr, TransportDialOptions::default())
            .await
            .unwrap();
        c.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert!(!svc.is_bound());

        stop_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }
}
