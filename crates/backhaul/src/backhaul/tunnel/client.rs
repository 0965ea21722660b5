use std::time::Duration;

use anyhow::Context;
use tokio::{sync::watch, time};

use crate::backhaul::tunnel::{
    mux::TunnelError,
    protocol::{self, BindStatus},
    router::Router,
    transport::{QuicDialOptions, TransportDialOptions, transport_by_name},
};

#[derive(Debug, Clone, Default)]
pub struct QuicClientOptions {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
    pub max_backoff: Duration,
    pub quic: QuicClientOptions,
}

/// Keeps one control stream to the server bound into the router, redialing
/// with exponential backoff whenever it drops.
pub struct Client {
    opts: ClientOptions,
    router: Router,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

impl Client {
    pub fn new(mut opts: ClientOptions, router: Router) -> Self {
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.max_backoff < INITIAL_BACKOFF {
            opts.max_backoff = INITIAL_BACKOFF;
        }
        Self { opts, router }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut bound = false;
            match self.run_once(shutdown.clone(), &mut bound).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if bound {
                        backoff = INITIAL_BACKOFF;
                    }
                    tracing::warn!(
                        transport = %self.opts.transport,
                        server = %self.opts.server_addr,
                        err = %format!("{err:#}"),
                        backoff = %humantime::format_duration(backoff),
                        "control: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(self.opts.max_backoff);
        }
    }

    /// One dial, handshake and serve cycle. `Ok(())` only on shutdown; a
    /// stream that ends for any other reason is an error so the caller
    /// reconnects. `bound` is set once the server accepted the bind.
    async fn run_once(
        &self,
        mut shutdown: watch::Receiver<bool>,
        bound: &mut bool,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;

        let dial = tr.dial(
            &self.opts.server_addr,
            TransportDialOptions {
                quic: QuicDialOptions {
                    server_name: self.opts.quic.server_name.clone(),
                    ca_file: self.opts.quic.ca_file.clone(),
                    insecure_skip_verify: self.opts.quic.insecure_skip_verify,
                    next_protos: vec![],
                },
            },
        );
        let mut stream = time::timeout(self.opts.dial_timeout, dial)
            .await
            .context("control: dial timeout")??;

        protocol::write_hello(&mut stream).await?;
        let status = time::timeout(self.opts.dial_timeout, protocol::read_reply(&mut stream))
            .await
            .context("control: handshake timeout")??;
        if status == BindStatus::AlreadyBound {
            return Err(TunnelError::AlreadyBound.into());
        }

        let binding = self.router.try_bind()?;
        *bound = true;
        tracing::info!(
            transport = %tr.name(),
            server = %self.opts.server_addr,
            generation = binding.generation(),
            "control: connected"
        );

        tokio::select! {
            res = self.router.serve_binding(binding, stream) => {
                res?;
                Err(TunnelError::StreamClosed.into())
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Ok(()),
        }
    }
}
