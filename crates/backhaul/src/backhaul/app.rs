use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::backhaul::{
    admin,
    config::{self, ClientOverrides, Config, ServerOverrides},
    logging, telemetry,
    tunnel::{
        client::{Client, ClientOptions, QuicClientOptions},
        controller::{Controller, ControllerOptions},
        handler::HandlerOptions,
        listener,
        mux::Multiplexer,
        pump::PumpOptions,
        router::{Router, RouterOptions},
        server::{QuicServerOptions, Server, ServerOptions},
        service::TunnelService,
        session::SessionOptions,
    },
};

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Mode {
    /// Expose a public port and forward its connections to the bound client.
    Server(ServerOverrides),
    /// Connect out to a server and relay tunneled connections to a target.
    Client(ClientOverrides),
}

pub async fn run(config_path: Option<PathBuf>, debug: bool, mode: Mode) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let mut cfg = match &resolved {
        Some(r) => config::load_config(&r.path)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => Config::default(),
    };
    match &mode {
        Mode::Server(o) => cfg.apply_server_overrides(o),
        Mode::Client(o) => cfg.apply_client_overrides(o),
    }
    cfg.validate()?;

    let _logrt = logging::init(&cfg.logging, debug)?;
    match &resolved {
        Some(r) => {
            tracing::info!(path = %r.path.display(), source = %r.source, "config: loaded")
        }
        None => tracing::info!("config: no file found, using defaults"),
    }

    let metrics = if cfg.admin_addr.trim().is_empty() {
        None
    } else {
        Some(Arc::new(telemetry::init_prometheus()?))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let mux = match mode {
        Mode::Server(_) => spawn_server(&cfg, &mut tasks, &shutdown_rx),
        Mode::Client(_) => spawn_client(&cfg, &mut tasks, &shutdown_rx)?,
    };

    if metrics.is_some() {
        let addr = cfg.admin_addr.clone();
        let state = admin::AdminState { metrics, mux };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(&addr, state, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => {
                    drain(&mut tasks).await;
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    drain(&mut tasks).await;
                    return Err(join_err.into());
                }
                _ => {}
            }
        }
    }

    drain(&mut tasks).await;
    tracing::info!("backhaul: stopped");
    Ok(())
}

fn pump_options(cfg: &Config) -> PumpOptions {
    PumpOptions {
        read_buffer: cfg.tunnel.read_buffer,
        idle_timeout: cfg.tunnel.idle_timeout,
        write_timeout: cfg.tunnel.write_timeout,
    }
}

fn session_options(cfg: &Config) -> SessionOptions {
    SessionOptions {
        queue_capacity: cfg.tunnel.queue_capacity,
        inbound_limit: cfg.tunnel.inbound_limit,
    }
}

fn spawn_server(
    cfg: &Config,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown: &watch::Receiver<bool>,
) -> Arc<Multiplexer> {
    let sc = &cfg.server;
    tracing::info!(
        public_addr = %sc.public_addr,
        control_addr = %sc.control_addr,
        transport = %sc.transport,
        admin_addr = %cfg.admin_addr,
        "backhaul: starting server"
    );

    let service = TunnelService::new(cfg.tunnel.frame_queue);
    let server = Server::new(
        ServerOptions {
            listen_addr: sc.control_addr.clone(),
            transport: sc.transport.clone(),
            handshake_timeout: sc.handshake_timeout,
            quic: QuicServerOptions {
                cert_file: sc.quic.cert_file.clone(),
                key_file: sc.quic.key_file.clone(),
            },
        },
        service.clone(),
    );
    let rx = shutdown.clone();
    tasks.spawn(async move { server.listen_and_serve(rx).await });

    let controller = Controller::new(
        service.clone(),
        ControllerOptions {
            session: session_options(cfg),
            pump: pump_options(cfg),
        },
    );
    let public_addr = sc.public_addr.clone();
    let rx = shutdown.clone();
    tasks.spawn(async move { listener::serve_public(&public_addr, controller, rx).await });

    service.multiplexer().clone()
}

fn spawn_client(
    cfg: &Config,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Arc<Multiplexer>> {
    let cc = &cfg.client;
    let target = cc.target_addr.trim();
    if target.is_empty() {
        anyhow::bail!("config: client.target_addr is required (or pass --target)");
    }
    let router = Router::new(
        target,
        RouterOptions {
            session: session_options(cfg),
            frame_queue: cfg.tunnel.frame_queue,
            handler: HandlerOptions {
                dial_timeout: cc.target_dial_timeout,
                pump: pump_options(cfg),
            },
        },
    );
    tracing::info!(
        server_addr = %cc.server_addr,
        target_addr = %router.target(),
        transport = %cc.transport,
        admin_addr = %cfg.admin_addr,
        "backhaul: starting client"
    );

    let client = Client::new(
        ClientOptions {
            server_addr: cc.server_addr.clone(),
            transport: cc.transport.clone(),
            dial_timeout: cc.dial_timeout,
            max_backoff: cc.max_backoff,
            quic: QuicClientOptions {
                server_name: cc.quic.server_name.clone(),
                ca_file: cc.quic.ca_file.clone(),
                insecure_skip_verify: cc.quic.insecure_skip_verify,
            },
        },
        router.clone(),
    );
    let rx = shutdown.clone();
    tasks.spawn(async move { client.run(rx).await });

    Ok(router.multiplexer().clone())
}

/// Waits for every task to observe shutdown, aborting whatever is still
/// running after five seconds.
async fn drain(tasks: &mut JoinSet<anyhow::Result<()>>) {
    let wait_all = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %err, "shutdown: task ended with error");
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), wait_all)
        .await
        .is_err()
    {
        tracing::warn!("shutdown: drain timed out, aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
