use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::backhaul::{net, telemetry, tunnel::mux::Multiplexer};

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Option<telemetry::SharedPrometheusHandle>,
    pub mux: Arc<Multiplexer>,
}

pub async fn serve(
    addr: &str,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(addr);
    let listener = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind admin {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

fn app(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/tunnel", get(tunnel))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.metrics {
        Some(h) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            h.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::from("metrics recorder not installed\n"),
        ),
    }
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.mux.registry().snapshot()))
}

#[derive(Debug, Serialize)]
struct TunnelResponse {
    side: &'static str,
    bound: bool,
    generation: Option<u64>,
    sessions: usize,
}

async fn tunnel(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let generation = st.mux.bound_generation();
    (
        StatusCode::OK,
        Json(TunnelResponse {
            side: st.mux.side().as_str(),
            bound: generation.is_some(),
            generation,
            sessions: st.mux.registry().len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::backhaul::{
        telemetry::Side,
        tunnel::{
            frame::ConnectionId,
            session::{Session, SessionOptions},
        },
    };

    async fn get_path(addr: std::net::SocketAddr, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn endpoints_report_tunnel_state() {
        let mux = Multiplexer::new(Side::Server, 4);
        let _binding = mux.try_bind().unwrap();
        let (s, _local) = Session::new(ConnectionId::from("abc"), SessionOptions::default());
        mux.registry().register(s).unwrap();

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = AdminState { metrics: None, mux };
        let server = tokio::spawn(serve_listener(ln, state, stop_rx));

        let health = get_path(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#"{"ok":true}"#));

        let tunnel = get_path(addr, "/tunnel").await;
        let (_, body) = tunnel.split_once("\r\n\r\n").unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["side"], "server");
        assert_eq!(v["bound"], true);
        assert_eq!(v["generation"], 1);
        assert_eq!(v["sessions"], 1);

        let sessions = get_path(addr, "/sessions").await;
        assert!(sessions.contains(r#""id":"abc""#));
        assert!(sessions.contains(r#""state":"created""#));

        let metrics = get_path(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 503"));

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
