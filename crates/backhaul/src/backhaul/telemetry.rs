use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::backhaul::tunnel::session::CloseReason;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Which end of the tunnel a metric or log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Server => "server",
            Side::Client => "client",
        }
    }
}

pub fn session_opened(side: Side) {
    metrics::counter!("backhaul_sessions_opened_total", "side" => side.as_str()).increment(1);
    metrics::gauge!("backhaul_sessions_active", "side" => side.as_str()).increment(1.0);
}

pub fn session_closed(side: Side, reason: CloseReason) {
    metrics::counter!(
        "backhaul_sessions_closed_total",
        "side" => side.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
    metrics::gauge!("backhaul_sessions_active", "side" => side.as_str()).decrement(1.0);
}

/// `direction` is `"up"` for local socket to control stream, `"down"` for the reverse.
pub fn bytes(side: Side, direction: &'static str, n: u64) {
    metrics::counter!(
        "backhaul_bytes_total",
        "side" => side.as_str(),
        "direction" => direction
    )
    .increment(n);
}

pub fn frame_dropped(side: Side) {
    metrics::counter!("backhaul_frames_dropped_total", "side" => side.as_str()).increment(1);
}

pub fn bind_result(side: Side, result: &'static str) {
    metrics::counter!(
        "backhaul_binds_total",
        "side" => side.as_str(),
        "result" => result
    )
    .increment(1);
}
