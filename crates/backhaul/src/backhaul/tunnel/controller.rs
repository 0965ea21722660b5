use tokio::net::TcpStream;

use crate::backhaul::tunnel::{
    frame::ConnectionId,
    pump::{self, PumpOptions},
    service::TunnelService,
    session::{Session, SessionOptions},
};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub session: SessionOptions,
    pub pump: PumpOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            pump: PumpOptions::default(),
        }
    }
}

/// Drives one accepted public socket through its session.
#[derive(Clone)]
pub struct Controller {
    service: TunnelService,
    opts: ControllerOptions,
}

impl Controller {
    pub fn new(service: TunnelService, opts: ControllerOptions) -> Self {
        Self { service, opts }
    }

    /// Registers a fresh session for `sock` and pumps bytes both ways until
    /// the session closes. Returns once the socket is released.
    pub async fn handle(&self, sock: TcpStream) {
        let peer = sock.peer_addr().ok();
        let id = ConnectionId::generate();
        let (session, local) = Session::new(id.clone(), self.opts.session);

        if let Err(err) = self.service.register_connection(&session).await {
            tracing::warn!(cid = %id, client = ?peer, err = %err, "public: dropping connection");
            return;
        }
        tracing::debug!(cid = %id, client = ?peer, "public: connection opened");

        session.mark_open();
        let (sent, received) = pump::pipe(&session, sock, local, &self.opts.pump).await;

        tracing::debug!(
            cid = %id,
            sent,
            received,
            reason = ?session.close_reason(),
            "public: connection closed"
        );
    }
}
