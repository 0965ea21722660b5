use std::{sync::Arc, time::Duration};

use crate::backhaul::{
    net,
    tunnel::{
        pump::{self, PumpOptions},
        session::{CloseReason, LocalEnd, Session},
    },
};

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub dial_timeout: Duration,
    pub pump: PumpOptions,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            pump: PumpOptions::default(),
        }
    }
}

/// Relays one logical connection to the fixed target address.
pub struct ConnectionHandler {
    target: Arc<str>,
    session: Arc<Session>,
    opts: HandlerOptions,
}

impl ConnectionHandler {
    pub fn new(target: Arc<str>, session: Arc<Session>, opts: HandlerOptions) -> Self {
        Self {
            target,
            session,
            opts,
        }
    }

    /// Dials the target and pumps bytes both ways until the session closes.
    ///
    /// A failed dial closes the session with `DialFailed`; dropping `local`
    /// then lets the forwarder report `CLOSE` upstream so the server can
    /// release the public socket.
    pub async fn run(&self, local: LocalEnd) {
        let id = self.session.id();
        let dial = net::connect_tcp(&self.target, Some(self.opts.dial_timeout));
        let res = tokio::select! {
            r = dial => r,
            _ = self.session.closing() => {
                tracing::debug!(cid = %id, "tunnel: closed while dialing target");
                return;
            }
        };

        let sock = match res {
            Ok(sock) => sock,
            Err(err) => {
                tracing::warn!(cid = %id, target = %self.target, err = %format!("{err:#}"), "tunnel: target dial failed");
                self.session.close(CloseReason::DialFailed);
                return;
            }
        };

        if !self.session.mark_open() {
            return;
        }
        tracing::debug!(cid = %id, target = %self.target, "tunnel: target connected");

        let (sent, received) = pump::pipe(&self.session, sock, local, &self.opts.pump).await;
        tracing::debug!(
            cid = %id,
            sent,
            received,
            reason = ?self.session.close_reason(),
            "tunnel: target connection closed"
        );
    }
}
