use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{self, Instant},
};

use crate::backhaul::tunnel::session::{CloseReason, InboundQueue, LocalEnd, Session};

/// How long queued bytes may keep draining to a socket after its session
/// started closing.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PumpOptions {
    pub read_buffer: usize,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            read_buffer: 16 * 1024,
            idle_timeout: None,
            write_timeout: None,
        }
    }
}

/// Runs both pumps for `sock`: the write direction as its own task, the read
/// direction on the caller. Returns `(bytes read, bytes written)` once both
/// have stopped and the socket is released.
pub async fn pipe(
    session: &Arc<Session>,
    sock: TcpStream,
    local: LocalEnd,
    opts: &PumpOptions,
) -> (u64, u64) {
    let (rd, wr) = sock.into_split();
    let LocalEnd { inbound, outbound } = local;

    let down = {
        let session = session.clone();
        let opts = opts.clone();
        tokio::spawn(async move { queue_to_socket(&session, inbound, wr, &opts).await })
    };
    let read = socket_to_queue(session, rd, outbound, opts).await;
    let written = down.await.unwrap_or_default();
    (read, written)
}

/// Reads the local socket into the session's outbound queue until EOF, an
/// error, an idle timeout, or the session closing from elsewhere. Returns the
/// number of bytes read.
///
/// Every chunk read before EOF is queued before the session is marked closing.
pub async fn socket_to_queue<R>(
    session: &Session,
    mut rd: R,
    tx: mpsc::Sender<Bytes>,
    opts: &PumpOptions,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; opts.read_buffer.max(1)];
    let mut total = 0u64;

    let reason = loop {
        let read = tokio::select! {
            r = read_some(&mut rd, &mut buf, opts.idle_timeout) => r,
            _ = session.closing() => break None,
        };
        let n = match read {
            Ok(0) => break Some(CloseReason::LocalEof),
            Ok(n) => n,
            Err(reason) => break Some(reason),
        };
        total += n as u64;

        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let sent = tokio::select! {
            r = tx.send(chunk) => r.is_ok(),
            _ = session.closing() => false,
        };
        if !sent {
            break None;
        }
    };

    if let Some(reason) = reason {
        if session.close(reason) {
            tracing::debug!(cid = %session.id(), reason = %reason, "tunnel: local read ended");
        }
    }
    total
}

async fn read_some<R>(rd: &mut R, buf: &mut [u8], idle: Option<Duration>) -> Result<usize, CloseReason>
where
    R: AsyncRead + Unpin,
{
    let res = match idle {
        Some(t) => time::timeout(t, rd.read(buf))
            .await
            .map_err(|_| CloseReason::Timeout)?,
        None => rd.read(buf).await,
    };
    res.map_err(|err| {
        tracing::debug!(err = %err, "tunnel: local read failed");
        CloseReason::LocalError
    })
}

/// Writes the session's inbound bytes to the local socket until the session
/// closes or a write fails, then shuts the socket's write side down. Returns
/// the number of bytes written.
///
/// Bytes already queued when the session starts closing are still written,
/// bounded by a short linger.
pub async fn queue_to_socket<W>(
    session: &Session,
    mut rx: InboundQueue,
    mut wr: W,
    opts: &PumpOptions,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut linger: Option<Instant> = None;

    loop {
        let chunk = if linger.is_some() {
            match rx.try_recv() {
                Ok(c) => c,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                biased;
                c = rx.recv() => match c {
                    Some(c) => c,
                    None => break,
                },
                _ = session.closing() => {
                    linger = Some(Instant::now() + CLOSE_LINGER);
                    continue;
                }
            }
        };

        let write = write_chunk(&mut wr, &chunk, opts.write_timeout);
        tokio::pin!(write);
        let current = linger;
        let res = match current {
            Some(deadline) => time::timeout_at(deadline, &mut write)
                .await
                .unwrap_or(Err(CloseReason::Timeout)),
            None => tokio::select! {
                r = &mut write => r,
                _ = session.closing() => {
                    let deadline = Instant::now() + CLOSE_LINGER;
                    linger = Some(deadline);
                    time::timeout_at(deadline, &mut write)
                        .await
                        .unwrap_or(Err(CloseReason::Timeout))
                }
            },
        };

        match res {
            Ok(()) => total += chunk.len() as u64,
            Err(reason) => {
                if session.close(reason) {
                    tracing::debug!(cid = %session.id(), reason = %reason, "tunnel: local write ended");
                }
                break;
            }
        }
    }

    let _ = wr.shutdown().await;
    total
}

async fn write_chunk<W>(wr: &mut W, chunk: &[u8], timeout: Option<Duration>) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let res = match timeout {
        Some(t) => time::timeout(t, wr.write_all(chunk))
            .await
            .map_err(|_| CloseReason::Timeout)?,
        None => wr.write_all(chunk).await,
    };
    res.map_err(|err| {
        tracing::debug!(err = %err, "tunnel: local write failed");
        CloseReason::LocalError
    })
}
