use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::backhaul::tunnel::frame::{Action, ConnectionId, Frame};

const MAGIC_HELLO: &[u8; 4] = b"BHCL"; // Backhaul client hello
const MAGIC_REPLY: &[u8; 4] = b"BHSV"; // Backhaul server reply
const PROTOCOL_V1: u8 = 1;

pub const MAX_PAYLOAD_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_CONNECTION_ID_BYTES: u32 = 64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("malformed frame: unknown action tag {0}")]
    MalformedFrame(u8),
    #[error("malformed frame: {0} frame carries a payload")]
    UnexpectedPayload(Action),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("connection id too long: {0}")]
    ConnectionIdTooLong(u32),
    #[error("empty connection id")]
    EmptyConnectionId,
    #[error("connection id is not valid utf-8")]
    InvalidConnectionId,
    #[error("unknown bind status {0}")]
    BadStatus(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Server's answer to a client hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStatus {
    Accepted,
    AlreadyBound,
}

impl BindStatus {
    fn as_wire(self) -> u8 {
        match self {
            BindStatus::Accepted => 0,
            BindStatus::AlreadyBound => 1,
        }
    }

    fn from_wire(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(BindStatus::Accepted),
            1 => Ok(BindStatus::AlreadyBound),
            other => Err(ProtocolError::BadStatus(other)),
        }
    }
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(MAGIC_HELLO).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    read_preamble(r, MAGIC_HELLO).await
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: BindStatus,
) -> Result<(), ProtocolError> {
    w.write_all(MAGIC_REPLY).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.write_u8(status.as_wire()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<BindStatus, ProtocolError> {
    read_preamble(r, MAGIC_REPLY).await?;
    BindStatus::from_wire(r.read_u8().await?)
}

async fn read_preamble<R: AsyncRead + Unpin>(
    r: &mut R,
    expected: &[u8; 4],
) -> Result<(), ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != expected {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    Ok(())
}

/// Appends the wire form of `frame` to `dst`.
///
/// Layout: `[action u8][id_len varint][id][payload_len u32 BE][payload]`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let id = frame.id.as_str().as_bytes();
    if id.is_empty() {
        return Err(ProtocolError::EmptyConnectionId);
    }
    let id_len: u32 = id.len().try_into().unwrap_or(u32::MAX);
    if id_len > MAX_CONNECTION_ID_BYTES {
        return Err(ProtocolError::ConnectionIdTooLong(id_len));
    }
    let payload_len: u32 = frame.payload.len().try_into().unwrap_or(u32::MAX);
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    dst.reserve(1 + 5 + id.len() + 4 + frame.payload.len());
    dst.put_u8(frame.action.as_wire());
    put_varint(dst, id_len);
    dst.put_slice(id);
    dst.put_u32(payload_len);
    dst.put_slice(&frame.payload);
    Ok(())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream on a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, ProtocolError> {
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let action = Action::from_wire(tag).ok_or(ProtocolError::MalformedFrame(tag))?;

    let id_len = read_varint(r).await?;
    if id_len == 0 {
        return Err(ProtocolError::EmptyConnectionId);
    }
    if id_len > MAX_CONNECTION_ID_BYTES {
        return Err(ProtocolError::ConnectionIdTooLong(id_len));
    }
    let mut id = vec![0u8; id_len as usize];
    r.read_exact(&mut id).await?;
    let id = String::from_utf8(id).map_err(|_| ProtocolError::InvalidConnectionId)?;

    let payload_len = r.read_u32().await?;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }
    if payload_len > 0 && action != Action::Data {
        return Err(ProtocolError::UnexpectedPayload(action));
    }
    let mut payload = BytesMut::zeroed(payload_len as usize);
    r.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        id: ConnectionId::from(id),
        action,
        payload: payload.freeze(),
    }))
}

fn put_varint(dst: &mut BytesMut, mut v: u32) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut out: u32 = 0;
    for i in 0..5 {
        let byte = r.read_u8().await?;
        out |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(out);
        }
    }
    Err(ProtocolError::ConnectionIdTooLong(u32::MAX))
}
