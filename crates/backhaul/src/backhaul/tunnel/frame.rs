use std::{fmt, sync::Arc};

use bytes::Bytes;

/// Identifier of one logical connection carried through the tunnel.
///
/// Minted by the server when a public socket is accepted and echoed back by
/// the client on every frame for that connection. Treated as an opaque string
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Open = 1,
    Data = 2,
    Close = 3,
}

impl Action {
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Action::Open),
            2 => Some(Action::Data),
            3 => Some(Action::Close),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Open => "OPEN",
            Action::Data => "DATA",
            Action::Close => "CLOSE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One multiplexing unit on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: ConnectionId,
    pub action: Action,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(id: ConnectionId) -> Self {
        Self {
            id,
            action: Action::Open,
            payload: Bytes::new(),
        }
    }

    pub fn data(id: ConnectionId, payload: Bytes) -> Self {
        Self {
            id,
            action: Action::Data,
            payload,
        }
    }

    pub fn close(id: ConnectionId) -> Self {
        Self {
            id,
            action: Action::Close,
            payload: Bytes::new(),
        }
    }
}
