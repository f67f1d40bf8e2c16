//! Transport Layer
//!
//! Three interchangeable delivery mechanisms for the same event stream:
//!
//! - `socket`: persistent bidirectional push-socket (length-prefixed JSON
//!   frames with CRC32 integrity over TCP)
//! - `http_push`: unidirectional server-push over HTTP (SSE framing with a
//!   periodic heartbeat)
//! - `room`: room-broadcast WebSocket, grouped by conversation id, with a
//!   small request/response control protocol layered on top
//!
//! All three receive identical event payloads for a given conversation; the
//! registry never special-cases formatting per transport.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod http_push;
pub mod room;
pub mod socket;

pub use frame::{FrameDecoder, FrameError};
pub use http_push::push_router;
pub use room::{RoomClientMessage, RoomServer, RoomServerMessage};
pub use socket::{ClientFrame, ServerFrame, SocketServer};

/// The delivery mechanism a client is connected through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent bidirectional push-socket.
    Socket,
    /// Unidirectional server-push over HTTP.
    HttpPush,
    /// Room-based broadcast socket.
    Room,
}

impl TransportKind {
    /// Stable lowercase name, used in stats and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::HttpPush => "http-push",
            Self::Room => "room",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(TransportKind::Socket.name(), "socket");
        assert_eq!(TransportKind::HttpPush.name(), "http-push");
        assert_eq!(TransportKind::Room.name(), "room");
        assert_eq!(format!("{}", TransportKind::Room), "room");
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&TransportKind::HttpPush).unwrap();
        assert_eq!(json, "\"http_push\"");
        let kind: TransportKind = serde_json::from_str("\"socket\"").unwrap();
        assert_eq!(kind, TransportKind::Socket);
    }
}
