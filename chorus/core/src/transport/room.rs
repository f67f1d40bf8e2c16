//! Room-Broadcast Transport
//!
//! WebSocket server where clients join a named room equal to the conversation
//! id. Events are published to the whole room at once through the registry's
//! per-room broadcast channel rather than per-client iteration, and a small
//! request/response control protocol (ping/pong, status queries) rides on the
//! same connection.

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::events::StreamEvent;
use crate::registry::StreamRegistry;
use crate::session::SessionSnapshot;

/// Control messages a room client may send, as JSON text frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomClientMessage {
    /// Join the room for a conversation, leaving any current room.
    Join {
        /// The conversation id, which names the room.
        conversation_id: String,
    },
    /// Leave the current room.
    Leave,
    /// Liveness probe.
    Ping {
        /// Echoed back in the pong.
        seq: u64,
    },
    /// Ask for the current session snapshot of the joined room.
    Status,
}

/// Messages the room server sends, as JSON text frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomServerMessage {
    /// Confirmation of a join.
    Joined {
        /// The room that was joined.
        conversation_id: String,
        /// Server-assigned member id for this connection.
        member_id: String,
    },
    /// Confirmation of a leave.
    Left {
        /// The room that was left.
        conversation_id: String,
    },
    /// Answer to a ping.
    Pong {
        /// Sequence echoed from the ping.
        seq: u64,
    },
    /// Answer to a status query.
    Status {
        /// Snapshot of the room's stream session.
        session: SessionSnapshot,
    },
    /// A broadcast stream event for the joined room.
    Event(StreamEvent),
    /// A control-protocol error; the connection stays open.
    Error {
        /// Error description.
        message: String,
    },
}

/// WebSocket server for the room-broadcast transport.
pub struct RoomServer {
    registry: StreamRegistry,
}

impl RoomServer {
    /// Create a room server over the given registry.
    #[must_use]
    pub fn new(registry: StreamRegistry) -> Self {
        Self { registry }
    }

    /// Accept connections forever.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Room transport listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        handle_socket(stream, peer.to_string(), registry).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Room transport accept failed");
                }
            }
        }
    }
}

fn new_member_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("member-{}", hex::encode(bytes))
}

async fn handle_socket(stream: TcpStream, peer: String, registry: StreamRegistry) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let member_id = new_member_id();
    let mut joined: Option<(String, broadcast::Receiver<StreamEvent>)> = None;
    tracing::debug!(%peer, %member_id, "Room client connected");

    loop {
        tokio::select! {
            incoming = source.next() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        let reply = match serde_json::from_str::<RoomClientMessage>(&text) {
                            Ok(control) => {
                                handle_control(control, &member_id, &registry, &mut joined)
                            }
                            Err(e) => RoomServerMessage::Error {
                                message: format!("unrecognized control message: {e}"),
                            },
                        };
                        if !send_message(&mut sink, &reply).await {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = room_event(&mut joined) => {
                match event {
                    Ok(event) => {
                        let message = RoomServerMessage::Event(event);
                        if !send_message(&mut sink, &message).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(%member_id, missed, "Room subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        joined = None;
                    }
                }
            }
        }
    }

    // Dropping the broadcast receiver is the leave; the registry prunes the
    // room once the last member is gone.
    tracing::debug!(%peer, %member_id, "Room client disconnected");
}

/// Await the next event of the joined room; parks forever while not joined
/// so the select loop only reacts to control messages.
async fn room_event(
    joined: &mut Option<(String, broadcast::Receiver<StreamEvent>)>,
) -> Result<StreamEvent, broadcast::error::RecvError> {
    match joined {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn handle_control(
    control: RoomClientMessage,
    member_id: &str,
    registry: &StreamRegistry,
    joined: &mut Option<(String, broadcast::Receiver<StreamEvent>)>,
) -> RoomServerMessage {
    match control {
        RoomClientMessage::Join { conversation_id } => {
            let rx = registry.join_room(&conversation_id);
            *joined = Some((conversation_id.clone(), rx));
            RoomServerMessage::Joined {
                conversation_id,
                member_id: member_id.to_string(),
            }
        }
        RoomClientMessage::Leave => match joined.take() {
            Some((conversation_id, _)) => RoomServerMessage::Left { conversation_id },
            None => RoomServerMessage::Error {
                message: "not in a room".to_string(),
            },
        },
        RoomClientMessage::Ping { seq } => RoomServerMessage::Pong { seq },
        RoomClientMessage::Status => match joined {
            Some((conversation_id, _)) => match registry.session_snapshot(conversation_id) {
                Some(session) => RoomServerMessage::Status { session },
                None => RoomServerMessage::Error {
                    message: format!("no session for conversation {conversation_id}"),
                },
            },
            None => RoomServerMessage::Error {
                message: "not in a room".to_string(),
            },
        },
    }
}

async fn send_message(
    sink: &mut futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    message: &RoomServerMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize room message");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::events::EventPayload;
    use crate::transport::TransportKind;
    use std::time::Duration;

    async fn start_server() -> (StreamRegistry, String) {
        let registry = StreamRegistry::new(StreamingConfig::fast());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(RoomServer::new(registry.clone()).serve(listener));
        (registry, format!("ws://{addr}"))
    }

    async fn next_server_message(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> RoomServerMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for room message")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_control_message_wire_shape() {
        let join = RoomClientMessage::Join {
            conversation_id: "conv-1".to_string(),
        };
        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(json["kind"], "join");
        assert_eq!(json["conversation_id"], "conv-1");

        let decoded: RoomClientMessage =
            serde_json::from_str(r#"{"kind":"ping","seq":3}"#).unwrap();
        assert_eq!(decoded, RoomClientMessage::Ping { seq: 3 });
    }

    #[test]
    fn test_member_ids_are_unique() {
        let a = new_member_id();
        let b = new_member_id();
        assert!(a.starts_with("member-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_join_receive_and_status() {
        let (registry, url) = start_server().await;
        registry
            .open_stream("conv-1", TransportKind::Room)
            .unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        ws.send(Message::Text(
            serde_json::to_string(&RoomClientMessage::Join {
                conversation_id: "conv-1".to_string(),
            })
            .unwrap(),
        ))
        .await
        .unwrap();

        match next_server_message(&mut ws).await {
            RoomServerMessage::Joined {
                conversation_id, ..
            } => assert_eq!(conversation_id, "conv-1"),
            other => panic!("expected joined, got {other:?}"),
        }

        // Whole-room delivery
        registry.broadcast(
            "conv-1",
            EventPayload::ModelStreamStarted {
                model: "alpha".to_string(),
            },
        );
        match next_server_message(&mut ws).await {
            RoomServerMessage::Event(event) => {
                assert_eq!(event.payload.kind(), "model_stream_started");
            }
            other => panic!("expected event, got {other:?}"),
        }

        // Status query on the layered control protocol
        ws.send(Message::Text(
            serde_json::to_string(&RoomClientMessage::Status).unwrap(),
        ))
        .await
        .unwrap();
        match next_server_message(&mut ws).await {
            RoomServerMessage::Status { session } => {
                assert_eq!(session.conversation_id, "conv-1");
                assert!(session.is_active);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_pong_and_leave() {
        let (_registry, url) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        ws.send(Message::Text(
            serde_json::to_string(&RoomClientMessage::Ping { seq: 9 }).unwrap(),
        ))
        .await
        .unwrap();
        match next_server_message(&mut ws).await {
            RoomServerMessage::Pong { seq } => assert_eq!(seq, 9),
            other => panic!("expected pong, got {other:?}"),
        }

        // Leaving without joining is a protocol error, not a disconnect
        ws.send(Message::Text(
            serde_json::to_string(&RoomClientMessage::Leave).unwrap(),
        ))
        .await
        .unwrap();
        assert!(matches!(
            next_server_message(&mut ws).await,
            RoomServerMessage::Error { .. }
        ));
    }
}
