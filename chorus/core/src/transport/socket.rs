//! Push-Socket Transport
//!
//! Persistent bidirectional connection per client over TCP, using the frame
//! codec from [`super::frame`]. A client subscribes to a conversation and
//! then receives every event for it until either side closes the connection;
//! the same connection can also carry inbound streaming requests toward the
//! front door.
//!
//! Connection lifecycle mirrors registration: the read task owns the client's
//! registry entry and removes it when the connection ends, so disconnects are
//! detected by the transport itself, never polled.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::events::StreamEvent;
use crate::orchestrator::StreamRequest;
use crate::registry::{ClientId, ClientMetadata, StreamRegistry};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::TransportKind;

/// Frames a client may send to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe this connection to a conversation's events. A second
    /// subscribe replaces the first.
    Subscribe {
        /// Conversation to receive events for.
        conversation_id: String,
        /// Optional client identification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
    /// Submit a streaming request for orchestration.
    Request(StreamRequest),
    /// Liveness probe; answered with a matching pong.
    Ping {
        /// Echoed back in the pong.
        seq: u64,
    },
}

/// Frames the server sends to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A broadcast stream event.
    Event(StreamEvent),
    /// Answer to a ping.
    Pong {
        /// Sequence echoed from the ping.
        seq: u64,
    },
    /// A request- or protocol-level error on this connection.
    Error {
        /// Error description.
        message: String,
    },
}

/// TCP server for the push-socket transport.
pub struct SocketServer {
    registry: StreamRegistry,
    requests: mpsc::Sender<StreamRequest>,
}

impl SocketServer {
    /// Create a server that registers clients in `registry` and forwards
    /// inbound [`StreamRequest`]s to `requests`.
    #[must_use]
    pub fn new(registry: StreamRegistry, requests: mpsc::Sender<StreamRequest>) -> Self {
        Self { registry, requests }
    }

    /// Accept connections forever.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Push-socket transport listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = self.registry.clone();
                    let requests = self.requests.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer.to_string(), registry, requests).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Push-socket accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    registry: StreamRegistry,
    requests: mpsc::Sender<StreamRequest>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    // All outbound traffic funnels through one channel so events and control
    // replies interleave on a single writer.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match encode(&frame) {
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode outbound frame");
                }
            }
        }
    });

    // Pump: registry events -> outbound frames. The registry hands us raw
    // StreamEvents; wrapping happens here so the registry stays
    // transport-agnostic.
    let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(64);
    let pump_out = out_tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if pump_out.send(ServerFrame::Event(event)).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    let mut client_id: Option<ClientId> = None;

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%peer, "Push-socket peer closed connection");
                break;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next::<ClientFrame>() {
                        Ok(Some(frame)) => {
                            handle_frame(
                                frame,
                                &peer,
                                &registry,
                                &requests,
                                &event_tx,
                                &out_tx,
                                &mut client_id,
                            )
                            .await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "Dropping connection on frame error");
                            let _ = out_tx
                                .send(ServerFrame::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            // Unrecoverable framing state
                            if let Some(id) = client_id.take() {
                                registry.unregister_client(id);
                            }
                            pump.abort();
                            writer.abort();
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Push-socket read error");
                break;
            }
        }
    }

    if let Some(id) = client_id.take() {
        registry.unregister_client(id);
    }
    pump.abort();
    writer.abort();
}

async fn handle_frame(
    frame: ClientFrame,
    peer: &str,
    registry: &StreamRegistry,
    requests: &mpsc::Sender<StreamRequest>,
    event_tx: &mpsc::Sender<StreamEvent>,
    out_tx: &mpsc::Sender<ServerFrame>,
    client_id: &mut Option<ClientId>,
) {
    match frame {
        ClientFrame::Subscribe {
            conversation_id,
            user_agent,
        } => {
            if let Some(previous) = client_id.take() {
                registry.unregister_client(previous);
            }
            let metadata = ClientMetadata {
                user_agent,
                remote_addr: Some(peer.to_string()),
            };
            *client_id = Some(registry.register_client(
                TransportKind::Socket,
                conversation_id,
                event_tx.clone(),
                metadata,
            ));
        }
        ClientFrame::Request(request) => {
            if requests.send(request).await.is_err() {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        message: "orchestration front door is not accepting requests".to_string(),
                    })
                    .await;
            }
        }
        ClientFrame::Ping { seq } => {
            let _ = out_tx.send(ServerFrame::Pong { seq }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::events::EventPayload;
    use crate::orchestrator::ModelConfig;
    use std::time::Duration;

    async fn read_frame(stream: &mut TcpStream) -> ServerFrame {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.next::<ServerFrame>().unwrap() {
                return frame;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
            decoder.extend(&buf[..n]);
        }
    }

    async fn start_server() -> (
        StreamRegistry,
        mpsc::Receiver<StreamRequest>,
        std::net::SocketAddr,
    ) {
        let registry = StreamRegistry::new(StreamingConfig::fast());
        let (req_tx, req_rx) = mpsc::channel(8);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SocketServer::new(registry.clone(), req_tx);
        tokio::spawn(server.serve(listener));
        (registry, req_rx, addr)
    }

    #[tokio::test]
    async fn test_subscribe_then_receive_events() {
        let (registry, _req_rx, addr) = start_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let subscribe = encode(&ClientFrame::Subscribe {
            conversation_id: "conv-1".to_string(),
            user_agent: Some("test-client".to_string()),
        })
        .unwrap();
        client.write_all(&subscribe).await.unwrap();

        // Wait for registration to land
        for _ in 0..50 {
            if registry.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.client_count(), 1);

        registry.broadcast(
            "conv-1",
            EventPayload::ModelStreamStarted {
                model: "alpha".to_string(),
            },
        );

        let frame = read_frame(&mut client).await;
        match frame {
            ServerFrame::Event(event) => {
                assert_eq!(event.conversation_id, "conv-1");
                assert_eq!(event.payload.kind(), "model_stream_started");
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_client() {
        let (registry, _req_rx, addr) = start_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let subscribe = encode(&ClientFrame::Subscribe {
            conversation_id: "conv-1".to_string(),
            user_agent: None,
        })
        .unwrap();
        client.write_all(&subscribe).await.unwrap();

        for _ in 0..50 {
            if registry.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.client_count(), 1);

        drop(client);
        for _ in 0..50 {
            if registry.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_pong_and_request_forwarding() {
        let (_registry, mut req_rx, addr) = start_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&encode(&ClientFrame::Ping { seq: 41 }).unwrap())
            .await
            .unwrap();

        match read_frame(&mut client).await {
            ServerFrame::Pong { seq } => assert_eq!(seq, 41),
            other => panic!("expected pong, got {other:?}"),
        }

        let request = StreamRequest {
            prompt: "hello".to_string(),
            conversation_id: "conv-1".to_string(),
            model_config: ModelConfig::new().enable("alpha"),
            custom_weights: None,
        };
        client
            .write_all(&encode(&ClientFrame::Request(request.clone())).unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), req_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, request);
    }
}
