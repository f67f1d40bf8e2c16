//! HTTP Server-Push Transport
//!
//! Unidirectional delivery over one long-lived HTTP response per client,
//! framed as Server-Sent Events. A periodic heartbeat comment keeps
//! intermediary proxies from timing out idle connections; client disconnects
//! surface as the response stream being dropped, which unregisters the
//! client.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use tokio::sync::mpsc;

use crate::registry::{ClientId, ClientMetadata, RegistryStats, StreamRegistry};
use crate::transport::TransportKind;

#[derive(Clone)]
struct PushState {
    registry: StreamRegistry,
    heartbeat_interval: Duration,
}

/// Unregisters its client when the SSE response stream is dropped.
struct Registration {
    registry: StreamRegistry,
    id: ClientId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister_client(self.id);
    }
}

/// Build the router for the HTTP push transport:
/// `GET /streams/{conversation_id}/events` for the event stream and
/// `GET /stats` for the operational counters.
#[must_use]
pub fn push_router(registry: StreamRegistry, heartbeat_interval: Duration) -> Router {
    Router::new()
        .route("/streams/{conversation_id}/events", get(events_handler))
        .route("/stats", get(stats_handler))
        .with_state(PushState {
            registry,
            heartbeat_interval,
        })
}

async fn stats_handler(State(state): State<PushState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

async fn events_handler(
    Path(conversation_id): Path<String>,
    State(state): State<PushState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel(64);
    let metadata = ClientMetadata {
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        remote_addr: None,
    };
    let id = state.registry.register_client(
        TransportKind::HttpPush,
        conversation_id,
        tx,
        metadata,
    );
    let guard = Registration {
        registry: state.registry.clone(),
        id,
    };

    let stream = async_stream::stream! {
        // Owned by the stream: dropping the response unregisters the client.
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    yield Ok(Event::default().event(event.payload.kind()).data(json));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize event for SSE");
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.heartbeat_interval)
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;

    #[tokio::test]
    async fn test_registration_guard_unregisters_on_drop() {
        let registry = StreamRegistry::new(StreamingConfig::fast());
        let (tx, _rx) = mpsc::channel(4);
        let id = registry.register_client(
            TransportKind::HttpPush,
            "conv-1",
            tx,
            ClientMetadata::default(),
        );
        assert_eq!(registry.client_count(), 1);

        drop(Registration {
            registry: registry.clone(),
            id,
        });
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let registry = StreamRegistry::new(StreamingConfig::fast());
        let _router = push_router(registry, Duration::from_secs(10));
    }
}
