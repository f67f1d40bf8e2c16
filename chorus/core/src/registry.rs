//! Stream Registry
//!
//! Owns the set of active stream sessions and the connected transport
//! clients, and provides the one broadcast primitive the orchestrator uses to
//! reach every subscriber of a conversation.
//!
//! # Architecture
//!
//! ```text
//!                         StreamRegistry
//!          ┌────────────────────────────────────────────┐
//!          │ sessions: DashMap<conversation, Session>   │
//!          │ clients:  RwLock<HashMap<ClientId, Handle>>│
//!          │ rooms:    DashMap<conversation, broadcast> │
//!          └──────────────────────┬─────────────────────┘
//!                                 │ broadcast(conversation, payload)
//!             ┌───────────────────┼────────────────────┐
//!             │                   │                    │
//!      ┌──────▼──────┐     ┌──────▼───────┐     ┌──────▼───────┐
//!      │ push-socket │     │  HTTP push   │     │  room bus    │
//!      │  clients    │     │  clients     │     │ (whole room) │
//!      └─────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! Delivery is fire-and-forget via `try_send`: a slow or dead client drops
//! events and never blocks the orchestration, and a send failure to one
//! client never aborts delivery to the others. Socket and HTTP-push clients
//! are addressed individually; the room transport is addressed as a whole
//! room keyed by conversation id.
//!
//! # Thread safety
//!
//! The session map and client map are the only shared state. All critical
//! sections are short field mutations; no lock is ever held across an await
//! point.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::config::StreamingConfig;
use crate::error::OrchestrationError;
use crate::events::{EventPayload, StreamEvent};
use crate::session::{SessionSnapshot, StreamSession};
use crate::transport::TransportKind;

/// Unique identifier for a connected transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a new unique client id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Optional metadata recorded when a client connects.
#[derive(Clone, Debug, Default)]
pub struct ClientMetadata {
    /// User agent or client version string.
    pub user_agent: Option<String>,
    /// Remote address, when the transport knows it.
    pub remote_addr: Option<String>,
}

/// Handle to one connected client: its interest and its send channel.
#[derive(Debug)]
pub struct ClientHandle {
    /// Unique client identifier.
    pub id: ClientId,
    /// Which transport the client connected through.
    pub kind: TransportKind,
    /// The conversation this client is interested in.
    pub conversation_id: String,
    /// Channel to the transport's connection pump.
    pub tx: mpsc::Sender<StreamEvent>,
    /// When the client connected.
    pub connected_at: std::time::Instant,
    /// Connection metadata.
    pub metadata: ClientMetadata,
}

/// Counts reported by [`StreamRegistry::stats`].
#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    /// Active (not yet completed) stream sessions.
    pub active_streams: usize,
    /// Connected push-socket clients.
    pub socket_clients: usize,
    /// Connected HTTP-push clients.
    pub http_push_clients: usize,
    /// Current room subscribers across all rooms.
    pub room_members: usize,
    /// Events broadcast since the registry was created.
    pub events_emitted: u64,
}

struct RegistryInner {
    sessions: DashMap<String, Mutex<StreamSession>>,
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    rooms: DashMap<String, broadcast::Sender<StreamEvent>>,
    config: StreamingConfig,
    room_capacity: usize,
    events_emitted: AtomicU64,
}

/// Registry of active stream sessions and connected clients.
///
/// Cheaply cloneable; clones share the same underlying state.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(StreamingConfig::default())
    }
}

impl StreamRegistry {
    /// Create a registry with the given streaming configuration.
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self::with_room_capacity(config, 256)
    }

    /// Create a registry with an explicit per-room channel capacity.
    #[must_use]
    pub fn with_room_capacity(config: StreamingConfig, room_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                clients: RwLock::new(HashMap::new()),
                rooms: DashMap::new(),
                config,
                room_capacity: room_capacity.max(1),
                events_emitted: AtomicU64::new(0),
            }),
        }
    }

    /// The streaming configuration this registry was built with.
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Open a new stream session for a conversation.
    ///
    /// Admission control, not backpressure: when the configured ceiling of
    /// concurrently active sessions is reached the call is rejected outright
    /// and nothing queues. A conversation that already has an active session
    /// is rejected rather than silently overwritten, which would orphan the
    /// previous session's in-flight fan-out units.
    pub fn open_stream(
        &self,
        conversation_id: &str,
        origin: TransportKind,
    ) -> Result<(), OrchestrationError> {
        let active = self.active_stream_count();
        if active >= self.inner.config.max_concurrent_streams {
            tracing::warn!(
                active,
                ceiling = self.inner.config.max_concurrent_streams,
                "Rejecting stream: capacity exceeded"
            );
            return Err(OrchestrationError::CapacityExceeded {
                active,
                ceiling: self.inner.config.max_concurrent_streams,
            });
        }

        match self.inner.sessions.entry(conversation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().lock().is_active {
                    return Err(OrchestrationError::StreamAlreadyActive(
                        conversation_id.to_string(),
                    ));
                }
                // A completed session still within its retention window is
                // replaced by the new one.
                entry.insert(Mutex::new(StreamSession::new(conversation_id, origin)));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Mutex::new(StreamSession::new(conversation_id, origin)));
            }
        }

        tracing::info!(conversation_id, origin = %origin, "Stream session opened");
        Ok(())
    }

    /// Number of currently active sessions (excludes completed sessions in
    /// their retention window).
    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().is_active)
            .count()
    }

    /// Whether a session (active or retained) exists for a conversation.
    #[must_use]
    pub fn has_session(&self, conversation_id: &str) -> bool {
        self.inner.sessions.contains_key(conversation_id)
    }

    /// Whether the session for a conversation is still active.
    #[must_use]
    pub fn session_is_active(&self, conversation_id: &str) -> bool {
        self.inner
            .sessions
            .get(conversation_id)
            .map(|entry| entry.value().lock().is_active)
            .unwrap_or(false)
    }

    /// Run a closure against one session's state under its lock.
    pub fn with_session<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut StreamSession) -> R,
    ) -> Option<R> {
        self.inner
            .sessions
            .get(conversation_id)
            .map(|entry| f(&mut entry.value().lock()))
    }

    /// Read-only snapshot of one session, for status queries.
    #[must_use]
    pub fn session_snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.with_session(conversation_id, |session| session.snapshot())
    }

    /// Complete a stream session: mark it inactive, emit `stream_completed`,
    /// and schedule its removal after the retention window so trailing stats
    /// reads still succeed.
    ///
    /// This is the single completion path for success, partial failure, total
    /// failure, and sweep-detected timeout alike. Returns false if the
    /// session was missing or already completed.
    pub fn complete_stream(&self, conversation_id: &str) -> bool {
        let completed = self.with_session(conversation_id, |session| {
            if !session.is_active {
                return None;
            }
            session.finish();
            Some((session.duration_ms(), session.chunk_count))
        });

        let Some(Some((duration_ms, total_chunks))) = completed else {
            return false;
        };

        self.broadcast(
            conversation_id,
            EventPayload::StreamCompleted {
                duration_ms,
                total_chunks,
            },
        );
        tracing::info!(conversation_id, duration_ms, total_chunks, "Stream completed");

        let registry = self.clone();
        let conversation_id = conversation_id.to_string();
        let retention = self.inner.config.completed_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            registry.inner.sessions.remove(&conversation_id);
            tracing::debug!(%conversation_id, "Retained session removed");
        });

        true
    }

    /// Force-complete every active session older than the configured maximum
    /// streaming duration. Returns the number of sessions expired.
    ///
    /// An expired session goes through the normal completion path; the
    /// timeout is a lifecycle event, not a crash. In-flight adapter calls for
    /// it stop emitting at their next liveness check.
    pub fn sweep_expired(&self) -> usize {
        let max_age = self.inner.config.max_stream_age;
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value().lock();
                session.is_active && session.age() > max_age
            })
            .map(|entry| entry.key().clone())
            .collect();

        for conversation_id in &expired {
            tracing::warn!(
                %conversation_id,
                max_age_ms = max_age.as_millis() as u64,
                "Stream exceeded maximum duration; forcing completion"
            );
            self.complete_stream(conversation_id);
        }
        expired.len()
    }

    /// Spawn the periodic expiry sweep task.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.inner.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let expired = registry.sweep_expired();
                if expired > 0 {
                    tracing::info!(expired, "Expiry sweep force-completed sessions");
                }
            }
        })
    }

    // ========================================================================
    // Client registration
    // ========================================================================

    /// Register a connected client's interest in a conversation.
    pub fn register_client(
        &self,
        kind: TransportKind,
        conversation_id: impl Into<String>,
        tx: mpsc::Sender<StreamEvent>,
        metadata: ClientMetadata,
    ) -> ClientId {
        let id = ClientId::new();
        let handle = ClientHandle {
            id,
            kind,
            conversation_id: conversation_id.into(),
            tx,
            connected_at: std::time::Instant::now(),
            metadata,
        };
        tracing::info!(
            client_id = %id,
            kind = %kind,
            conversation_id = %handle.conversation_id,
            "Client registered"
        );
        self.inner.clients.write().insert(id, handle);
        id
    }

    /// Remove a client. Called by the owning transport when the underlying
    /// connection closes; never polled. Returns false if unknown.
    pub fn unregister_client(&self, id: ClientId) -> bool {
        let removed = self.inner.clients.write().remove(&id);
        if let Some(handle) = &removed {
            tracing::info!(
                client_id = %id,
                kind = %handle.kind,
                uptime_secs = handle.connected_at.elapsed().as_secs(),
                "Client unregistered"
            );
        }
        removed.is_some()
    }

    /// Total registered clients (socket + HTTP push).
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    /// Subscribe to a conversation's room, creating the room on first join.
    #[must_use]
    pub fn join_room(&self, conversation_id: &str) -> broadcast::Receiver<StreamEvent> {
        self.inner
            .rooms
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.room_capacity).0)
            .subscribe()
    }

    /// Current subscriber count across all rooms.
    #[must_use]
    pub fn room_member_count(&self) -> usize {
        self.inner
            .rooms
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum()
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Construct an event and deliver it to every subscriber of the
    /// conversation across all transports. Fire-and-forget: per-client
    /// failures are logged and dropped, and chunk payloads are counted into
    /// the session's metrics on the way through.
    pub fn broadcast(&self, conversation_id: &str, payload: EventPayload) {
        if payload.is_chunk() {
            self.with_session(conversation_id, StreamSession::record_chunk);
        }

        let event = StreamEvent::new(conversation_id, payload);
        self.fan_out(&event);
        self.inner.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliver one event to all matching subscribers. This is the seam a
    /// durable-delivery implementation would replace.
    fn fan_out(&self, event: &StreamEvent) {
        {
            let clients = self.inner.clients.read();
            for handle in clients.values() {
                if handle.conversation_id != event.conversation_id {
                    continue;
                }
                if handle.tx.try_send(event.clone()).is_err() {
                    tracing::debug!(
                        client_id = %handle.id,
                        kind = %handle.kind,
                        event = event.payload.kind(),
                        "Dropped event for slow or closed client"
                    );
                }
            }
        }

        let mut room_empty = false;
        if let Some(room) = self.inner.rooms.get(&event.conversation_id) {
            if room.value().send(event.clone()).is_err() {
                room_empty = true;
            }
        }
        if room_empty {
            // Last member left; prune the room lazily.
            self.inner.rooms.remove(&event.conversation_id);
        }
    }

    /// Operational counters for the health/metrics surface.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let (socket_clients, http_push_clients) = {
            let clients = self.inner.clients.read();
            let socket = clients
                .values()
                .filter(|h| h.kind == TransportKind::Socket)
                .count();
            let http = clients
                .values()
                .filter(|h| h.kind == TransportKind::HttpPush)
                .count();
            (socket, http)
        };

        RegistryStats {
            active_streams: self.active_stream_count(),
            socket_clients,
            http_push_clients,
            room_members: self.room_member_count(),
            events_emitted: self.inner.events_emitted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("sessions", &self.inner.sessions.len())
            .field("clients", &self.client_count())
            .field("rooms", &self.inner.rooms.len())
            .finish()
    }
}
