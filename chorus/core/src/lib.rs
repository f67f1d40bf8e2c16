//! Chorus Core - Multi-Model Streaming Orchestration
//!
//! This crate fans a single prompt out to multiple AI model backends
//! concurrently, streams each model's partial output to every subscribed
//! client in real time, and synthesizes one weighted answer from whatever
//! subset of models succeeded.
//!
//! # Architecture
//!
//! ```text
//!                         request (prompt, models, weights)
//!                                      │
//!                              ┌───────▼────────┐
//!                              │  Orchestrator  │
//!                              └───────┬────────┘
//!                 fan-out              │             fan-in
//!          ┌───────────────┬──────────┴┬───────────────┐
//!   ┌──────▼─────┐  ┌──────▼─────┐  ┌──▼─────────┐     │
//!   │ backend A  │  │ backend B  │  │ backend N  │ ────┤ join all,
//!   │ (native    │  │ (blocking, │  │            │     │ then
//!   │  streaming)│  │  simulated)│  │            │     ▼
//!   └──────┬─────┘  └──────┬─────┘  └──────┬─────┘  Synthesizer
//!          │ chunk events  │               │           │
//!          └───────────────┴───────┬───────┴───────────┘
//!                           ┌──────▼────────┐
//!                           │ StreamRegistry│  sessions, clients, rooms
//!                           └──────┬────────┘
//!               ┌──────────────────┼──────────────────┐
//!        ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼──────┐
//!        │ push-socket │    │  HTTP push  │    │  room bus   │
//!        │  (frames)   │    │   (SSE)     │    │ (WebSocket) │
//!        └─────────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamRegistry`]: owns sessions and connected clients; the broadcast
//!   primitive everything else goes through
//! - [`Orchestrator`]: drives one request end-to-end (fan-out, join,
//!   synthesis streaming, unconditional session completion)
//! - [`Synthesizer`]: deterministic weighted combination with adjustable,
//!   clamped per-model weights
//! - [`ModelBackend`]: the capability a provider adapter implements
//! - [`StreamEvent`] / [`EventPayload`]: the fixed event vocabulary every
//!   transport receives identically
//!
//! # Concurrency Model
//!
//! Per-model fan-out units run as independent tasks; the orchestrator joins
//! on all of them ("settle all") before synthesizing, so one model's failure
//! never aborts its siblings. Shared state is limited to the session map and
//! the client registry, both behind short non-async critical sections; no
//! lock is held across an await point.
//!
//! There is no UI code here and no knowledge of any particular vendor's wire
//! format; both live behind the transport and backend seams.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod synthesis;
pub mod transport;

// Re-exports for convenience
pub use backend::{ModelBackend, OllamaBackend, ScriptedBackend, StreamChunk};
pub use config::{ChorusConfig, ConfigError, DelayRange, StreamingConfig, SynthesisConfig};
pub use error::OrchestrationError;
pub use events::{EventPayload, StreamEvent};
pub use orchestrator::{fragment_text, ModelConfig, Orchestrator, StreamRequest};
pub use registry::{ClientHandle, ClientId, ClientMetadata, RegistryStats, StreamRegistry};
pub use session::{ModelProgress, ModelStatus, SessionSnapshot, StreamSession};
pub use synthesis::Synthesizer;
pub use transport::{RoomServer, SocketServer, TransportKind};
