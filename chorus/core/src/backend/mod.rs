//! Model Backends
//!
//! Uniform capability wrapping one AI backend. The orchestrator only ever
//! sees the [`ModelBackend`] trait; provider-specific details (endpoints,
//! auth, wire formats) live in the implementations.

pub mod ollama;
pub mod scripted;
pub mod traits;

pub use ollama::OllamaBackend;
pub use scripted::ScriptedBackend;
pub use traits::{ModelBackend, StreamChunk};
