//! Stream Events
//!
//! The unit of broadcast between the orchestration core and connected
//! transports. Every transport kind receives the identical JSON shape for the
//! same conversation; the registry never formats per transport.
//!
//! Events are immutable and fire-and-forget: there is no acknowledgement, no
//! persistence, and no replay. A subscriber that misses a chunk misses it.

use serde::{Deserialize, Serialize};

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// An event broadcast to every transport subscribed to a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// The conversation this event belongs to.
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    /// Unix timestamp in milliseconds when the event was created.
    pub timestamp: u64,
    /// The event payload, tagged with its `type` on the wire.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            timestamp: now_ms(),
            payload,
        }
    }
}

/// The fixed event vocabulary produced by the core.
///
/// Serialized internally tagged as `type` with `snake_case` type strings and
/// `camelCase` payload fields, so the wire shape reads
/// `{"type":"model_chunk","conversationId":...,"model":...,"chunk":...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// Orchestration accepted the request and fan-out is about to begin.
    StreamStarted {
        /// The enabled models, in selection order.
        models: Vec<String>,
        /// Convenience count of `models`.
        total_models: usize,
    },
    /// One model's fan-out unit began streaming.
    ModelStreamStarted {
        /// The model name.
        model: String,
    },
    /// One incremental fragment of a model's output.
    ModelChunk {
        /// The model name.
        model: String,
        /// The text fragment.
        chunk: String,
        /// Progress estimate in `[0, 1]`, non-decreasing per model.
        progress: f32,
    },
    /// All fan-out units settled and weighted synthesis is starting.
    SynthesisStarted {
        /// The models whose responses feed the synthesis.
        models: Vec<String>,
    },
    /// One incremental fragment of the synthesized answer.
    SynthesisChunk {
        /// The text fragment.
        chunk: String,
        /// Progress estimate in `[0, 1]`.
        progress: f32,
    },
    /// Synthesis finished; carries the full combined answer.
    SynthesisCompleted {
        /// The complete synthesized response.
        final_response: String,
    },
    /// The stream session finished (success, partial failure, or timeout).
    StreamCompleted {
        /// Wall-clock duration of the session in milliseconds.
        duration_ms: u64,
        /// Total chunk events observed during the session.
        total_chunks: u64,
    },
    /// The whole request failed.
    StreamError {
        /// Error description.
        error: String,
    },
    /// Synthesis failed after at least one model succeeded.
    SynthesisError {
        /// Error description.
        error: String,
    },
}

impl EventPayload {
    /// The wire `type` string for this payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamStarted { .. } => "stream_started",
            Self::ModelStreamStarted { .. } => "model_stream_started",
            Self::ModelChunk { .. } => "model_chunk",
            Self::SynthesisStarted { .. } => "synthesis_started",
            Self::SynthesisChunk { .. } => "synthesis_chunk",
            Self::SynthesisCompleted { .. } => "synthesis_completed",
            Self::StreamCompleted { .. } => "stream_completed",
            Self::StreamError { .. } => "stream_error",
            Self::SynthesisError { .. } => "synthesis_error",
        }
    }

    /// Whether this payload is a chunk record (counted for session metrics).
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        matches!(self, Self::ModelChunk { .. } | Self::SynthesisChunk { .. })
    }

    /// Whether this payload terminates the event stream for its session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_type_strings() {
        let payload = EventPayload::ModelChunk {
            model: "alpha".to_string(),
            chunk: "hello".to_string(),
            progress: 0.5,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "model_chunk");
        assert_eq!(json["model"], "alpha");
        assert_eq!(json["chunk"], "hello");

        let payload = EventPayload::SynthesisCompleted {
            final_response: "done".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "synthesis_completed");
        assert_eq!(json["finalResponse"], "done");
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = StreamEvent::new(
            "conv-1",
            EventPayload::StreamStarted {
                models: vec!["a".to_string(), "b".to_string()],
                total_models: 2,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["conversationId"], "conv-1");
        assert_eq!(json["type"], "stream_started");
        assert_eq!(json["totalModels"], 2);
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = StreamEvent::new(
            "conv-2",
            EventPayload::StreamCompleted {
                duration_ms: 1234,
                total_chunks: 42,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let decoded: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let payloads = vec![
            EventPayload::StreamStarted {
                models: vec![],
                total_models: 0,
            },
            EventPayload::ModelStreamStarted {
                model: "m".to_string(),
            },
            EventPayload::ModelChunk {
                model: "m".to_string(),
                chunk: "c".to_string(),
                progress: 0.0,
            },
            EventPayload::SynthesisStarted { models: vec![] },
            EventPayload::SynthesisChunk {
                chunk: "c".to_string(),
                progress: 1.0,
            },
            EventPayload::SynthesisCompleted {
                final_response: "r".to_string(),
            },
            EventPayload::StreamCompleted {
                duration_ms: 0,
                total_chunks: 0,
            },
            EventPayload::StreamError {
                error: "e".to_string(),
            },
            EventPayload::SynthesisError {
                error: "e".to_string(),
            },
        ];

        for payload in payloads {
            let json = serde_json::to_value(&payload).unwrap();
            assert_eq!(json["type"], payload.kind());
        }
    }

    #[test]
    fn test_chunk_classification() {
        assert!(EventPayload::ModelChunk {
            model: "m".to_string(),
            chunk: "c".to_string(),
            progress: 0.1,
        }
        .is_chunk());
        assert!(EventPayload::SynthesisChunk {
            chunk: "c".to_string(),
            progress: 0.1,
        }
        .is_chunk());
        assert!(!EventPayload::StreamError {
            error: "e".to_string(),
        }
        .is_chunk());
    }
}
