//! Orchestration Error Taxonomy
//!
//! Whole-request failures that surface to the request initiator. Per-model
//! failures are deliberately absent from this enum: a single model's fan-out
//! unit failing is absorbed and aggregated by the orchestrator, and only
//! becomes visible here when every unit failed.

use thiserror::Error;

/// Errors produced by the stream registry and orchestrator.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The concurrent-stream ceiling was hit. Admission-control reject: the
    /// caller should retry later; no session was created and nothing queues.
    #[error("stream capacity exceeded ({active} active, ceiling {ceiling})")]
    CapacityExceeded {
        /// Number of currently active streams.
        active: usize,
        /// Configured concurrency ceiling.
        ceiling: usize,
    },

    /// A stream for this conversation id is already active. Opening a second
    /// one is rejected rather than silently overwriting the first, which
    /// would orphan its in-flight fan-out units.
    #[error("conversation {0} already has an active stream")]
    StreamAlreadyActive(String),

    /// The request's model configuration enabled zero models.
    #[error("no models enabled in request")]
    NoModelsEnabled,

    /// The request prompt was empty or whitespace-only.
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// Every enabled model's fan-out unit failed; synthesis was never
    /// attempted.
    #[error("all models failed: {}", models.join(", "))]
    AllModelsFailed {
        /// Names of the models that failed.
        models: Vec<String>,
    },

    /// Synthesis failed after at least one model succeeded. Per-model results
    /// remain visible via progress state even though no final answer exists.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// No session exists for the given conversation id.
    #[error("no active stream session for conversation {0}")]
    SessionNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestrationError::CapacityExceeded {
            active: 10,
            ceiling: 10,
        };
        assert_eq!(
            err.to_string(),
            "stream capacity exceeded (10 active, ceiling 10)"
        );

        let err = OrchestrationError::AllModelsFailed {
            models: vec!["alpha".to_string(), "beta".to_string()],
        };
        assert_eq!(err.to_string(), "all models failed: alpha, beta");

        let err = OrchestrationError::StreamAlreadyActive("conv-1".to_string());
        assert!(err.to_string().contains("conv-1"));
    }
}
