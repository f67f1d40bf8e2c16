//! Stream Sessions
//!
//! Bookkeeping for one orchestration run, keyed by conversation id. A session
//! exists in the registry from creation until a bounded retention delay after
//! completion; the per-model progress inside it follows a strict state
//! machine: pending -> streaming -> completed | error, with no other
//! transitions permitted.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::events::now_ms;
use crate::transport::TransportKind;

/// Per-model status within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Queued; fan-out unit not yet started.
    Pending,
    /// Chunks are flowing.
    Streaming,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Error,
}

/// Progress record for one model within a session.
///
/// Invariants enforced by the mutators: `progress` is non-decreasing while
/// streaming; `Completed` implies `progress == 1.0` and `completed == true`;
/// `Error` implies `error` is set. Invalid transitions are logged and ignored
/// rather than corrupting the record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelProgress {
    /// Current lifecycle status.
    pub status: ModelStatus,
    /// Progress estimate in `[0, 1]`.
    pub progress: f32,
    /// True only in terminal success.
    pub completed: bool,
    /// Failure message, set only in terminal failure.
    pub error: Option<String>,
}

impl Default for ModelProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProgress {
    /// Create a fresh pending record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: ModelStatus::Pending,
            progress: 0.0,
            completed: false,
            error: None,
        }
    }

    /// Whether the record is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ModelStatus::Completed | ModelStatus::Error)
    }

    /// Transition pending -> streaming. Returns false on any other source
    /// state.
    pub fn start_streaming(&mut self) -> bool {
        if self.status != ModelStatus::Pending {
            tracing::warn!(status = ?self.status, "Ignoring start_streaming from non-pending state");
            return false;
        }
        self.status = ModelStatus::Streaming;
        true
    }

    /// Raise progress while streaming. Values below the current progress or
    /// above 1.0 are clamped so progress stays monotone. Returns the
    /// effective progress.
    pub fn advance(&mut self, progress: f32) -> f32 {
        if self.status != ModelStatus::Streaming {
            tracing::warn!(status = ?self.status, "Ignoring progress update in non-streaming state");
            return self.progress;
        }
        self.progress = progress.clamp(self.progress, 1.0);
        self.progress
    }

    /// Transition streaming -> completed (terminal success).
    pub fn complete(&mut self) -> bool {
        if self.status != ModelStatus::Streaming {
            tracing::warn!(status = ?self.status, "Ignoring completion from non-streaming state");
            return false;
        }
        self.status = ModelStatus::Completed;
        self.progress = 1.0;
        self.completed = true;
        true
    }

    /// Transition pending|streaming -> error (terminal failure).
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            tracing::warn!(status = ?self.status, "Ignoring failure in terminal state");
            return false;
        }
        self.status = ModelStatus::Error;
        self.error = Some(error.into());
        true
    }
}

/// One model's entry in a session snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelProgressEntry {
    /// The model name.
    pub model: String,
    /// The model's progress record.
    #[serde(flatten)]
    pub progress: ModelProgress,
}

/// Read-only snapshot of a session, for status queries and metrics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The conversation id.
    pub conversation_id: String,
    /// Whether the session is still active.
    pub is_active: bool,
    /// Creation time (Unix ms).
    pub started_at_ms: u64,
    /// Completion time (Unix ms), absent while active.
    pub ended_at_ms: Option<u64>,
    /// Chunk events observed so far.
    pub chunk_count: u64,
    /// Per-model progress in selection order.
    pub models: Vec<ModelProgressEntry>,
}

/// Bookkeeping record for one orchestration run.
#[derive(Debug)]
pub struct StreamSession {
    /// The externally supplied conversation id.
    pub conversation_id: String,
    /// Which transport kind initiated the stream. Informational only; it does
    /// not restrict which transports receive events.
    pub origin: TransportKind,
    /// Whether model work or synthesis is still in flight.
    pub is_active: bool,
    /// Creation time (Unix ms).
    pub started_at_ms: u64,
    /// Completion time (Unix ms), `None` while active.
    pub ended_at_ms: Option<u64>,
    /// Chunk events observed (counted, not replayed; metrics only).
    pub chunk_count: u64,
    started_at: Instant,
    /// Per-model progress, in model selection order.
    progress: Vec<(String, ModelProgress)>,
}

impl StreamSession {
    /// Create a new active session.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, origin: TransportKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            origin,
            is_active: true,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            chunk_count: 0,
            started_at: Instant::now(),
            progress: Vec::new(),
        }
    }

    /// Initialize one pending progress record per model, preserving order.
    /// A model listed twice keeps its first entry.
    pub fn init_models(&mut self, models: &[String]) {
        for model in models {
            if !self.progress.iter().any(|(m, _)| m == model) {
                self.progress.push((model.clone(), ModelProgress::new()));
            }
        }
    }

    /// Mutable access to one model's progress record.
    pub fn progress_mut(&mut self, model: &str) -> Option<&mut ModelProgress> {
        self.progress
            .iter_mut()
            .find(|(m, _)| m == model)
            .map(|(_, p)| p)
    }

    /// Read access to one model's progress record.
    #[must_use]
    pub fn progress(&self, model: &str) -> Option<&ModelProgress> {
        self.progress
            .iter()
            .find(|(m, _)| m == model)
            .map(|(_, p)| p)
    }

    /// Record one chunk event.
    pub fn record_chunk(&mut self) {
        self.chunk_count += 1;
    }

    /// Session age since creation.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Wall-clock duration in milliseconds (up to now while active).
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        match self.ended_at_ms {
            Some(end) => end.saturating_sub(self.started_at_ms),
            None => self.age().as_millis() as u64,
        }
    }

    /// Mark the session inactive and stamp its end time. Idempotent.
    pub fn finish(&mut self) {
        if self.is_active {
            self.is_active = false;
            self.ended_at_ms = Some(now_ms());
        }
    }

    /// Snapshot for status queries.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            is_active: self.is_active,
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
            chunk_count: self.chunk_count,
            models: self
                .progress
                .iter()
                .map(|(model, progress)| ModelProgressEntry {
                    model: model.clone(),
                    progress: progress.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_happy_path() {
        let mut p = ModelProgress::new();
        assert_eq!(p.status, ModelStatus::Pending);
        assert!(p.start_streaming());
        assert_eq!(p.advance(0.3), 0.3);
        assert_eq!(p.advance(0.7), 0.7);
        assert!(p.complete());
        assert_eq!(p.status, ModelStatus::Completed);
        assert_eq!(p.progress, 1.0);
        assert!(p.completed);
        assert!(p.error.is_none());
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut p = ModelProgress::new();
        p.start_streaming();
        p.advance(0.5);
        // Regression attempts are clamped
        assert_eq!(p.advance(0.2), 0.5);
        // Overshoot is clamped to 1.0
        assert_eq!(p.advance(7.0), 1.0);
    }

    #[test]
    fn test_progress_failure_path() {
        let mut p = ModelProgress::new();
        p.start_streaming();
        assert!(p.fail("connection refused"));
        assert_eq!(p.status, ModelStatus::Error);
        assert_eq!(p.error.as_deref(), Some("connection refused"));
        assert!(!p.completed);

        // Failing straight from pending is also legal
        let mut p = ModelProgress::new();
        assert!(p.fail("no credentials"));
        assert_eq!(p.status, ModelStatus::Error);
    }

    #[test]
    fn test_invalid_transitions_are_ignored() {
        let mut p = ModelProgress::new();
        // Cannot complete before streaming
        assert!(!p.complete());
        assert_eq!(p.status, ModelStatus::Pending);

        p.start_streaming();
        p.complete();
        // Terminal states are frozen
        assert!(!p.start_streaming());
        assert!(!p.fail("too late"));
        assert_eq!(p.status, ModelStatus::Completed);
        assert!(p.error.is_none());

        // Progress updates outside streaming are no-ops
        assert_eq!(p.advance(0.1), 1.0);
    }

    #[test]
    fn test_session_model_order_preserved() {
        let mut session = StreamSession::new("conv-1", TransportKind::Socket);
        session.init_models(&[
            "gamma".to_string(),
            "alpha".to_string(),
            "gamma".to_string(),
        ]);

        let snapshot = session.snapshot();
        let names: Vec<&str> = snapshot.models.iter().map(|e| e.model.as_str()).collect();
        assert_eq!(names, vec!["gamma", "alpha"]);
    }

    #[test]
    fn test_session_finish_is_idempotent() {
        let mut session = StreamSession::new("conv-2", TransportKind::Room);
        assert!(session.is_active);
        session.finish();
        assert!(!session.is_active);
        let first_end = session.ended_at_ms;
        session.finish();
        assert_eq!(session.ended_at_ms, first_end);
    }

    #[test]
    fn test_session_chunk_counter() {
        let mut session = StreamSession::new("conv-3", TransportKind::HttpPush);
        session.record_chunk();
        session.record_chunk();
        assert_eq!(session.chunk_count, 2);
        assert_eq!(session.snapshot().chunk_count, 2);
    }
}
