//! Scripted Backend
//!
//! A deterministic [`ModelBackend`] with pre-programmed behavior: a fixed
//! response, an optional native chunk script, and optional failure
//! injection. Used throughout the test suite and by the daemon's demo mode,
//! where no real inference server is available.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{ModelBackend, StreamChunk};

/// A backend that replays a script instead of calling a provider.
pub struct ScriptedBackend {
    name: String,
    response: String,
    chunks: Option<Vec<String>>,
    failure: Option<String>,
    available: bool,
    chunk_delay: Duration,
}

impl ScriptedBackend {
    /// A non-streaming backend that answers every prompt with `response`.
    pub fn completing(name: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: response.into(),
            chunks: None,
            failure: None,
            available: true,
            chunk_delay: Duration::ZERO,
        }
    }

    /// A natively streaming backend that yields `chunks` in order.
    pub fn streaming(name: impl Into<String>, chunks: Vec<&str>) -> Self {
        let chunks: Vec<String> = chunks.into_iter().map(String::from).collect();
        Self {
            name: name.into(),
            response: chunks.concat(),
            chunks: Some(chunks),
            failure: None,
            available: true,
            chunk_delay: Duration::ZERO,
        }
    }

    /// A backend whose every call fails with `error`.
    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: String::new(),
            chunks: None,
            failure: Some(error.into()),
            available: true,
            chunk_delay: Duration::ZERO,
        }
    }

    /// A streaming backend that yields `chunks` then fails with `error`.
    pub fn failing_mid_stream(
        name: impl Into<String>,
        chunks: Vec<&str>,
        error: impl Into<String>,
    ) -> Self {
        let mut backend = Self::streaming(name, chunks);
        backend.failure = Some(error.into());
        backend
    }

    /// A backend that reports itself unavailable (missing credentials).
    pub fn unavailable(name: impl Into<String>) -> Self {
        let mut backend = Self::completing(name, "");
        backend.available = false;
        backend
    }

    /// Add a fixed delay between scripted chunks.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        if let Some(error) = &self.failure {
            anyhow::bail!("{error}");
        }
        Ok(self.response.clone())
    }

    fn supports_streaming(&self) -> bool {
        self.chunks.is_some()
    }

    async fn stream_generate(&self, _prompt: &str) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        let Some(chunks) = self.chunks.clone() else {
            anyhow::bail!("{} does not support incremental streaming", self.name);
        };

        let (tx, rx) = mpsc::channel(chunks.len().max(1) + 1);
        let failure = self.failure.clone();
        let message = self.response.clone();
        let delay = self.chunk_delay;

        tokio::spawn(async move {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(StreamChunk::Text(chunk)).await.is_err() {
                    return;
                }
            }
            let terminal = match failure {
                Some(error) => StreamChunk::Error(error),
                None => StreamChunk::Done { message },
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completing_backend() {
        let backend = ScriptedBackend::completing("alpha", "the answer");
        assert_eq!(backend.name(), "alpha");
        assert!(backend.is_available().await);
        assert!(!backend.supports_streaming());
        assert_eq!(backend.generate("q").await.unwrap(), "the answer");
    }

    #[tokio::test]
    async fn test_streaming_backend_yields_script() {
        let backend = ScriptedBackend::streaming("beta", vec!["be", "ta"]);
        assert!(backend.supports_streaming());

        let mut rx = backend.stream_generate("q").await.unwrap();
        let mut texts = Vec::new();
        let mut done = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Text(t) => texts.push(t),
                StreamChunk::Done { message } => done = Some(message),
                StreamChunk::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(texts, vec!["be", "ta"]);
        assert_eq!(done.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = ScriptedBackend::failing("gamma", "quota exhausted");
        let err = backend.generate("q").await.unwrap_err();
        assert_eq!(err.to_string(), "quota exhausted");
    }

    #[tokio::test]
    async fn test_failing_mid_stream() {
        let backend = ScriptedBackend::failing_mid_stream("delta", vec!["par"], "cut off");
        let mut rx = backend.stream_generate("q").await.unwrap();

        assert!(matches!(rx.recv().await, Some(StreamChunk::Text(t)) if t == "par"));
        assert!(matches!(rx.recv().await, Some(StreamChunk::Error(e)) if e == "cut off"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let backend = ScriptedBackend::unavailable("offline");
        assert!(!backend.is_available().await);
    }
}
