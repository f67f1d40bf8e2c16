//! Model Backend Trait
//!
//! The capability the orchestrator consumes: blocking generation is required,
//! incremental streaming is optional. A backend that does not stream natively
//! still produces the same external event shape, because the per-model
//! fan-out unit fragments its blocking response synthetically -- subscribers
//! cannot tell the two paths apart.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One item from a backend's native chunk stream.
#[derive(Clone, Debug)]
pub enum StreamChunk {
    /// An incremental text fragment.
    Text(String),
    /// The stream finished.
    Done {
        /// The complete response (may differ from the concatenated fragments
        /// if the provider cleans up the final text).
        message: String,
    },
    /// The stream failed.
    Error(String),
}

/// Uniform capability wrapping one AI model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// The model name this backend answers for. This is the key the
    /// orchestrator matches against the request's model configuration.
    fn name(&self) -> &str;

    /// Whether the backend is usable (credentials configured, reachable).
    async fn is_available(&self) -> bool;

    /// Generate the full response for a prompt in one call.
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;

    /// Whether [`stream_generate`](ModelBackend::stream_generate) is
    /// supported. When false, the fan-out unit falls back to `generate` plus
    /// synthetic fragmentation.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Start an incremental generation, returning a channel of chunks. The
    /// channel closes after `Done` or `Error`.
    async fn stream_generate(&self, _prompt: &str) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        anyhow::bail!("{} does not support incremental streaming", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BlockingOnly;

    #[async_trait]
    impl ModelBackend for BlockingOnly {
        fn name(&self) -> &str {
            "blocking-only"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("answer".to_string())
        }
    }

    #[tokio::test]
    async fn test_default_streaming_is_unsupported() {
        let backend = BlockingOnly;
        assert!(!backend.supports_streaming());
        let result = backend.stream_generate("hi").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("blocking-only"));
    }
}
