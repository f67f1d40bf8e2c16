//! Ollama Backend
//!
//! Model backend for an Ollama-style local inference server, speaking
//! newline-delimited JSON on the generate endpoint. This is the bundled
//! reference implementation of the [`ModelBackend`] capability; exact wire
//! compatibility with any particular vendor release is not a goal.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{ModelBackend, StreamChunk};

/// Backend for one model served by an Ollama-compatible server.
#[derive(Clone)]
pub struct OllamaBackend {
    model: String,
    host: String,
    port: u16,
    http: reqwest::Client,
}

impl OllamaBackend {
    /// Create a backend for `model` at `host:port`.
    pub fn new(model: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            model: model.into(),
            host: host.into(),
            port,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Create a backend for `model` using `OLLAMA_HOST` / `OLLAMA_PORT`
    /// (defaulting to localhost:11434).
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        Self::new(model, host, port)
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    fn request_body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
        })
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        self.http
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .http
            .post(self.generate_url())
            .json(&self.request_body(prompt, false))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;
        Ok(data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream_generate(&self, prompt: &str) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        let response = self
            .http
            .post(self.generate_url())
            .json(&self.request_body(prompt, true))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama returned {status}: {body}");
        }

        let (tx, rx) = mpsc::channel(100);
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut line_buf = String::new();
            let mut full_response = String::new();

            while let Some(bytes) = body.next().await {
                let bytes = match bytes {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&bytes));

                // One JSON object per line
                while let Some(pos) = line_buf.find('\n') {
                    let line = line_buf[..pos].trim().to_string();
                    line_buf.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };

                    if let Some(fragment) = data.get("response").and_then(|r| r.as_str()) {
                        if !fragment.is_empty() {
                            full_response.push_str(fragment);
                            if tx
                                .send(StreamChunk::Text(fragment.to_string()))
                                .await
                                .is_err()
                            {
                                // Receiver dropped, stop streaming
                                return;
                            }
                        }
                    }

                    if data
                        .get("done")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                    {
                        let _ = tx
                            .send(StreamChunk::Done {
                                message: full_response,
                            })
                            .await;
                        return;
                    }
                }
            }

            // Stream ended without a done marker
            if full_response.is_empty() {
                let _ = tx
                    .send(StreamChunk::Error(
                        "ollama stream ended unexpectedly".to_string(),
                    ))
                    .await;
            } else {
                let _ = tx
                    .send(StreamChunk::Done {
                        message: full_response,
                    })
                    .await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_urls() {
        let backend = OllamaBackend::new("llama3", "localhost", 11434);
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(
            backend.generate_url(),
            "http://localhost:11434/api/generate"
        );
        assert_eq!(backend.tags_url(), "http://localhost:11434/api/tags");
        assert_eq!(backend.name(), "llama3");
        assert!(backend.supports_streaming());
    }

    #[test]
    fn test_request_body_shape() {
        let backend = OllamaBackend::new("llama3", "localhost", 11434);
        let body = backend.request_body("hello", true);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["stream"], true);
    }
}
