//! Orchestrator
//!
//! Drives one streaming request end-to-end: fan out the prompt to every
//! enabled model backend in parallel, fan their chunked output into the
//! registry's broadcast stream, join on all of them, then synthesize and
//! stream the combined answer.
//!
//! # Join policy
//!
//! The fan-in waits for every launched unit to settle, success or failure.
//! One model failing never aborts its siblings; synthesis starts only after
//! the last unit settles, with whatever subset succeeded.
//!
//! # Simulated streaming
//!
//! A backend without native streaming is called once and its full response is
//! fragmented into word groups with randomized inter-fragment delays. The
//! emitted events are shaped identically to native streaming, so subscribers
//! cannot distinguish the two paths.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backend::{ModelBackend, StreamChunk};
use crate::config::StreamingConfig;
use crate::error::OrchestrationError;
use crate::events::EventPayload;
use crate::registry::StreamRegistry;
use crate::synthesis::Synthesizer;

/// Which models a request enables, in selection order.
///
/// JSON-wise this is a plain object of `model -> bool`, but insertion order
/// is significant (it becomes the fan-out and progress-reporting order), so
/// it is stored as an ordered list rather than a hash map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelConfig(Vec<(String, bool)>);

impl ModelConfig {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a model (builder style).
    #[must_use]
    pub fn enable(mut self, model: impl Into<String>) -> Self {
        self.set(model, true);
        self
    }

    /// Disable a model (builder style).
    #[must_use]
    pub fn disable(mut self, model: impl Into<String>) -> Self {
        self.set(model, false);
        self
    }

    /// Set a model's enabled flag. A repeated model keeps its original
    /// position but takes the new value.
    pub fn set(&mut self, model: impl Into<String>, enabled: bool) {
        let model = model.into();
        match self.0.iter_mut().find(|(m, _)| *m == model) {
            Some((_, flag)) => *flag = enabled,
            None => self.0.push((model, enabled)),
        }
    }

    /// The enabled models, preserving insertion order.
    #[must_use]
    pub fn enabled_models(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Whether no models are listed at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ModelConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (model, enabled) in &self.0 {
            map.serialize_entry(model, enabled)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ModelConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModelConfigVisitor;

        impl<'de> Visitor<'de> for ModelConfigVisitor {
            type Value = ModelConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of model name to enabled flag")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut config = ModelConfig::new();
                while let Some((model, enabled)) = access.next_entry::<String, bool>()? {
                    config.set(model, enabled);
                }
                Ok(config)
            }
        }

        deserializer.deserialize_map(ModelConfigVisitor)
    }
}

/// An inbound streaming request, as handed over by the front door.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// The user prompt. Must be non-empty.
    pub prompt: String,
    /// The conversation to stream into.
    #[serde(default)]
    pub conversation_id: String,
    /// Which models to fan out to.
    pub model_config: ModelConfig,
    /// Per-request weight overrides for synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_weights: Option<HashMap<String, f32>>,
}

/// Fans a request out to model backends and fans results back in.
pub struct Orchestrator {
    registry: StreamRegistry,
    synthesizer: Arc<Synthesizer>,
    backends: HashMap<String, Arc<dyn ModelBackend>>,
    config: StreamingConfig,
}

impl Orchestrator {
    /// Create an orchestrator over a registry and synthesizer. The streaming
    /// configuration is taken from the registry so lifecycle timers and
    /// chunking constants agree.
    #[must_use]
    pub fn new(registry: StreamRegistry, synthesizer: Arc<Synthesizer>) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            synthesizer,
            backends: HashMap::new(),
            config,
        }
    }

    /// Register a backend under its model name.
    pub fn register_backend(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// The registry this orchestrator broadcasts through.
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// The synthesizer used for weighted combination.
    #[must_use]
    pub fn synthesizer(&self) -> &Arc<Synthesizer> {
        &self.synthesizer
    }

    /// Process one streaming request against its already-opened session.
    ///
    /// Returns the synthesized answer on success. Whatever happens inside --
    /// partial failure, total failure, synthesis error -- the session is
    /// always completed before returning, so it never lingers in the active
    /// map.
    pub async fn run(&self, request: &StreamRequest) -> Result<String, OrchestrationError> {
        let conversation_id = request.conversation_id.as_str();
        if !self.registry.has_session(conversation_id) {
            return Err(OrchestrationError::SessionNotFound(
                conversation_id.to_string(),
            ));
        }

        let result = self.drive(request).await;
        self.registry.complete_stream(conversation_id);
        result
    }

    async fn drive(&self, request: &StreamRequest) -> Result<String, OrchestrationError> {
        let conversation_id = request.conversation_id.as_str();

        if request.prompt.trim().is_empty() {
            let err = OrchestrationError::EmptyPrompt;
            self.registry.broadcast(
                conversation_id,
                EventPayload::StreamError {
                    error: err.to_string(),
                },
            );
            return Err(err);
        }

        let models = request.model_config.enabled_models();
        if models.is_empty() {
            let err = OrchestrationError::NoModelsEnabled;
            self.registry.broadcast(
                conversation_id,
                EventPayload::StreamError {
                    error: err.to_string(),
                },
            );
            return Err(err);
        }

        self.registry
            .with_session(conversation_id, |session| session.init_models(&models));
        self.registry.broadcast(
            conversation_id,
            EventPayload::StreamStarted {
                models: models.clone(),
                total_models: models.len(),
            },
        );
        tracing::info!(
            conversation_id,
            models = ?models,
            "Fanning out to model backends"
        );

        // Unordered parallel fan-out: every unit starts now, none waits for
        // a sibling.
        let mut handles = Vec::with_capacity(models.len());
        for model in &models {
            let unit = ModelUnit {
                registry: self.registry.clone(),
                config: self.config.clone(),
                conversation_id: conversation_id.to_string(),
                model: model.clone(),
                prompt: request.prompt.clone(),
                backend: self.backends.get(model).cloned(),
            };
            handles.push(tokio::spawn(unit.run()));
        }

        // Fan-in barrier: settle all, regardless of individual failures.
        let settled = futures::future::join_all(handles).await;

        let mut successes: Vec<(String, String)> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for (model, outcome) in models.iter().zip(settled) {
            match outcome {
                Ok(Ok(text)) => successes.push((model.clone(), text)),
                Ok(Err(error)) => {
                    tracing::warn!(model = %model, error = %error, "Model unit failed");
                    failures.push(model.clone());
                }
                Err(join_error) => {
                    tracing::error!(model = %model, error = %join_error, "Model unit crashed");
                    self.registry.with_session(conversation_id, |session| {
                        if let Some(progress) = session.progress_mut(model) {
                            progress.fail(format!("unit crashed: {join_error}"));
                        }
                    });
                    failures.push(model.clone());
                }
            }
        }

        if successes.is_empty() {
            let err = OrchestrationError::AllModelsFailed { models: failures };
            self.registry.broadcast(
                conversation_id,
                EventPayload::StreamError {
                    error: err.to_string(),
                },
            );
            return Err(err);
        }
        if !failures.is_empty() {
            tracing::warn!(
                conversation_id,
                failed = ?failures,
                succeeded = successes.len(),
                "Synthesizing from partial results"
            );
        }

        self.stream_synthesis(conversation_id, &successes, request.custom_weights.as_ref())
            .await
    }

    /// Stream the synthesized answer: finer-grained fragments than per-model
    /// streaming, so the combination step reads as deliberate.
    async fn stream_synthesis(
        &self,
        conversation_id: &str,
        responses: &[(String, String)],
        custom_weights: Option<&HashMap<String, f32>>,
    ) -> Result<String, OrchestrationError> {
        self.registry.broadcast(
            conversation_id,
            EventPayload::SynthesisStarted {
                models: responses.iter().map(|(model, _)| model.clone()).collect(),
            },
        );

        let combined = match self.synthesizer.synthesize(responses, custom_weights) {
            Ok(combined) => combined,
            Err(err) => {
                self.registry.broadcast(
                    conversation_id,
                    EventPayload::SynthesisError {
                        error: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        let fragments = fragment_text(&combined, self.config.synthesis_fragments);
        let total = fragments.len().max(1);
        for (index, chunk) in fragments.into_iter().enumerate() {
            tokio::time::sleep(self.config.synthesis_chunk_delay.sample()).await;
            if !self.registry.session_is_active(conversation_id) {
                tracing::debug!(conversation_id, "Session closed mid-synthesis; stopping");
                return Ok(combined);
            }
            self.registry.broadcast(
                conversation_id,
                EventPayload::SynthesisChunk {
                    chunk,
                    progress: (index + 1) as f32 / total as f32,
                },
            );
        }

        self.registry.broadcast(
            conversation_id,
            EventPayload::SynthesisCompleted {
                final_response: combined.clone(),
            },
        );
        Ok(combined)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One per-model fan-out unit: obtains a single model's full answer as a
/// sequence of progress-bearing chunk events.
struct ModelUnit {
    registry: StreamRegistry,
    config: StreamingConfig,
    conversation_id: String,
    model: String,
    prompt: String,
    backend: Option<Arc<dyn ModelBackend>>,
}

impl ModelUnit {
    /// Run to a settled outcome. The error string is this model's failure
    /// reason; it is recorded in the session and aggregated by the caller,
    /// never raised past the fan-in.
    async fn run(self) -> Result<String, String> {
        let outcome = self.execute().await;
        match &outcome {
            Ok(_) => {
                self.with_progress(|p| {
                    p.complete();
                });
            }
            Err(error) => {
                let error = error.clone();
                self.with_progress(move |p| {
                    p.fail(error);
                });
            }
        }
        outcome
    }

    async fn execute(&self) -> Result<String, String> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| format!("no backend registered for model {}", self.model))?;
        if !backend.is_available().await {
            return Err(format!(
                "backend for {} is not available (credentials not configured?)",
                self.model
            ));
        }

        self.with_progress(|p| {
            p.start_streaming();
        });
        self.registry.broadcast(
            &self.conversation_id,
            EventPayload::ModelStreamStarted {
                model: self.model.clone(),
            },
        );

        if backend.supports_streaming() {
            self.consume_native_stream(backend.as_ref()).await
        } else {
            self.simulate_stream(backend.as_ref()).await
        }
    }

    /// Consume a backend's native chunk stream. Progress is estimated against
    /// the configured target response length.
    async fn consume_native_stream(&self, backend: &dyn ModelBackend) -> Result<String, String> {
        let mut rx = backend
            .stream_generate(&self.prompt)
            .await
            .map_err(|e| e.to_string())?;

        let mut buffer = String::new();
        let target_len = self.config.target_response_len.max(1) as f32;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Text(text) => {
                    buffer.push_str(&text);
                    let progress = (buffer.len() as f32 / target_len).min(1.0);
                    if !self.emit_chunk(&text, progress) {
                        // Session force-completed underneath us; the orphaned
                        // call stops emitting and returns what it has.
                        return Ok(buffer);
                    }
                }
                StreamChunk::Done { message } => {
                    return Ok(if message.is_empty() { buffer } else { message });
                }
                StreamChunk::Error(error) => return Err(error),
            }
        }
        Err("model stream ended unexpectedly".to_string())
    }

    /// Blocking generation plus synthetic fragmentation. Emits the same event
    /// shape as native streaming.
    async fn simulate_stream(&self, backend: &dyn ModelBackend) -> Result<String, String> {
        let text = backend
            .generate(&self.prompt)
            .await
            .map_err(|e| e.to_string())?;

        let fragments = fragment_text(&text, self.config.model_fragments);
        let total = fragments.len().max(1);
        for (index, fragment) in fragments.iter().enumerate() {
            tokio::time::sleep(self.config.model_chunk_delay.sample()).await;
            let progress = (index + 1) as f32 / total as f32;
            if !self.emit_chunk(fragment, progress) {
                break;
            }
        }
        Ok(text)
    }

    /// Advance progress and broadcast one chunk. Returns false when the
    /// session is no longer active and emission should stop.
    fn emit_chunk(&self, text: &str, progress: f32) -> bool {
        if !self.registry.session_is_active(&self.conversation_id) {
            tracing::debug!(
                model = %self.model,
                conversation_id = %self.conversation_id,
                "Session no longer active; stopping chunk emission"
            );
            return false;
        }
        self.with_progress(|p| {
            p.advance(progress);
        });
        self.registry.broadcast(
            &self.conversation_id,
            EventPayload::ModelChunk {
                model: self.model.clone(),
                chunk: text.to_string(),
                progress,
            },
        );
        true
    }

    fn with_progress(&self, f: impl FnOnce(&mut crate::session::ModelProgress)) {
        self.registry.with_session(&self.conversation_id, |session| {
            if let Some(progress) = session.progress_mut(&self.model) {
                f(progress);
            }
        });
    }
}

/// Split text into roughly `target_fragments` word groups. Returns an empty
/// vector for whitespace-only input.
#[must_use]
pub fn fragment_text(text: &str, target_fragments: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let per_fragment = words.len().div_ceil(target_fragments.max(1));
    words
        .chunks(per_fragment)
        .map(|group| group.join(" "))
        .collect()
}
