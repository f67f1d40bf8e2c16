//! Response Synthesis
//!
//! Combines the responses collected from multiple models into one answer,
//! proportionally to adjustable per-model weights. The weight table is
//! instance state, owned by whoever wires the application together; there is
//! no process-global table.
//!
//! The combination is deterministic: given identical responses and weights,
//! the output is byte-identical. A single response passes through verbatim.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::SynthesisConfig;
use crate::error::OrchestrationError;

/// Baseline weight for a model with no recorded adjustments.
pub const DEFAULT_WEIGHT: f32 = 1.0;

/// Weighted multi-response synthesizer.
pub struct Synthesizer {
    weights: RwLock<HashMap<String, f32>>,
    config: SynthesisConfig,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(SynthesisConfig::default())
    }
}

impl Synthesizer {
    /// Create a synthesizer with the given weight bounds.
    #[must_use]
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Resolve the effective weight for a model: an explicit entry in
    /// `custom` wins, then the persisted weight, then the 1.0 baseline.
    #[must_use]
    pub fn resolve_weight(&self, model: &str, custom: Option<&HashMap<String, f32>>) -> f32 {
        if let Some(w) = custom.and_then(|c| c.get(model)) {
            return w.clamp(self.config.weight_floor, self.config.weight_ceiling);
        }
        self.weights
            .read()
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Combine `(model, response)` pairs into one answer.
    ///
    /// A single response is returned exactly as-is. With multiple responses,
    /// each model contributes an excerpt whose length scales with its weight
    /// relative to the heaviest model; sections are ordered by descending
    /// weight (ties keep input order) and carry a `[model]` attribution.
    pub fn synthesize(
        &self,
        responses: &[(String, String)],
        custom: Option<&HashMap<String, f32>>,
    ) -> Result<String, OrchestrationError> {
        match responses {
            [] => Err(OrchestrationError::SynthesisFailed(
                "no responses to combine".to_string(),
            )),
            [(_, only)] => Ok(only.clone()),
            _ => Ok(self.combine(responses, custom)),
        }
    }

    fn combine(
        &self,
        responses: &[(String, String)],
        custom: Option<&HashMap<String, f32>>,
    ) -> String {
        let mut weighted: Vec<(&str, &str, f32)> = responses
            .iter()
            .map(|(model, text)| (model.as_str(), text.as_str(), self.resolve_weight(model, custom)))
            .collect();

        // Stable sort: equal weights keep the request's selection order.
        weighted.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let max_weight = weighted
            .first()
            .map(|(_, _, w)| *w)
            .unwrap_or(DEFAULT_WEIGHT)
            .max(f32::EPSILON);

        let mut sections = Vec::with_capacity(weighted.len());
        for (model, text, weight) in weighted {
            let words: Vec<&str> = text.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            let share = (weight / max_weight).clamp(0.0, 1.0);
            let take = ((words.len() as f32 * share).ceil() as usize)
                .max(1)
                .min(words.len());
            sections.push(format!("[{model}] {}", words[..take].join(" ")));
        }
        sections.join("\n\n")
    }

    /// Adjust a model's persisted weight by `delta`, clamped into the
    /// configured `[floor, ceiling]` band. Returns the new weight.
    pub fn update_weight(&self, model: &str, delta: f32) -> f32 {
        let mut weights = self.weights.write();
        let entry = weights.entry(model.to_string()).or_insert(DEFAULT_WEIGHT);
        *entry = (*entry + delta).clamp(self.config.weight_floor, self.config.weight_ceiling);
        tracing::debug!(model, weight = *entry, "Model weight updated");
        *entry
    }

    /// Restore every persisted weight to the 1.0 baseline.
    pub fn reset_weights(&self) {
        let mut weights = self.weights.write();
        for weight in weights.values_mut() {
            *weight = DEFAULT_WEIGHT;
        }
        tracing::debug!("Model weights reset");
    }

    /// Read-only snapshot of the persisted weight table.
    #[must_use]
    pub fn weights(&self) -> HashMap<String, f32> {
        self.weights.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(model: &str, text: &str) -> (String, String) {
        (model.to_string(), text.to_string())
    }

    #[test]
    fn test_single_response_passthrough_is_exact() {
        let synth = Synthesizer::default();
        let responses = vec![pair("alpha", "x")];
        assert_eq!(synth.synthesize(&responses, None).unwrap(), "x");

        let responses = vec![pair("alpha", "  spacing preserved\texactly ")];
        assert_eq!(
            synth.synthesize(&responses, None).unwrap(),
            "  spacing preserved\texactly "
        );
    }

    #[test]
    fn test_empty_input_fails() {
        let synth = Synthesizer::default();
        let result = synth.synthesize(&[], None);
        assert!(matches!(
            result,
            Err(OrchestrationError::SynthesisFailed(_))
        ));
    }

    #[test]
    fn test_combination_is_deterministic() {
        let synth = Synthesizer::default();
        let responses = vec![
            pair("alpha", "one two three four"),
            pair("beta", "five six seven eight"),
        ];
        let first = synth.synthesize(&responses, None).unwrap();
        let second = synth.synthesize(&responses, None).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("[alpha]"));
        assert!(first.contains("[beta]"));
    }

    #[test]
    fn test_higher_weight_means_greater_presence() {
        let synth = Synthesizer::default();
        synth.update_weight("alpha", 1.0); // 2.0
        let responses = vec![
            pair("alpha", "a1 a2 a3 a4 a5 a6 a7 a8 a9 a10"),
            pair("beta", "b1 b2 b3 b4 b5 b6 b7 b8 b9 b10"),
        ];
        let combined = synth.synthesize(&responses, None).unwrap();

        let alpha_words = combined.split_whitespace().filter(|w| w.starts_with('a')).count();
        let beta_words = combined.split_whitespace().filter(|w| w.starts_with('b')).count();
        assert!(
            alpha_words > beta_words,
            "alpha ({alpha_words} words) should dominate beta ({beta_words} words)"
        );
        // Heaviest model keeps its full response; beta is halved (2.0 vs 1.0)
        assert!(combined.contains("a10"));
        assert!(!combined.contains("b6"));
    }

    #[test]
    fn test_heaviest_section_comes_first() {
        let synth = Synthesizer::default();
        synth.update_weight("beta", 0.5);
        let responses = vec![pair("alpha", "aa bb"), pair("beta", "cc dd")];
        let combined = synth.synthesize(&responses, None).unwrap();
        let beta_pos = combined.find("[beta]").unwrap();
        let alpha_pos = combined.find("[alpha]").unwrap();
        assert!(beta_pos < alpha_pos);
    }

    #[test]
    fn test_custom_weights_override_persisted() {
        let synth = Synthesizer::default();
        synth.update_weight("alpha", 2.0); // persisted 3.0
        let custom = HashMap::from([("alpha".to_string(), 0.5)]);
        assert_eq!(synth.resolve_weight("alpha", Some(&custom)), 0.5);
        assert_eq!(synth.resolve_weight("alpha", None), 3.0);
        assert_eq!(synth.resolve_weight("unknown", None), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_weight_clamping() {
        let synth = Synthesizer::default();
        // Repeated positive feedback saturates at the ceiling
        for _ in 0..10 {
            synth.update_weight("alpha", 1.0);
        }
        assert_eq!(synth.weights()["alpha"], 3.0);

        // Repeated negative feedback saturates at the floor
        for _ in 0..10 {
            synth.update_weight("beta", -1.0);
        }
        let beta = synth.weights()["beta"];
        assert!((beta - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reset_weights() {
        let synth = Synthesizer::default();
        synth.update_weight("alpha", 1.5);
        synth.update_weight("beta", -0.5);
        synth.reset_weights();
        for weight in synth.weights().values() {
            assert_eq!(*weight, DEFAULT_WEIGHT);
        }
    }

    #[test]
    fn test_whitespace_only_response_is_skipped() {
        let synth = Synthesizer::default();
        let responses = vec![pair("alpha", "   "), pair("beta", "real content")];
        let combined = synth.synthesize(&responses, None).unwrap();
        assert_eq!(combined, "[beta] real content");
    }
}
