//! Configuration
//!
//! All tunables of the orchestration core live here, with three sources in
//! precedence order: environment variables, an optional TOML file, then
//! built-in defaults. The streaming constants (fragment counts, delay ranges,
//! target chunk length) are configuration rather than magic numbers so that
//! simulated streaming can be tuned without touching orchestration logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

/// Errors loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file contents were not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

/// An inclusive delay range in milliseconds, sampled per fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    /// Minimum delay in milliseconds.
    pub min_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_ms: u64,
}

impl DelayRange {
    /// Create a new range. `max_ms` is raised to `min_ms` if inverted.
    #[must_use]
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// A zero-delay range, useful in tests.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Sample a delay from the range.
    #[must_use]
    pub fn sample(&self) -> Duration {
        let ms = if self.min_ms >= self.max_ms {
            self.min_ms
        } else {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }
}

/// Stream lifecycle and chunking configuration.
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// Maximum concurrently active stream sessions (admission control).
    pub max_concurrent_streams: usize,
    /// A session older than this is force-completed by the expiry sweep.
    pub max_stream_age: Duration,
    /// Interval between expiry sweep ticks.
    pub sweep_interval: Duration,
    /// How long a completed session stays readable before removal.
    pub completed_retention: Duration,
    /// Heuristic response length (chars) used for progress estimation when a
    /// backend streams natively. An approximation, not a token count.
    pub target_response_len: usize,
    /// Fragment count for synthetic per-model chunking.
    pub model_fragments: usize,
    /// Fragment count for synthesis chunking (finer than per-model).
    pub synthesis_fragments: usize,
    /// Delay between synthetic per-model fragments.
    pub model_chunk_delay: DelayRange,
    /// Delay between synthesis fragments.
    pub synthesis_chunk_delay: DelayRange,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 10,
            max_stream_age: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            completed_retention: Duration::from_secs(5),
            target_response_len: 1000,
            model_fragments: 10,
            synthesis_fragments: 15,
            model_chunk_delay: DelayRange::new(100, 300),
            synthesis_chunk_delay: DelayRange::new(150, 450),
        }
    }
}

impl StreamingConfig {
    /// A configuration with all artificial delays removed and short lifecycle
    /// timers, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            completed_retention: Duration::from_millis(50),
            model_chunk_delay: DelayRange::zero(),
            synthesis_chunk_delay: DelayRange::zero(),
            ..Self::default()
        }
    }
}

/// Synthesizer weight configuration.
#[derive(Clone, Debug)]
pub struct SynthesisConfig {
    /// Lowest weight a model may be adjusted down to.
    pub weight_floor: f32,
    /// Highest weight a model may be adjusted up to (3x the 1.0 baseline;
    /// prevents runaway dominance after repeated positive feedback).
    pub weight_ceiling: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            weight_floor: 0.1,
            weight_ceiling: 3.0,
        }
    }
}

/// Transport server configuration.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Bind address for the persistent push-socket server.
    pub socket_addr: String,
    /// Bind address for the HTTP server-push (SSE) server.
    pub http_addr: String,
    /// Bind address for the room-broadcast WebSocket server.
    pub room_addr: String,
    /// Heartbeat interval for the HTTP push transport (keeps proxies from
    /// timing out idle connections).
    pub heartbeat_interval: Duration,
    /// Per-room broadcast channel capacity.
    pub room_channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_addr: "127.0.0.1:9470".to_string(),
            http_addr: "127.0.0.1:9471".to_string(),
            room_addr: "127.0.0.1:9472".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            room_channel_capacity: 256,
        }
    }
}

/// Top-level configuration for the chorus core.
#[derive(Clone, Debug, Default)]
pub struct ChorusConfig {
    /// Stream lifecycle and chunking.
    pub streaming: StreamingConfig,
    /// Synthesizer weights.
    pub synthesis: SynthesisConfig,
    /// Transport servers.
    pub transport: TransportConfig,
}

impl ChorusConfig {
    /// Load configuration: defaults, overlaid by the TOML file at `path` (if
    /// it exists), overlaid by environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        if let Some(path) = path {
            if path.exists() {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let file: ChorusFileConfig =
                    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                file.apply(&mut config);
                tracing::info!(path = %path.display(), "Loaded configuration file");
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides (`CHORUS_*`).
    pub fn apply_env(&mut self) {
        if let Some(n) = env_parse::<usize>("CHORUS_MAX_STREAMS") {
            self.streaming.max_concurrent_streams = n;
        }
        if let Some(ms) = env_parse::<u64>("CHORUS_MAX_STREAM_AGE_MS") {
            self.streaming.max_stream_age = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CHORUS_SWEEP_INTERVAL_MS") {
            self.streaming.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("CHORUS_TARGET_RESPONSE_LEN") {
            self.streaming.target_response_len = n;
        }
        if let Some(addr) = std::env::var("CHORUS_SOCKET_ADDR").ok().filter(|s| !s.is_empty()) {
            self.transport.socket_addr = addr;
        }
        if let Some(addr) = std::env::var("CHORUS_HTTP_ADDR").ok().filter(|s| !s.is_empty()) {
            self.transport.http_addr = addr;
        }
        if let Some(addr) = std::env::var("CHORUS_ROOM_ADDR").ok().filter(|s| !s.is_empty()) {
            self.transport.room_addr = addr;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Default config file path under the XDG config directory.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chorus").join("config.toml"))
}

/// On-disk TOML schema. Every field is optional; present fields overlay the
/// defaults. Durations are expressed in milliseconds.
#[derive(Debug, Default, Deserialize)]
struct ChorusFileConfig {
    streaming: Option<StreamingFileConfig>,
    synthesis: Option<SynthesisFileConfig>,
    transport: Option<TransportFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamingFileConfig {
    max_concurrent_streams: Option<usize>,
    max_stream_age_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    completed_retention_ms: Option<u64>,
    target_response_len: Option<usize>,
    model_fragments: Option<usize>,
    synthesis_fragments: Option<usize>,
    model_chunk_delay: Option<DelayRange>,
    synthesis_chunk_delay: Option<DelayRange>,
}

#[derive(Debug, Default, Deserialize)]
struct SynthesisFileConfig {
    weight_floor: Option<f32>,
    weight_ceiling: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct TransportFileConfig {
    socket_addr: Option<String>,
    http_addr: Option<String>,
    room_addr: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    room_channel_capacity: Option<usize>,
}

impl ChorusFileConfig {
    fn apply(self, config: &mut ChorusConfig) {
        if let Some(s) = self.streaming {
            if let Some(v) = s.max_concurrent_streams {
                config.streaming.max_concurrent_streams = v;
            }
            if let Some(v) = s.max_stream_age_ms {
                config.streaming.max_stream_age = Duration::from_millis(v);
            }
            if let Some(v) = s.sweep_interval_ms {
                config.streaming.sweep_interval = Duration::from_millis(v);
            }
            if let Some(v) = s.completed_retention_ms {
                config.streaming.completed_retention = Duration::from_millis(v);
            }
            if let Some(v) = s.target_response_len {
                config.streaming.target_response_len = v;
            }
            if let Some(v) = s.model_fragments {
                config.streaming.model_fragments = v;
            }
            if let Some(v) = s.synthesis_fragments {
                config.streaming.synthesis_fragments = v;
            }
            if let Some(v) = s.model_chunk_delay {
                config.streaming.model_chunk_delay = DelayRange::new(v.min_ms, v.max_ms);
            }
            if let Some(v) = s.synthesis_chunk_delay {
                config.streaming.synthesis_chunk_delay = DelayRange::new(v.min_ms, v.max_ms);
            }
        }
        if let Some(s) = self.synthesis {
            if let Some(v) = s.weight_floor {
                config.synthesis.weight_floor = v;
            }
            if let Some(v) = s.weight_ceiling {
                config.synthesis.weight_ceiling = v;
            }
        }
        if let Some(t) = self.transport {
            if let Some(v) = t.socket_addr {
                config.transport.socket_addr = v;
            }
            if let Some(v) = t.http_addr {
                config.transport.http_addr = v;
            }
            if let Some(v) = t.room_addr {
                config.transport.room_addr = v;
            }
            if let Some(v) = t.heartbeat_interval_ms {
                config.transport.heartbeat_interval = Duration::from_millis(v);
            }
            if let Some(v) = t.room_channel_capacity {
                config.transport.room_channel_capacity = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChorusConfig::default();
        assert_eq!(config.streaming.max_concurrent_streams, 10);
        assert_eq!(config.streaming.max_stream_age, Duration::from_secs(30));
        assert_eq!(config.streaming.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.streaming.completed_retention, Duration::from_secs(5));
        assert_eq!(config.streaming.target_response_len, 1000);
        assert_eq!(config.streaming.model_fragments, 10);
        assert_eq!(config.streaming.synthesis_fragments, 15);
        assert_eq!(config.synthesis.weight_ceiling, 3.0);
        assert_eq!(
            config.transport.heartbeat_interval,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_delay_range_sample_within_bounds() {
        let range = DelayRange::new(100, 300);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_delay_range_degenerate() {
        let range = DelayRange::new(200, 100);
        assert_eq!(range.max_ms, 200);
        assert_eq!(DelayRange::zero().sample(), Duration::ZERO);
    }

    #[test]
    fn test_file_overlay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[streaming]
max_concurrent_streams = 4
max_stream_age_ms = 5000
model_fragments = 3

[synthesis]
weight_ceiling = 2.5

[transport]
socket_addr = "127.0.0.1:7000"
"#
        )
        .unwrap();

        let config = ChorusConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.streaming.max_concurrent_streams, 4);
        assert_eq!(config.streaming.max_stream_age, Duration::from_millis(5000));
        assert_eq!(config.streaming.model_fragments, 3);
        // Untouched fields keep their defaults
        assert_eq!(config.streaming.synthesis_fragments, 15);
        assert_eq!(config.synthesis.weight_ceiling, 2.5);
        assert_eq!(config.transport.socket_addr, "127.0.0.1:7000");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[streaming]\nmax_concurrent_streams = \"many\"").unwrap();
        let result = ChorusConfig::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
