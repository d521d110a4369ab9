use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `~/.voice-trigger.toml`
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Capture/dispatch loop timing
    pub engine: EngineConfig,
    /// Microphone and utterance detection
    pub audio: AudioConfig,
    /// Speech-to-text backend selection
    pub transcription: TranscriptionConfig,
    /// Log output
    pub telemetry: TelemetryConfig,
}

/// Timing of the background capture and dispatch workers
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum wait for speech to start in one capture cycle
    pub listen_window_secs: u64,
    /// Sleep between worker iterations
    pub poll_interval_ms: u64,
    /// Ambient noise sampling before each listen
    pub ambient_calibration_ms: u64,
    /// Whether the capture loop runs at all
    pub background_listening: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_window_secs: 5,
            poll_interval_ms: 100,
            ambient_calibration_ms: 1000,
            background_listening: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn listen_window(&self) -> Duration {
        Duration::from_secs(self.listen_window_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn ambient_calibration(&self) -> Duration {
        Duration::from_millis(self.ambient_calibration_ms)
    }
}

/// Energy-based utterance detection settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Minimum RMS level treated as speech
    pub energy_threshold: f32,
    /// Multiplier applied to measured ambient RMS during calibration
    pub dynamic_energy_ratio: f32,
    /// Trailing silence that ends an utterance
    pub pause_threshold_ms: u64,
    /// Hard cap on utterance length
    pub max_phrase_secs: u64,
    /// Analysis frame length
    pub frame_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            dynamic_energy_ratio: 1.5,
            pause_threshold_ms: 1000,
            max_phrase_secs: 30,
            frame_ms: 30,
        }
    }
}

/// Which speech-to-text implementation to use
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TranscriptionBackend {
    /// OpenAI-compatible HTTP transcription endpoint
    #[default]
    WhisperApi,
    /// In-process whisper.cpp model
    Local,
}

/// Speech-to-text settings for both backends
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub backend: TranscriptionBackend,
    /// HTTP endpoint accepting multipart audio uploads
    pub endpoint: String,
    /// Remote model name
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Fallback file holding the API key
    pub api_key_file: Option<String>,
    pub request_timeout_secs: u64,
    /// Language hint (None = auto-detect)
    pub language: Option<String>,
    /// GGML model file for the local backend
    pub local_model_path: String,
    pub threads: usize,
    pub beam_size: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: TranscriptionBackend::WhisperApi,
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_owned(),
            model: "whisper-1".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            api_key_file: None,
            request_timeout_secs: 30,
            language: None,
            local_model_path: "~/.voice-trigger/models/ggml-base.en.bin".to_owned(),
            threads: 4,
            beam_size: 1,
        }
    }
}

impl TranscriptionConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: "~/.voice-trigger/voice-trigger.log".to_owned(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"[engine]
listen_window_secs = 5
poll_interval_ms = 100
ambient_calibration_ms = 1000
background_listening = true

[audio]
energy_threshold = 0.01
dynamic_energy_ratio = 1.5
pause_threshold_ms = 1000
max_phrase_secs = 30
frame_ms = 30

[transcription]
backend = "whisper-api"
endpoint = "https://api.openai.com/v1/audio/transcriptions"
model = "whisper-1"
api_key_env = "OPENAI_API_KEY"
# api_key_file = "~/.voice-trigger/key.secret"
request_timeout_secs = 30
local_model_path = "~/.voice-trigger/models/ggml-base.en.bin"
threads = 4
beam_size = 1

[telemetry]
enabled = true
log_path = "~/.voice-trigger/voice-trigger.log"
"#;

impl Config {
    /// Load config from ~/.voice-trigger.toml, writing the default file first if missing
    ///
    /// # Errors
    /// Returns error if HOME is unset or the file cannot be written, read or parsed
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        Self::load_from(&config_path)
    }

    /// Load config from an explicit path
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::from_toml_str(&contents)
    }

    /// Parse config from TOML text; missing sections and keys take defaults
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML for this schema
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".voice-trigger.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and HOME is unset
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_file_matches_default_struct() {
        let parsed = Config::from_toml_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let parsed = Config::from_toml_str("").unwrap();
        assert_eq!(parsed.engine.listen_window(), Duration::from_secs(5));
        assert_eq!(parsed.engine.poll_interval(), Duration::from_millis(100));
        assert!(parsed.engine.background_listening);
        assert_eq!(parsed.transcription.backend, TranscriptionBackend::WhisperApi);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let parsed = Config::from_toml_str(
            r#"
[engine]
background_listening = false

[transcription]
backend = "local"
language = "en"
"#,
        )
        .unwrap();

        assert!(!parsed.engine.background_listening);
        assert_eq!(parsed.engine.listen_window_secs, 5);
        assert_eq!(parsed.transcription.backend, TranscriptionBackend::Local);
        assert_eq!(parsed.transcription.language.as_deref(), Some("en"));
        assert_eq!(parsed.transcription.model, "whisper-1");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Config::from_toml_str("[transcription]\nbackend = \"carrier-pigeon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\npoll_interval_ms = 25").unwrap();

        let parsed = Config::load_from(file.path()).unwrap();
        assert_eq!(parsed.engine.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn test_load_from_missing_file_has_context() {
        let err = Config::load_from(Path::new("/nonexistent/voice-trigger.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").expect("HOME not set");
        let result = Config::expand_path("~/models/a.bin").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/a.bin"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let result = Config::expand_path("/var/log/app.log").unwrap();
        assert_eq!(result, PathBuf::from("/var/log/app.log"));
    }
}
