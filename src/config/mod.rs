//! Configuration module for the voice relay
//!
//! This module handles relay configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use voice_relay::config::RelayConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = RelayConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config = RelayConfig::from_file(&PathBuf::from("relay.yaml"))?;
//! println!("Relaying channel {}", config.channel_id);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use zeroize::Zeroizing;

use crate::core::audio::{PLATFORM_SAMPLE_RATE, PcmFormat};
use crate::core::backpressure::{DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use crate::core::realtime::{
    DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, InputAudioTranscription, Modality,
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeVoice, PCM16_FORMAT,
    ReconnectionConfig, SessionConfig, SessionManagerConfig, ToolDef, TurnDetection,
};
use crate::core::relay::{DEFAULT_JITTER_FRAMES, DEFAULT_MAX_QUEUED_FRAMES};
use crate::core::tools::DEFAULT_TOOL_TIMEOUT;
use crate::core::transcode::TranscoderKind;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

/// Default persona instructions file.
pub const DEFAULT_INSTRUCTIONS_PATH: &str = "instructions.txt";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for this schema
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A setting has a value that cannot be parsed
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// A required setting is absent
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    /// Settings are individually valid but inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Relay Configuration
// =============================================================================

/// Relay configuration
///
/// Contains everything needed to run one relay instance:
/// - realtime endpoint credentials, model, voice and persona
/// - the target voice channel
/// - audio formats and transcoder selection
/// - arbitration, playback and backpressure tuning
/// - session timing and reconnection policy
/// - tool invocation settings
#[derive(Clone)]
pub struct RelayConfig {
    // Realtime endpoint
    /// API key, zeroized when dropped
    pub api_key: Zeroizing<String>,
    pub endpoint_url: String,
    pub model: String,
    pub voice: OpenAIRealtimeVoice,
    /// Inline persona instructions. Takes precedence over `instructions_path`.
    pub instructions: Option<String>,
    pub instructions_path: PathBuf,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,

    // Voice platform
    pub channel_id: String,

    // Audio
    pub platform_sample_rate: u32,
    pub platform_channels: u16,
    pub endpoint_sample_rate: u32,
    pub transcoder: TranscoderKind,
    pub ffmpeg_path: PathBuf,
    /// ffmpeg `-filter:a` chain applied to playback when using the process transcoder
    pub playback_filter: Option<String>,

    // Arbitration and playback
    pub max_queued_frames: usize,
    pub jitter_frames: usize,

    // Backpressure
    pub high_watermark: usize,
    pub low_watermark: usize,

    // Session
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stable_period_ms: u64,
    pub reconnection: ReconnectionConfig,

    // Tools
    pub tool_timeout_ms: u64,
    pub remote_tools_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: Zeroizing::new(String::new()),
            endpoint_url: OPENAI_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: OpenAIRealtimeVoice::default(),
            instructions: None,
            instructions_path: PathBuf::from(DEFAULT_INSTRUCTIONS_PATH),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            turn_detection: TurnDetection::default(),
            channel_id: String::new(),
            platform_sample_rate: PLATFORM_SAMPLE_RATE,
            platform_channels: 2,
            endpoint_sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            transcoder: TranscoderKind::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            playback_filter: None,
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            jitter_frames: DEFAULT_JITTER_FRAMES,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            stable_period_ms: 30_000,
            reconnection: ReconnectionConfig::default(),
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT.as_millis() as u64,
            remote_tools_url: None,
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &"[REDACTED]")
            .field("endpoint_url", &self.endpoint_url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("channel_id", &self.channel_id)
            .field("transcoder", &self.transcoder)
            .field("reconnection", &self.reconnection)
            .field("remote_tools_url", &self.remote_tools_url)
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    ///
    /// The `.env` file, if any, is loaded into the environment by the binary
    /// before this runs, so real environment variables win over it.
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or validation fails.
    pub fn from_env() -> ConfigResult<Self> {
        let config = env::from_env()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is malformed, or the merged configuration fails validation.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let mut config = env::from_env()?;
        merge::apply_yaml(&mut config, yaml_config);
        validation::validate(&config)?;
        Ok(config)
    }

    /// Endpoint URL with the model query parameter attached.
    pub fn realtime_url(&self) -> ConfigResult<String> {
        let mut url = Url::parse(&self.endpoint_url).map_err(|e| ConfigError::InvalidValue {
            key: "endpoint_url".to_string(),
            value: format!("{} ({})", self.endpoint_url, e),
        })?;
        if !url.query_pairs().any(|(k, _)| k == "model") {
            url.query_pairs_mut().append_pair("model", &self.model);
        }
        Ok(url.to_string())
    }

    /// Persona instructions: the inline text if set, else the instructions
    /// file, else `<file>.example`, else empty.
    pub fn load_instructions(&self) -> String {
        if let Some(text) = &self.instructions {
            return text.clone();
        }

        let example = PathBuf::from(format!("{}.example", self.instructions_path.display()));
        for path in [&self.instructions_path, &example] {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    tracing::info!("Loaded instructions from {}", path.display());
                    return text.trim().to_string();
                }
                Err(e) => tracing::debug!("No instructions at {}: {}", path.display(), e),
            }
        }
        tracing::warn!(
            "No instructions found at {} or {}, using none",
            self.instructions_path.display(),
            example.display()
        );
        String::new()
    }

    /// PCM format of the voice platform.
    pub fn platform_format(&self) -> PcmFormat {
        PcmFormat::new(self.platform_sample_rate, self.platform_channels)
    }

    /// PCM format of the realtime endpoint, in both directions.
    pub fn endpoint_format(&self) -> PcmFormat {
        PcmFormat::mono(self.endpoint_sample_rate)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// The `session.update` payload declared on every connect.
    pub fn declared_session(&self, instructions: String, tools: Vec<ToolDef>) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec![
                Modality::Text.as_str().to_string(),
                Modality::Audio.as_str().to_string(),
            ]),
            instructions: if instructions.is_empty() {
                None
            } else {
                Some(instructions)
            },
            voice: Some(self.voice.as_str().to_string()),
            input_audio_format: Some(PCM16_FORMAT.to_string()),
            output_audio_format: Some(PCM16_FORMAT.to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(self.turn_detection.clone()),
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
            temperature: None,
        }
    }

    /// Settings for the session manager, given the declared session.
    pub fn session_manager_config(&self, session: SessionConfig) -> ConfigResult<SessionManagerConfig> {
        Ok(SessionManagerConfig {
            url: self.realtime_url()?,
            api_key: self.api_key.clone(),
            session,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            stable_period: Duration::from_millis(self.stable_period_ms),
            reconnection: self.reconnection.clone(),
            high_watermark: self.high_watermark,
            low_watermark: self.low_watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn test_config() -> RelayConfig {
        RelayConfig {
            api_key: Zeroizing::new("sk-test".to_string()),
            channel_id: "chan-1".to_string(),
            ..Default::default()
        }
    }

    fn cleanup_env_vars() {
        // SAFETY: tests touching the environment are serialized
        unsafe {
            for key in env::ENV_KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_realtime_url_appends_model() {
        let config = test_config();
        let url = config.realtime_url().unwrap();
        assert_eq!(
            url,
            "wss://api.openai.com/v1/realtime?model=gpt-4o-mini-realtime-preview"
        );

        let mut pinned = test_config();
        pinned.endpoint_url = "ws://localhost:9000/v1/realtime?model=custom".to_string();
        assert_eq!(
            pinned.realtime_url().unwrap(),
            "ws://localhost:9000/v1/realtime?model=custom"
        );
    }

    #[test]
    fn test_declared_session() {
        let config = test_config();
        let tools = vec![ToolDef::function(
            "no_response",
            "Stay silent",
            serde_json::json!({"type": "object"}),
        )];
        let session = config.declared_session("Be brief.".to_string(), tools);

        assert_eq!(
            session.modalities,
            Some(vec!["text".to_string(), "audio".to_string()])
        );
        assert_eq!(session.instructions.as_deref(), Some("Be brief."));
        assert_eq!(session.voice.as_deref(), Some("ballad"));
        assert_eq!(session.input_audio_format.as_deref(), Some("pcm16"));
        assert_eq!(
            session.input_audio_transcription.unwrap().model,
            "gpt-4o-mini-transcribe"
        );
        assert_eq!(session.tool_choice.as_deref(), Some("auto"));
        assert_eq!(session.tools.unwrap().len(), 1);

        let bare = config.declared_session(String::new(), Vec::new());
        assert!(bare.instructions.is_none());
        assert!(bare.tools.is_none());
        assert!(bare.tool_choice.is_none());
    }

    #[test]
    fn test_load_instructions_fallbacks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("instructions.txt");
        let mut config = test_config();
        config.instructions_path = path.clone();

        assert_eq!(config.load_instructions(), "");

        fs::write(temp_dir.path().join("instructions.txt.example"), "From example\n").unwrap();
        assert_eq!(config.load_instructions(), "From example");

        fs::write(&path, "From file").unwrap();
        assert_eq!(config.load_instructions(), "From file");

        config.instructions = Some("Inline".to_string());
        assert_eq!(config.load_instructions(), "Inline");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let debug = format!("{:?}", test_config());
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_session_manager_config() {
        let mut config = test_config();
        config.heartbeat_interval_ms = 5000;
        let manager = config
            .session_manager_config(SessionConfig::default())
            .unwrap();
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(manager.api_key.as_str(), "sk-test");
        assert!(manager.url.contains("model="));
    }

    #[test]
    #[serial]
    fn test_from_env_requires_api_key() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("VOICE_CHANNEL_ID", "chan-1");
        }
        let err = RelayConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPENAI_API_KEY")));
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_reads_values() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("OPENAI_API_KEY", "sk-env");
            std::env::set_var("VOICE_CHANNEL_ID", "chan-env");
            std::env::set_var("REALTIME_VOICE", "verse");
            std::env::set_var("TRANSCODER", "ffmpeg");
            std::env::set_var("JITTER_FRAMES", "8");
            std::env::set_var("RECONNECT_MAX_ATTEMPTS", "3");
        }

        let config = RelayConfig::from_env().unwrap();
        assert_eq!(config.api_key.as_str(), "sk-env");
        assert_eq!(config.channel_id, "chan-env");
        assert_eq!(config.voice, OpenAIRealtimeVoice::Verse);
        assert_eq!(config.transcoder, TranscoderKind::Process);
        assert_eq!(config.jitter_frames, 8);
        assert_eq!(config.reconnection.max_attempts, 3);
        assert_eq!(config.platform_format(), PcmFormat::stereo(48000));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("OPENAI_API_KEY", "sk-env");
            std::env::set_var("VOICE_CHANNEL_ID", "chan-env");
            std::env::set_var("JITTER_FRAMES", "8");
            std::env::set_var("RECONNECT_MAX_ATTEMPTS", "3");
        }

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("relay.yaml");
        let yaml_content = r#"
realtime:
  model: "gpt-4o-realtime-preview"
  voice: "coral"

voice:
  channel_id: "chan-yaml"

playback:
  jitter_frames: 3

session:
  reconnection:
    initial_delay_ms: 250
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = RelayConfig::from_file(&config_path).unwrap();
        assert_eq!(config.api_key.as_str(), "sk-env");
        assert_eq!(config.channel_id, "chan-yaml");
        assert_eq!(config.model, "gpt-4o-realtime-preview");
        assert_eq!(config.voice, OpenAIRealtimeVoice::Coral);
        assert_eq!(config.jitter_frames, 3);
        // Env value survives where YAML is silent
        assert_eq!(config.reconnection.max_attempts, 3);
        assert_eq!(config.reconnection.initial_delay_ms, 250);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing() {
        cleanup_env_vars();
        let err = RelayConfig::from_file(Path::new("/nonexistent/relay.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
