use serde::Deserialize;
use std::path::Path;

use super::{ConfigError, ConfigResult};
use crate::core::realtime::TurnDetection;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-mini-realtime-preview"
///   voice: "ballad"
///   instructions_path: "instructions.txt"
///   transcription_model: "gpt-4o-mini-transcribe"
///   turn_detection:
///     type: server_vad
///     silence_duration_ms: 500
///
/// voice:
///   channel_id: "123456789"
///
/// audio:
///   platform_sample_rate: 48000
///   platform_channels: 2
///   endpoint_sample_rate: 24000
///   transcoder: in_process
///   ffmpeg_path: "/usr/bin/ffmpeg"
///   playback_filter: "rubberband=pitch=1.1"
///
/// arbitration:
///   max_queued_frames: 100
///
/// playback:
///   jitter_frames: 5
///
/// backpressure:
///   high_watermark: 49152
///   low_watermark: 16384
///
/// session:
///   connect_timeout_ms: 10000
///   heartbeat_interval_ms: 30000
///   stable_period_ms: 30000
///   reconnection:
///     max_attempts: 5
///     initial_delay_ms: 1000
///     max_delay_ms: 30000
///     backoff_multiplier: 2.0
///     jitter: false
///
/// tools:
///   timeout_ms: 10000
///   remote_url: "http://localhost:8787"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub voice: Option<VoiceYaml>,
    pub audio: Option<AudioYaml>,
    pub arbitration: Option<ArbitrationYaml>,
    pub playback: Option<PlaybackYaml>,
    pub backpressure: Option<BackpressureYaml>,
    pub session: Option<SessionYaml>,
    pub tools: Option<ToolsYaml>,
}

/// Realtime endpoint settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub instructions_path: Option<String>,
    pub transcription_model: Option<String>,
    pub turn_detection: Option<TurnDetection>,
}

/// Voice platform settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VoiceYaml {
    pub channel_id: Option<String>,
}

/// Audio format and transcoder settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub platform_sample_rate: Option<u32>,
    pub platform_channels: Option<u16>,
    pub endpoint_sample_rate: Option<u32>,
    /// "in_process" or "process"
    pub transcoder: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub playback_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ArbitrationYaml {
    pub max_queued_frames: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    pub jitter_frames: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackpressureYaml {
    pub high_watermark: Option<usize>,
    pub low_watermark: Option<usize>,
}

/// Session timing from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub connect_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub stable_period_ms: Option<u64>,
    pub reconnection: Option<ReconnectionYaml>,
}

/// Reconnection policy from YAML. Absent fields keep the environment value.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsYaml {
    pub timeout_ms: Option<u64>,
    pub remote_url: Option<String>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
