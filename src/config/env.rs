//! Environment variable loading.

use std::path::PathBuf;
use std::str::FromStr;
use zeroize::Zeroizing;

use super::{ConfigError, ConfigResult, RelayConfig};
use crate::core::realtime::{OpenAIRealtimeVoice, TurnDetection};
use crate::core::transcode::TranscoderKind;

/// Every variable read by [`from_env`].
pub(super) const ENV_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "VOICE_CHANNEL_ID",
    "REALTIME_URL",
    "REALTIME_MODEL",
    "REALTIME_VOICE",
    "INSTRUCTIONS",
    "INSTRUCTIONS_PATH",
    "TRANSCRIPTION_MODEL",
    "TURN_DETECTION",
    "PLATFORM_SAMPLE_RATE",
    "PLATFORM_CHANNELS",
    "ENDPOINT_SAMPLE_RATE",
    "TRANSCODER",
    "FFMPEG_PATH",
    "PLAYBACK_FILTER",
    "MAX_QUEUED_FRAMES",
    "JITTER_FRAMES",
    "HIGH_WATERMARK",
    "LOW_WATERMARK",
    "CONNECT_TIMEOUT_MS",
    "HEARTBEAT_INTERVAL_MS",
    "STABLE_PERIOD_MS",
    "RECONNECT_ENABLED",
    "RECONNECT_MAX_ATTEMPTS",
    "RECONNECT_INITIAL_DELAY_MS",
    "RECONNECT_MAX_DELAY_MS",
    "RECONNECT_BACKOFF_MULTIPLIER",
    "RECONNECT_JITTER",
    "TOOL_TIMEOUT_MS",
    "REMOTE_TOOLS_URL",
];

/// Non-empty, trimmed value of `key`.
fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T: FromStr>(key: &str) -> ConfigResult<Option<T>> {
    match var(key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

fn parse_bool(key: &str) -> ConfigResult<Option<bool>> {
    match var(key) {
        None => Ok(None),
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        },
    }
}

/// Parses a turn detection mode name.
fn turn_detection_from_str(key: &str, value: &str) -> ConfigResult<TurnDetection> {
    match value.to_lowercase().as_str() {
        "server_vad" | "server" => Ok(TurnDetection::default()),
        "semantic_vad" | "semantic" => Ok(TurnDetection::SemanticVad { eagerness: None }),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Builds a configuration from defaults overlaid with environment variables.
pub(super) fn from_env() -> ConfigResult<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Some(key) = var("OPENAI_API_KEY") {
        config.api_key = Zeroizing::new(key);
    }
    if let Some(channel) = var("VOICE_CHANNEL_ID") {
        config.channel_id = channel;
    }
    if let Some(url) = var("REALTIME_URL") {
        config.endpoint_url = url;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        config.model = model;
    }
    if let Some(voice) = var("REALTIME_VOICE") {
        config.voice = OpenAIRealtimeVoice::from_str_or_default(&voice);
    }
    config.instructions = var("INSTRUCTIONS");
    if let Some(path) = var("INSTRUCTIONS_PATH") {
        config.instructions_path = PathBuf::from(path);
    }
    if let Some(model) = var("TRANSCRIPTION_MODEL") {
        config.transcription_model = model;
    }
    if let Some(mode) = var("TURN_DETECTION") {
        config.turn_detection = turn_detection_from_str("TURN_DETECTION", &mode)?;
    }

    if let Some(rate) = parse("PLATFORM_SAMPLE_RATE")? {
        config.platform_sample_rate = rate;
    }
    if let Some(channels) = parse("PLATFORM_CHANNELS")? {
        config.platform_channels = channels;
    }
    if let Some(rate) = parse("ENDPOINT_SAMPLE_RATE")? {
        config.endpoint_sample_rate = rate;
    }
    if let Some(kind) = var("TRANSCODER") {
        config.transcoder = TranscoderKind::from_str_or_default(&kind);
    }
    if let Some(path) = var("FFMPEG_PATH") {
        config.ffmpeg_path = PathBuf::from(path);
    }
    config.playback_filter = var("PLAYBACK_FILTER");

    if let Some(frames) = parse("MAX_QUEUED_FRAMES")? {
        config.max_queued_frames = frames;
    }
    if let Some(frames) = parse("JITTER_FRAMES")? {
        config.jitter_frames = frames;
    }
    if let Some(bytes) = parse("HIGH_WATERMARK")? {
        config.high_watermark = bytes;
    }
    if let Some(bytes) = parse("LOW_WATERMARK")? {
        config.low_watermark = bytes;
    }

    if let Some(ms) = parse("CONNECT_TIMEOUT_MS")? {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = parse("HEARTBEAT_INTERVAL_MS")? {
        config.heartbeat_interval_ms = ms;
    }
    if let Some(ms) = parse("STABLE_PERIOD_MS")? {
        config.stable_period_ms = ms;
    }
    if let Some(enabled) = parse_bool("RECONNECT_ENABLED")? {
        config.reconnection.enabled = enabled;
    }
    if let Some(attempts) = parse("RECONNECT_MAX_ATTEMPTS")? {
        config.reconnection.max_attempts = attempts;
    }
    if let Some(ms) = parse("RECONNECT_INITIAL_DELAY_MS")? {
        config.reconnection.initial_delay_ms = ms;
    }
    if let Some(ms) = parse("RECONNECT_MAX_DELAY_MS")? {
        config.reconnection.max_delay_ms = ms;
    }
    if let Some(multiplier) = parse("RECONNECT_BACKOFF_MULTIPLIER")? {
        config.reconnection.backoff_multiplier = multiplier;
    }
    if let Some(jitter) = parse_bool("RECONNECT_JITTER")? {
        config.reconnection.jitter = jitter;
    }

    if let Some(ms) = parse("TOOL_TIMEOUT_MS")? {
        config.tool_timeout_ms = ms;
    }
    config.remote_tools_url = var("REMOTE_TOOLS_URL");

    Ok(config)
}
