//! Applies YAML overrides on top of an environment-derived configuration.

use std::path::PathBuf;
use zeroize::Zeroizing;

use super::RelayConfig;
use super::yaml::YamlConfig;
use crate::core::realtime::OpenAIRealtimeVoice;
use crate::core::transcode::TranscoderKind;

/// Overwrites every field of `config` that `yaml` sets.
pub(super) fn apply_yaml(config: &mut RelayConfig, yaml: YamlConfig) {
    if let Some(realtime) = yaml.realtime {
        if let Some(key) = realtime.api_key {
            config.api_key = Zeroizing::new(key);
        }
        if let Some(url) = realtime.url {
            config.endpoint_url = url;
        }
        if let Some(model) = realtime.model {
            config.model = model;
        }
        if let Some(voice) = realtime.voice {
            config.voice = OpenAIRealtimeVoice::from_str_or_default(&voice);
        }
        if let Some(text) = realtime.instructions {
            config.instructions = Some(text);
        }
        if let Some(path) = realtime.instructions_path {
            config.instructions_path = PathBuf::from(path);
        }
        if let Some(model) = realtime.transcription_model {
            config.transcription_model = model;
        }
        if let Some(turn_detection) = realtime.turn_detection {
            config.turn_detection = turn_detection;
        }
    }

    if let Some(channel) = yaml.voice.and_then(|v| v.channel_id) {
        config.channel_id = channel;
    }

    if let Some(audio) = yaml.audio {
        if let Some(rate) = audio.platform_sample_rate {
            config.platform_sample_rate = rate;
        }
        if let Some(channels) = audio.platform_channels {
            config.platform_channels = channels;
        }
        if let Some(rate) = audio.endpoint_sample_rate {
            config.endpoint_sample_rate = rate;
        }
        if let Some(kind) = audio.transcoder {
            config.transcoder = TranscoderKind::from_str_or_default(&kind);
        }
        if let Some(path) = audio.ffmpeg_path {
            config.ffmpeg_path = PathBuf::from(path);
        }
        if let Some(filter) = audio.playback_filter {
            config.playback_filter = Some(filter);
        }
    }

    if let Some(frames) = yaml.arbitration.and_then(|a| a.max_queued_frames) {
        config.max_queued_frames = frames;
    }
    if let Some(frames) = yaml.playback.and_then(|p| p.jitter_frames) {
        config.jitter_frames = frames;
    }

    if let Some(backpressure) = yaml.backpressure {
        if let Some(high) = backpressure.high_watermark {
            config.high_watermark = high;
        }
        if let Some(low) = backpressure.low_watermark {
            config.low_watermark = low;
        }
    }

    if let Some(session) = yaml.session {
        if let Some(ms) = session.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = session.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = session.stable_period_ms {
            config.stable_period_ms = ms;
        }
        if let Some(reconnection) = session.reconnection {
            let target = &mut config.reconnection;
            if let Some(enabled) = reconnection.enabled {
                target.enabled = enabled;
            }
            if let Some(attempts) = reconnection.max_attempts {
                target.max_attempts = attempts;
            }
            if let Some(ms) = reconnection.initial_delay_ms {
                target.initial_delay_ms = ms;
            }
            if let Some(ms) = reconnection.max_delay_ms {
                target.max_delay_ms = ms;
            }
            if let Some(multiplier) = reconnection.backoff_multiplier {
                target.backoff_multiplier = multiplier;
            }
            if let Some(jitter) = reconnection.jitter {
                target.jitter = jitter;
            }
        }
    }

    if let Some(tools) = yaml.tools {
        if let Some(ms) = tools.timeout_ms {
            config.tool_timeout_ms = ms;
        }
        if let Some(url) = tools.remote_url {
            config.remote_tools_url = Some(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::TurnDetection;

    #[test]
    fn test_absent_sections_keep_values() {
        let mut config = RelayConfig {
            model: "from-env".to_string(),
            jitter_frames: 9,
            ..Default::default()
        };
        apply_yaml(&mut config, YamlConfig::default());
        assert_eq!(config.model, "from-env");
        assert_eq!(config.jitter_frames, 9);
    }

    #[test]
    fn test_yaml_fields_override() {
        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
realtime:
  turn_detection:
    type: server_vad
    threshold: 0.7
audio:
  transcoder: process
  playback_filter: "atempo=1.1"
session:
  reconnection:
    max_delay_ms: 5000
tools:
  remote_url: "http://tools.local"
"#,
        )
        .unwrap();
        let mut config = RelayConfig::default();
        config.reconnection.max_attempts = 7;
        apply_yaml(&mut config, yaml);

        assert_eq!(config.transcoder, TranscoderKind::Process);
        assert_eq!(config.playback_filter.as_deref(), Some("atempo=1.1"));
        assert_eq!(config.reconnection.max_delay_ms, 5000);
        assert_eq!(config.reconnection.max_attempts, 7);
        assert_eq!(config.remote_tools_url.as_deref(), Some("http://tools.local"));
        assert_eq!(
            config.turn_detection,
            TurnDetection::ServerVad {
                threshold: Some(0.7),
                prefix_padding_ms: None,
                silence_duration_ms: None,
            }
        );
    }
}
