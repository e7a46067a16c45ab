//! Configuration validation logic.

use url::Url;

use super::{ConfigError, ConfigResult, RelayConfig};

/// Checks required settings and cross-field consistency.
pub(super) fn validate(config: &RelayConfig) -> ConfigResult<()> {
    if config.api_key.trim().is_empty() {
        return Err(ConfigError::Missing("OPENAI_API_KEY"));
    }
    if config.channel_id.trim().is_empty() {
        return Err(ConfigError::Missing("VOICE_CHANNEL_ID"));
    }

    validate_url("endpoint_url", &config.endpoint_url, &["ws", "wss"])?;
    if let Some(url) = &config.remote_tools_url {
        validate_url("remote_tools_url", url, &["http", "https"])?;
    }

    validate_sample_rate("platform_sample_rate", config.platform_sample_rate)?;
    validate_sample_rate("endpoint_sample_rate", config.endpoint_sample_rate)?;
    if !matches!(config.platform_channels, 1 | 2) {
        return Err(ConfigError::InvalidValue {
            key: "platform_channels".to_string(),
            value: config.platform_channels.to_string(),
        });
    }

    if config.max_queued_frames == 0 {
        return Err(ConfigError::Invalid(
            "max_queued_frames must be at least 1".to_string(),
        ));
    }
    if config.jitter_frames == 0 {
        return Err(ConfigError::Invalid(
            "jitter_frames must be at least 1".to_string(),
        ));
    }
    if config.high_watermark == 0 || config.low_watermark > config.high_watermark {
        return Err(ConfigError::Invalid(format!(
            "watermarks must satisfy 0 <= low <= high and high > 0 (low={}, high={})",
            config.low_watermark, config.high_watermark
        )));
    }

    for (key, ms) in [
        ("connect_timeout_ms", config.connect_timeout_ms),
        ("heartbeat_interval_ms", config.heartbeat_interval_ms),
        ("tool_timeout_ms", config.tool_timeout_ms),
    ] {
        if ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: "0".to_string(),
            });
        }
    }

    let reconnection = &config.reconnection;
    if reconnection.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid(format!(
            "backoff_multiplier must be >= 1.0, got {}",
            reconnection.backoff_multiplier
        )));
    }
    if reconnection.initial_delay_ms > reconnection.max_delay_ms {
        return Err(ConfigError::Invalid(format!(
            "initial_delay_ms ({}) exceeds max_delay_ms ({})",
            reconnection.initial_delay_ms, reconnection.max_delay_ms
        )));
    }

    Ok(())
}

fn validate_url(key: &str, value: &str, schemes: &[&str]) -> ConfigResult<()> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: format!("{} ({})", value, e),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: format!("{} (expected scheme {})", value, schemes.join(" or ")),
        });
    }
    Ok(())
}

/// Rates must give a whole number of samples per 20ms frame.
fn validate_sample_rate(key: &str, rate: u32) -> ConfigResult<()> {
    if !(8000..=48000).contains(&rate) || rate % 50 != 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: rate.to_string(),
        });
    }
    Ok(())
}
