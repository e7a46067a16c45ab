//! Realtime endpoint constants and enumerated session settings.

use serde::{Deserialize, Serialize};

/// Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Audio sample rate expected by the realtime endpoint.
pub const OPENAI_REALTIME_SAMPLE_RATE: u32 = 24000;

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-mini-realtime-preview";

/// Default model for input audio transcription.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "gpt-4o-mini-transcribe";

/// Value of the `OpenAI-Beta` header required by the realtime endpoint.
pub const OPENAI_BETA_HEADER: &str = "realtime=v1";

// =============================================================================
// Voices
// =============================================================================

/// Available output voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIRealtimeVoice {
    Alloy,
    Ash,
    /// Ballad voice (default)
    #[default]
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl OpenAIRealtimeVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "alloy" => Self::Alloy,
            "ash" => Self::Ash,
            "ballad" => Self::Ballad,
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::default(),
        }
    }
}

impl std::fmt::Display for OpenAIRealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Audio Format / Modalities
// =============================================================================

/// Wire name of the PCM16 audio format.
pub const PCM16_FORMAT: &str = "pcm16";

/// Output modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_from_str() {
        assert_eq!(
            OpenAIRealtimeVoice::from_str_or_default("SHIMMER"),
            OpenAIRealtimeVoice::Shimmer
        );
        assert_eq!(
            OpenAIRealtimeVoice::from_str_or_default("unknown"),
            OpenAIRealtimeVoice::Ballad
        );
        assert_eq!(OpenAIRealtimeVoice::Verse.to_string(), "verse");
    }

    #[test]
    fn test_modality_as_str() {
        assert_eq!(Modality::Text.as_str(), "text");
        assert_eq!(Modality::Audio.as_str(), "audio");
    }
}
