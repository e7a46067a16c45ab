//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a focused error enum; `RelayError` aggregates them for
//! callers that drive a whole relay instance.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::realtime::RealtimeError;
use crate::core::tools::ToolError;
use crate::core::transcode::TranscodeError;

/// Errors surfaced by a relay instance.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket-level failure talking to the realtime endpoint. Retried with backoff.
    #[error("Connection error: {0}")]
    Connection(#[from] RealtimeError),

    /// Transcoding pipeline failure. Recovered by respawning the worker.
    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    /// A single tool call failed. Reported inline to the endpoint.
    #[error("Tool invocation error: {0}")]
    ToolInvocation(#[from] ToolError),

    /// Missing credentials or target. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A queued speaker exceeded its frame budget and lost its oldest audio.
    #[error("Arbitration overflow for speaker {speaker}: dropped {dropped} frame(s)")]
    ArbitrationOverflow { speaker: String, dropped: usize },

    /// The voice platform collaborator failed.
    #[error("Voice sink error: {0}")]
    VoiceSink(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_display() {
        let err = RelayError::ArbitrationOverflow {
            speaker: "alice".to_string(),
            dropped: 1,
        };
        assert_eq!(
            err.to_string(),
            "Arbitration overflow for speaker alice: dropped 1 frame(s)"
        );
    }

    #[test]
    fn test_from_realtime_error() {
        let err: RelayError = RealtimeError::NotConnected.into();
        assert!(matches!(err, RelayError::Connection(_)));
        assert!(err.to_string().contains("Not connected"));
    }

    #[test]
    fn test_from_tool_error() {
        let err: RelayError = ToolError::NotFound("get_weather".to_string()).into();
        assert!(err.to_string().starts_with("Tool invocation error"));
    }
}
