//! Base types for the realtime endpoint session.
//!
//! Audio exchanged with the endpoint is PCM 16-bit signed little-endian at
//! 24kHz mono.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while talking to the realtime endpoint.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the endpoint failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Error event reported by the endpoint
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection abandoned after {0} attempt(s)")]
    RetriesExhausted(u32),

    /// The session task has stopped
    #[error("Session closed")]
    SessionClosed,
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 5
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms (30 seconds)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Add up to 25% jitter to each delay. Delays are then no longer monotonic.
    /// Default: false
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number using exponential backoff.
    /// Returns the delay in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // Exponential backoff: base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jitter_range = delay * 0.25;
            let jitter = rand_jitter(jitter_range);
            (delay + jitter) as u64
        } else {
            delay as u64
        }
    }

    /// Check if more reconnection attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Generate a pseudo-random jitter value using a simple LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No socket
    #[default]
    Disconnected,
    /// Socket handshake in progress
    Connecting,
    /// Configured and exchanging events
    Open,
    /// Close initiated locally
    Closing,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Disconnected)
                | (Open, Closing)
                | (Open, Disconnected)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Open => write!(f, "Open"),
            SessionState::Closing => write!(f, "Closing"),
        }
    }
}
