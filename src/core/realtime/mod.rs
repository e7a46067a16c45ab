//! Realtime endpoint session.
//!
//! # Architecture
//!
//! - [`Session`]: per-connection state (lifecycle, pending tool calls,
//!   `previous_item_id` continuity). Pure, no I/O.
//! - [`SessionManager`]: owns the WebSocket; connects, declares the session,
//!   routes events, sends heartbeats and reconnects with backoff.
//! - [`SessionHandle`]: cloneable command handle used by the relay and the
//!   tool dispatcher.
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian at 24kHz mono in both directions.
//!
//! # Example
//!
//! ```rust,ignore
//! use voice_relay::core::realtime::{SessionManager, SessionEvent};
//!
//! let (manager, handle, mut events) = SessionManager::new(config, notifier, cancel);
//! tokio::spawn(manager.run());
//!
//! handle.send_text("Hello")?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Transcript(text) = event {
//!         println!("{}", text);
//!     }
//! }
//! ```

mod base;
mod manager;
pub mod openai;
mod session;

pub use base::{RealtimeError, RealtimeResult, ReconnectionConfig, SessionState};
pub use manager::{SessionCommand, SessionHandle, SessionManager, SessionManagerConfig};
pub use openai::{
    ClientEvent, ConversationItem, DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL,
    InputAudioTranscription, Modality, OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL,
    OpenAIRealtimeVoice, PCM16_FORMAT, ServerEvent, SessionConfig, ToolDef, TurnDetection,
};
pub use session::{OutboundRequest, Session, SessionEvent, ToolCallContext};
