//! OpenAI Realtime API wire format.
//!
//! Connection URL: `wss://api.openai.com/v1/realtime?model=<model>` with
//! `Authorization: Bearer <key>` and `OpenAI-Beta: realtime=v1` headers.

mod config;
mod messages;

pub use config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, Modality, OPENAI_BETA_HEADER,
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeVoice, PCM16_FORMAT,
};
pub use messages::{
    ApiError, ClientEvent, ContentPart, ConversationItem, InputAudioTranscription, Response,
    ServerEvent, SessionConfig, ToolDef, TurnDetection,
};
