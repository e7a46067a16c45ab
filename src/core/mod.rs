pub mod audio;
pub mod backpressure;
pub mod realtime;
pub mod relay;
pub mod tools;
pub mod transcode;
pub mod voice;

// Re-export commonly used types for convenience
pub use audio::{FrameChunker, PcmFormat};

pub use realtime::{
    RealtimeError, RealtimeResult, ReconnectionConfig, SessionEvent, SessionHandle,
    SessionManager, SessionManagerConfig, SessionState,
};

pub use relay::{
    AudioInputRelay, AudioOutputRelay, PlaybackState, SpeakerArbiter, VoiceRelay,
    VoiceRelayBuilder,
};

pub use tools::{
    DispatchOutcome, FunctionCall, RemoteToolClient, ToolDispatcher, ToolError, ToolHandler,
    ToolRegistry, ToolResult,
};

pub use transcode::{
    BoxedTranscoder, TranscodeError, TranscodeResult, TranscodeWorker, TranscoderFactory,
    TranscoderKind,
};

pub use voice::{
    DetachedVoiceSink, LogNotifier, LogTranscriptSink, Notifier, PlaybackStream, SpeakerId,
    SpeakingSubscription, TranscriptSink, VoiceEvent, VoiceSink,
};
