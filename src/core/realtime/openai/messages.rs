//! Realtime API WebSocket message types.
//!
//! All events are JSON-encoded and sent over WebSocket.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Declare session configuration and tools
//! - input_audio_buffer.append - Append one uplink audio frame
//! - conversation.item.create - Add a message or function output
//! - response.create - Generate a response
//!
//! Server events (received from server):
//! - session.created / session.updated - Session acknowledged
//! - conversation.item.input_audio_transcription.completed - User transcript
//! - response.audio.delta - Audio data chunk
//! - response.audio.done - Audio generation complete
//! - response.done - Response complete, may contain function calls
//! - error - Error occurred
//!
//! Any other server event type deserializes to [`ServerEvent::Unknown`].

use base64::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration sent in `session.update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    /// Tool definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    /// Tool choice strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    /// Temperature for response generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "gpt-4o-mini-transcribe")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio prefix padding in ms
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration in ms
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// Semantic VAD
    #[serde(rename = "semantic_vad")]
    SemanticVad {
        /// Eagerness level
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eagerness: Option<String>,
    },
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            threshold: None,
            prefix_padding_ms: None,
            silence_duration_ms: None,
        }
    }
}

/// Tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool type (always "function")
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    /// Function name
    pub name: String,
    /// Function description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Function parameters JSON schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolDef {
    /// A `function` tool with the given JSON schema.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: function_type(),
            name: name.into(),
            description: Some(description.into()),
            parameters: Some(parameters),
        }
    }
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type (message, function_call, function_call_output)
    #[serde(rename = "type", default)]
    pub item_type: String,
    /// Item status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    /// Call ID for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function arguments for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Function output for function call result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A user message carrying plain text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart::input_text(text)]),
            ..Default::default()
        }
    }

    /// The result of a function call.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn is_function_call(&self) -> bool {
        self.item_type == "function_call"
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type", default)]
    pub content_type: String,
    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio content (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Transcript of audio content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self {
            content_type: "input_text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionConfig,
    },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
        /// Display name of the speaker this audio belongs to
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker: Option<String>,
    },

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
        /// Previous item ID to insert after
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
    },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8], speaker: Option<String>) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
            speaker,
        }
    }

    /// Event type as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate => "response.create",
        }
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events received from the realtime endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error occurred
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session information
        #[serde(default)]
        session: serde_json::Value,
    },

    /// Session updated
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Session information
        #[serde(default)]
        session: serde_json::Value,
    },

    /// Input audio transcription completed
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
        /// Transcript text
        #[serde(default)]
        transcript: String,
    },

    /// Response done
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Response information
        response: Response,
    },

    /// Audio delta (audio data chunk)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
        /// Base64-encoded audio delta
        delta: String,
    },

    /// Audio done
    #[serde(rename = "response.audio.done")]
    AudioDone {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Any event type the relay does not act on
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Decode base64 audio from an AudioDelta event.
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: String,
}

/// Response information.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Response {
    /// Response ID
    #[serde(default)]
    pub id: Option<String>,
    /// Response status
    #[serde(default)]
    pub status: Option<String>,
    /// Output items
    #[serde(default)]
    pub output: Vec<ConversationItem>,
}

impl Response {
    /// ID of the last output item, used to chain the next user message.
    pub fn last_item_id(&self) -> Option<&str> {
        self.output.iter().rev().find_map(|item| item.id.as_deref())
    }
}

// =============================================================================
// Tests
// =============================================================================
