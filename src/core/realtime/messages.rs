//! Realtime wire protocol.
//!
//! One JSON object per WebSocket text frame, discriminated by its `type`
//! field. Inbound frames are parsed once into [`ServerEvent`] at the
//! transport boundary; everything downstream pattern-matches on the enum.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Session configuration, sent once per connection
//! - input_audio_buffer.append - Base64 PCM16 audio
//! - input_audio_buffer.commit - Finalize the user turn
//! - input_audio_buffer.clear - Drop uncommitted audio
//! - conversation.item.create - Add a typed user message
//! - response.create - Request generation
//! - response.cancel - Interrupt generation
//!
//! Server events (received from server):
//! - session.created / session.updated - Handshake acknowledgments
//! - input_audio_buffer.speech_started / speech_stopped / committed
//! - conversation.item.input_audio_transcription.completed - User transcript
//! - response.created / response.done
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.delta / response.audio_transcript.done
//! - moderation.violation - Content flagged by the relay
//! - pong / heartbeat - Relay liveness replies
//! - error
//!
//! Audio is always base64-in-JSON; appends carry no `name` field.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use super::base::{RealtimeError, RealtimeResult};
use crate::core::codec::EncodedChunk;

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration sent in `session.update`.
///
/// Built fresh for every connection and never mutated after it is sent.
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

    /// Temperature for response generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum response output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(i32),
    /// Unbounded, serialized as `"inf"`
    Infinite(String),
}

impl MaxTokens {
    /// Map a configured limit; negative values mean unbounded.
    pub fn from_limit(limit: i32) -> Self {
        if limit < 0 {
            MaxTokens::Infinite("inf".to_string())
        } else {
            MaxTokens::Number(limit)
        }
    }
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
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
    /// Turns are committed by the client
    #[serde(rename = "none")]
    None {},
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(1000),
        }
    }
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item role (user, assistant, system)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

/// Content part within a conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Transcript of audio content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Response configuration for `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Response modalities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    /// Per-response instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent over the realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
        /// Base64-encoded PCM16 audio
        audio: String,
    },

    /// Commit the input audio buffer
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
    },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Response configuration
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    /// Cancel the current response
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event from raw PCM16 bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    /// Create an audio append event from an encoded capture block.
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: chunk.to_base64(),
        }
    }

    /// A typed user message.
    pub fn user_text(text: &str) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                id: None,
                item_type: "message".to_string(),
                role: Some("user".to_string()),
                content: Some(vec![ContentPart {
                    content_type: "input_text".to_string(),
                    text: Some(text.to_string()),
                    transcript: None,
                }]),
            },
        }
    }

    /// `response.create` with server-side defaults.
    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    /// Whether this event carries user audio.
    pub fn is_audio(&self) -> bool {
        matches!(self, ClientEvent::InputAudioBufferAppend { .. })
    }

    /// The wire `type` string.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }

    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> RealtimeResult<String> {
        serde_json::to_string(self).map_err(|e| RealtimeError::SerializationError(e.to_string()))
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events received over the realtime connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error reported by the API or the relay
    #[serde(rename = "error")]
    Error {
        /// Structured API error
        #[serde(default)]
        error: Option<ApiError>,
        /// Plain message used by the relay
        #[serde(default)]
        message: Option<String>,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session information
        #[serde(default)]
        session: Session,
    },

    /// Session configuration applied
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Session information
        #[serde(default)]
        session: Session,
    },

    /// Speech detected in the input buffer
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Audio start in ms
        #[serde(default)]
        audio_start_ms: u64,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// End of speech detected in the input buffer
    #[serde(rename = "input_audio_buffer.speech_stopped", alias = "speech_stopped")]
    SpeechStopped {
        /// Audio end in ms
        #[serde(default)]
        audio_end_ms: u64,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Input buffer committed (by the client or by server VAD)
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// User speech transcript
    #[serde(
        rename = "conversation.item.input_audio_transcription.completed",
        alias = "input_audio_transcript.update"
    )]
    TranscriptionCompleted {
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
        /// Transcribed text
        #[serde(default)]
        transcript: String,
    },

    /// Response generation started
    #[serde(rename = "response.created")]
    ResponseCreated {
        /// Response information
        #[serde(default)]
        response: Option<Response>,
    },

    /// Response complete
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Response information
        #[serde(default)]
        response: Option<Response>,
    },

    /// Audio chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64 PCM16 audio
        delta: String,
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Audio generation complete
    #[serde(rename = "response.audio.done")]
    AudioDone {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant transcript chunk
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        /// Text fragment
        delta: String,
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant transcript complete
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        /// Full transcript
        #[serde(default)]
        transcript: String,
    },

    /// Text-only response chunk
    #[serde(rename = "response.text.delta")]
    TextDelta {
        /// Text fragment
        delta: String,
    },

    /// Content flagged by the relay's safety system
    #[serde(rename = "moderation.violation")]
    ModerationViolation {
        /// Reason reported by the relay
        #[serde(default)]
        message: Option<String>,
    },

    /// Relay reply to a keepalive
    #[serde(rename = "pong")]
    Pong,

    /// Relay liveness beacon
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// Any other well-formed event type
    #[serde(other)]
    Unhandled,
}

impl ServerEvent {
    /// Parse one inbound text frame.
    ///
    /// Malformed JSON, a missing `type`, or a known type with invalid fields
    /// yields [`RealtimeError::ProtocolError`].
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        serde_json::from_str::<ServerEvent>(text).map_err(|e| {
            let kind = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
            match kind {
                Some(kind) => RealtimeError::ProtocolError(format!("invalid '{}' event: {}", kind, e)),
                None => RealtimeError::ProtocolError(format!("malformed frame: {}", e)),
            }
        })
    }

    /// Decode base64 audio from an AudioDelta event.
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }

    /// Human-readable message of an `error` event.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ServerEvent::Error { error, message } => Some(match (error, message) {
                (Some(err), _) => format!("{}: {}", err.error_type, err.message),
                (None, Some(msg)) => msg.clone(),
                (None, None) => "Unknown error".to_string(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
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

/// Session information.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Session ID
    pub id: String,
    /// Model used
    pub model: String,
    /// Voice
    pub voice: Option<String>,
    /// Response modalities
    pub modalities: Vec<String>,
    /// Turn detection config
    pub turn_detection: Option<TurnDetection>,
}

/// Response information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    /// Response ID
    #[serde(default)]
    pub id: String,
    /// Response status (completed, cancelled, failed, incomplete)
    #[serde(default)]
    pub status: String,
}
