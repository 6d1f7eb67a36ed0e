//! Realtime session configuration.
//!
//! Model, voice and audio-format catalogs, plus [`RealtimeConfig`], from
//! which a fresh [`SessionConfig`] is built for every connection.

use serde::{Deserialize, Serialize};

use super::base::{RealtimeError, RealtimeResult};
use super::messages::{InputAudioTranscription, MaxTokens, SessionConfig, TurnDetection};

/// Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Sample rate of PCM16 audio produced by the realtime API.
pub const REALTIME_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Default persona for the tutor.
pub const DEFAULT_INSTRUCTIONS: &str = "You are Learnie, a friendly tutor for children. \
Speak simply and clearly. Be encouraging and positive.";

// =============================================================================
// Models
// =============================================================================

/// Supported realtime models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RealtimeModel {
    /// GPT-4o Realtime Preview 2024-10-01
    #[default]
    #[serde(rename = "gpt-4o-realtime-preview-2024-10-01")]
    Gpt4oRealtimePreview20241001,
    /// GPT-4o Realtime Preview
    #[serde(rename = "gpt-4o-realtime-preview")]
    Gpt4oRealtimePreview,
    /// GPT-4o Realtime Preview 2024-12-17
    #[serde(rename = "gpt-4o-realtime-preview-2024-12-17")]
    Gpt4oRealtimePreview20241217,
    /// GPT-4o Mini Realtime Preview
    #[serde(rename = "gpt-4o-mini-realtime-preview")]
    Gpt4oMiniRealtimePreview,
}

impl RealtimeModel {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4oRealtimePreview20241001 => "gpt-4o-realtime-preview-2024-10-01",
            Self::Gpt4oRealtimePreview => "gpt-4o-realtime-preview",
            Self::Gpt4oRealtimePreview20241217 => "gpt-4o-realtime-preview-2024-12-17",
            Self::Gpt4oMiniRealtimePreview => "gpt-4o-mini-realtime-preview",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "gpt-4o-realtime-preview" => Self::Gpt4oRealtimePreview,
            "gpt-4o-realtime-preview-2024-12-17" => Self::Gpt4oRealtimePreview20241217,
            "gpt-4o-mini-realtime-preview" => Self::Gpt4oMiniRealtimePreview,
            _ => Self::default(),
        }
    }
}

impl std::fmt::Display for RealtimeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Voices
// =============================================================================

/// Available assistant voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeVoice {
    /// Alloy voice
    Alloy,
    /// Ash voice
    Ash,
    /// Coral voice
    Coral,
    /// Echo voice (default)
    #[default]
    Echo,
    /// Sage voice
    Sage,
    /// Shimmer voice
    Shimmer,
    /// Verse voice
    Verse,
}

impl RealtimeVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
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
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::default(),
        }
    }
}

impl std::fmt::Display for RealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Session settings
// =============================================================================

/// Settings for the realtime session, applied on every (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, without the `model` query parameter
    pub url: String,
    /// Model to use
    pub model: RealtimeModel,
    /// Assistant voice
    pub voice: RealtimeVoice,
    /// System instructions for the assistant
    pub instructions: String,
    /// Temperature for response generation (0.6 to 1.2)
    pub temperature: f32,
    /// Maximum response tokens (negative for unbounded)
    pub max_response_output_tokens: i32,
    /// Transcription model for user speech; `None` disables transcripts
    pub transcription_model: Option<String>,
    /// Turn detection
    pub turn_detection: TurnDetection,
    /// Response modalities
    pub modalities: Vec<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: OPENAI_REALTIME_URL.to_string(),
            model: RealtimeModel::default(),
            voice: RealtimeVoice::default(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: 0.8,
            max_response_output_tokens: -1,
            transcription_model: Some("whisper-1".to_string()),
            turn_detection: TurnDetection::default(),
            modalities: vec!["text".to_string(), "audio".to_string()],
        }
    }
}

impl RealtimeConfig {
    /// Build the WebSocket URL with the model parameter.
    pub fn ws_url(&self) -> RealtimeResult<url::Url> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("realtime url: {}", e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RealtimeError::InvalidConfiguration(format!(
                    "realtime url must use ws or wss, got {}",
                    other
                )));
            }
        }
        if !url.query_pairs().any(|(k, _)| k == "model") {
            url.query_pairs_mut().append_pair("model", self.model.as_str());
        }
        Ok(url)
    }

    /// Build a fresh session configuration for one connection.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(self.modalities.clone()),
            instructions: Some(self.instructions.clone()),
            voice: Some(self.voice.as_str().to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: self
                .transcription_model
                .as_ref()
                .map(|model| InputAudioTranscription {
                    model: model.clone(),
                }),
            turn_detection: Some(self.turn_detection.clone()),
            temperature: Some(self.temperature),
            max_response_output_tokens: Some(MaxTokens::from_limit(
                self.max_response_output_tokens,
            )),
        }
    }

    /// Whether the server decides turn boundaries.
    pub fn server_turn_detection(&self) -> bool {
        !matches!(self.turn_detection, TurnDetection::None {})
    }
}
