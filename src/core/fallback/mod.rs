//! Non-realtime HTTP fallbacks.
//!
//! Used when the realtime socket is unavailable: [`TtsClient`] turns a
//! reply into one MP3 clip, [`TranscriptionClient`] uploads a whole
//! utterance and returns its transcript.

mod transcription;
mod tts;

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

pub use transcription::{TranscriptionClient, TranscriptionReply, TranscriptionSettings};
pub use tts::{
    DEFAULT_TTS_MODEL, ELEVENLABS_TTS_URL, TtsClient, TtsSettings, VoiceSettings,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = concat!("learnie-voice/", env!("CARGO_PKG_VERSION"));

/// Errors from the fallback endpoints.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request failed: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Non-success status from the endpoint
    #[error("Endpoint returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FallbackError {
    /// Network failures, rate limits and server errors may clear up.
    pub fn is_retryable(&self) -> bool {
        match self {
            FallbackError::Network(_) => true,
            FallbackError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub(crate) fn http_client(timeout: Option<Duration>) -> Result<Client, FallbackError> {
    Client::builder()
        .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
        .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| FallbackError::Configuration(format!("Failed to create HTTP client: {e}")))
}

/// Map a non-success response to an error, preferring the body's `error`
/// field when it has one.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> FallbackError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error").and_then(|e| match e {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_owned),
            })
        })
        .unwrap_or_else(|| body.trim().to_string());

    match status.as_u16() {
        401 | 403 => FallbackError::Authentication(message),
        code => FallbackError::Status {
            status: code,
            message,
        },
    }
}
