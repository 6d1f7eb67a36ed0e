//! Text-to-speech fallback.
//!
//! Sends an ElevenLabs-compatible request and returns the complete MP3
//! payload. A relay that only reads `text` accepts the same body.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{FallbackError, http_client, status_error};

/// ElevenLabs text-to-speech base URL; the voice ID is appended.
pub const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

pub const DEFAULT_TTS_MODEL: &str = "eleven_monolingual_v1";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.8,
            similarity_boost: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    /// Endpoint; with a voice ID the request goes to `{url}/{voice_id}/stream`
    pub url: String,
    /// Sent as `xi-api-key`
    pub api_key: Option<String>,
    /// Sent as a bearer token, for relays
    pub auth_token: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: String,
    pub voice_settings: VoiceSettings,
    pub timeout: Option<Duration>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            url: ELEVENLABS_TTS_URL.to_string(),
            api_key: None,
            auth_token: None,
            voice_id: None,
            model_id: DEFAULT_TTS_MODEL.to_string(),
            voice_settings: VoiceSettings::default(),
            timeout: None,
        }
    }
}

impl TtsSettings {
    fn endpoint(&self) -> Result<url::Url, FallbackError> {
        let base = self.url.trim_end_matches('/');
        let full = match &self.voice_id {
            Some(voice) if !voice.is_empty() => format!("{}/{}/stream", base, voice),
            _ => base.to_string(),
        };
        url::Url::parse(&full)
            .map_err(|e| FallbackError::Configuration(format!("tts url '{}': {}", full, e)))
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// HTTP text-to-speech client.
#[derive(Debug, Clone)]
pub struct TtsClient {
    settings: TtsSettings,
    endpoint: url::Url,
    http: Client,
}

impl TtsClient {
    pub fn new(settings: TtsSettings) -> Result<Self, FallbackError> {
        let endpoint = settings.endpoint()?;
        let http = http_client(settings.timeout)?;
        Ok(Self {
            settings,
            endpoint,
            http,
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    /// Synthesize `text` and return the whole MP3 clip.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes, FallbackError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FallbackError::InvalidInput("Text is required".to_string()));
        }

        let body = SpeechRequest {
            text,
            model_id: &self.settings.model_id,
            voice_settings: self.settings.voice_settings,
        };

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("Accept", "audio/mpeg")
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.header("xi-api-key", key);
        }
        if let Some(token) = &self.settings.auth_token {
            request = request.bearer_auth(token);
        }

        debug!("Requesting fallback speech for {} chars", text.len());
        let response = request
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("TTS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| FallbackError::Network(format!("Failed to read TTS audio: {e}")))?;
        if audio.is_empty() {
            return Err(FallbackError::InvalidResponse("empty audio payload".to_string()));
        }
        info!("Fallback speech received ({} bytes)", audio.len());
        Ok(audio)
    }
}
