//! Whole-utterance transcription fallback.
//!
//! The endpoint takes `{"audioData": <base64>}` and answers with
//! `{"message", "transcribedText"}`.

use std::io::Cursor;
use std::time::Duration;

use base64::prelude::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{FallbackError, http_client, status_error};
use crate::core::codec;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionSettings {
    pub url: String,
    /// Bearer token for the endpoint
    pub auth_token: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptionRequest {
    audio_data: String,
}

/// Endpoint reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionReply {
    /// Text to show or speak back
    #[serde(default)]
    pub message: String,
    /// Absent when the endpoint answers without transcribing
    #[serde(default)]
    pub transcribed_text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// HTTP transcription client.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    settings: TranscriptionSettings,
    endpoint: url::Url,
    http: Client,
}

impl TranscriptionClient {
    pub fn new(settings: TranscriptionSettings) -> Result<Self, FallbackError> {
        let endpoint = url::Url::parse(&settings.url).map_err(|e| {
            FallbackError::Configuration(format!("transcription url '{}': {}", settings.url, e))
        })?;
        let http = http_client(settings.timeout)?;
        Ok(Self {
            settings,
            endpoint,
            http,
        })
    }

    /// Transcribe mono samples, uploaded as a PCM16 WAV file.
    pub async fn transcribe_samples(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<TranscriptionReply, FallbackError> {
        if samples.is_empty() {
            return Err(FallbackError::InvalidInput("Audio data is required".to_string()));
        }
        let wav = wav_bytes(samples, sample_rate)?;
        self.transcribe_bytes(&wav).await
    }

    /// Transcribe an already-encoded audio file.
    pub async fn transcribe_bytes(&self, audio: &[u8]) -> Result<TranscriptionReply, FallbackError> {
        if audio.is_empty() {
            return Err(FallbackError::InvalidInput("Audio data is required".to_string()));
        }

        let body = TranscriptionRequest {
            audio_data: BASE64_STANDARD.encode(audio),
        };
        debug!("Uploading {} bytes for transcription", audio.len());

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.settings.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Transcription request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FallbackError::Network(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let reply: TranscriptionReply = serde_json::from_str(&text)
            .map_err(|e| FallbackError::InvalidResponse(format!("Failed to parse response: {e}")))?;
        info!(
            "Transcription received: {}",
            reply.transcribed_text.as_deref().unwrap_or("<none>")
        );
        Ok(reply)
    }
}

/// Encode mono samples as a 16-bit WAV file in memory.
pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, FallbackError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut buffer, spec)
            .map_err(|e| FallbackError::InvalidInput(format!("WAV encoding failed: {e}")))?;
        for &sample in samples {
            writer
                .write_sample(codec::sample_to_i16(sample))
                .map_err(|e| FallbackError::InvalidInput(format!("WAV encoding failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| FallbackError::InvalidInput(format!("WAV encoding failed: {e}")))?;
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client(server: &MockServer) -> TranscriptionClient {
        TranscriptionClient::new(TranscriptionSettings {
            url: format!("{}/functions/v1/process-audio", server.uri()),
            auth_token: Some("anon".to_string()),
            timeout: None,
        })
        .unwrap()
    }

    #[test]
    fn test_wav_bytes_header_and_length() {
        let wav = wav_bytes(&[0.0, 0.5, -0.5, 1.0], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4 * 2);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![0, 16384, -16384, 32767]);
    }

    #[tokio::test]
    async fn test_transcribe_posts_base64_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/process-audio"))
            .and(header("authorization", "Bearer anon"))
            .respond_with(|req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let audio = BASE64_STANDARD
                    .decode(body["audioData"].as_str().unwrap())
                    .unwrap();
                assert_eq!(&audio[0..4], b"RIFF");
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "message": "I heard you say: \"hello\"",
                    "transcribedText": "hello",
                    "status": "success"
                }))
            })
            .expect(1)
            .mount(&server)
            .await;

        let reply = client(&server)
            .transcribe_samples(&[0.1; 160], 16000)
            .await
            .unwrap();
        assert_eq!(reply.transcribed_text.as_deref(), Some("hello"));
        assert_eq!(reply.message, "I heard you say: \"hello\"");
    }

    #[tokio::test]
    async fn test_demo_reply_without_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "I heard you! This is a demo response.",
                "status": "success"
            })))
            .mount(&server)
            .await;

        let reply = client(&server).transcribe_bytes(b"audio").await.unwrap();
        assert_eq!(reply.transcribed_text, None);
    }

    #[tokio::test]
    async fn test_error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "Audio data is required"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).transcribe_bytes(b"x").await.unwrap_err();
        assert!(
            matches!(err, FallbackError::Status { status: 400, ref message } if message == "Audio data is required")
        );
    }

    #[tokio::test]
    async fn test_empty_audio_rejected_locally() {
        let server = MockServer::start().await;
        assert!(matches!(
            client(&server).transcribe_samples(&[], 16000).await,
            Err(FallbackError::InvalidInput(_))
        ));
    }
}
