//! Environment variable overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, VoiceConfig};
use crate::core::realtime::{RealtimeModel, RealtimeVoice};

/// Every variable read by [`apply`].
pub(super) const ENV_VARS: [&str; 16] = [
    "OPENAI_API_KEY",
    "LEARNIE_TOKEN_URL",
    "LEARNIE_TOKEN_AUTH",
    "LEARNIE_REALTIME_URL",
    "LEARNIE_REALTIME_MODEL",
    "LEARNIE_VOICE",
    "LEARNIE_INSTRUCTIONS",
    "LEARNIE_SAMPLE_RATE",
    "LEARNIE_SILENCE_THRESHOLD",
    "LEARNIE_SILENCE_DURATION_MS",
    "LEARNIE_HISTORY_FILE",
    "LEARNIE_RECONNECT_MAX_ATTEMPTS",
    "ELEVENLABS_API_KEY",
    "ELEVENLABS_VOICE_ID",
    "LEARNIE_TTS_URL",
    "LEARNIE_TRANSCRIPTION_URL",
];

/// Non-empty value of `name`.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value: raw }),
        None => Ok(None),
    }
}

/// Overlay the environment on `config`.
pub(super) fn apply(config: &mut VoiceConfig) -> Result<(), ConfigError> {
    if let Some(key) = var("OPENAI_API_KEY") {
        config.auth.api_key = Some(key);
    }
    if let Some(url) = var("LEARNIE_TOKEN_URL") {
        config.auth.token_url = Some(url);
    }
    if let Some(auth) = var("LEARNIE_TOKEN_AUTH") {
        config.auth.token_auth = Some(auth.clone());
        config.fallback.auth_token = Some(auth);
    }

    if let Some(url) = var("LEARNIE_REALTIME_URL") {
        config.realtime.url = url;
    }
    if let Some(model) = var("LEARNIE_REALTIME_MODEL") {
        config.realtime.model = RealtimeModel::from_str_or_default(&model);
    }
    if let Some(voice) = var("LEARNIE_VOICE") {
        config.realtime.voice = RealtimeVoice::from_str_or_default(&voice);
    }
    if let Some(instructions) = var("LEARNIE_INSTRUCTIONS") {
        config.realtime.instructions = instructions;
    }

    if let Some(rate) = parsed("LEARNIE_SAMPLE_RATE")? {
        config.audio.sample_rate = rate;
    }
    if let Some(threshold) = parsed("LEARNIE_SILENCE_THRESHOLD")? {
        config.audio.silence_threshold = threshold;
    }
    if let Some(duration) = parsed("LEARNIE_SILENCE_DURATION_MS")? {
        config.audio.silence_duration_ms = duration;
    }

    if let Some(path) = var("LEARNIE_HISTORY_FILE") {
        config.session.history_file = Some(PathBuf::from(path));
    }
    if let Some(attempts) = parsed("LEARNIE_RECONNECT_MAX_ATTEMPTS")? {
        config.connection.reconnection.max_attempts = attempts;
    }

    if let Some(key) = var("ELEVENLABS_API_KEY") {
        config.fallback.tts_api_key = Some(key);
    }
    if let Some(voice) = var("ELEVENLABS_VOICE_ID") {
        config.fallback.voice_id = Some(voice);
    }
    if let Some(url) = var("LEARNIE_TTS_URL") {
        config.fallback.tts_url = url;
    }
    if let Some(url) = var("LEARNIE_TRANSCRIPTION_URL") {
        config.fallback.transcription_url = Some(url);
    }

    Ok(())
}
