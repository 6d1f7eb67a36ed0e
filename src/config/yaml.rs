use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{ConfigError, VoiceConfig};
use crate::core::realtime::{RealtimeModel, RealtimeVoice, TurnDetection};

/// YAML configuration file.
///
/// Every field is optional; anything present overrides the environment.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   temperature: 0.8
///   turn_detection:
///     type: server_vad
///     threshold: 0.5
///     silence_duration_ms: 1000
///
/// auth:
///   token_url: "https://relay.example.com/functions/v1/realtime-token"
///   token_auth: "anon-key"
///
/// audio:
///   sample_rate: 24000
///   silence_threshold: 0.01
///   silence_duration_ms: 2000
///
/// connection:
///   keepalive_secs: 30
///   max_reconnect_attempts: 3
///
/// session:
///   history_file: "~/.learnie/history.json"
///
/// fallback:
///   elevenlabs_api_key: "el-key"
///   voice_id: "21m00Tcm4TlvDq8ikWAM"
///   transcription_url: "https://relay.example.com/functions/v1/process-audio"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub auth: Option<AuthYaml>,
    pub audio: Option<AudioYaml>,
    pub connection: Option<ConnectionYaml>,
    pub session: Option<SessionYaml>,
    pub fallback: Option<FallbackYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub max_response_output_tokens: Option<i32>,
    pub transcription_model: Option<String>,
    pub turn_detection: Option<TurnDetection>,
    pub modalities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub api_key: Option<String>,
    pub token_url: Option<String>,
    pub token_auth: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub sample_rate: Option<u32>,
    pub block_size: Option<usize>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_ms: Option<u64>,
    pub input_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionYaml {
    pub keepalive_secs: Option<u64>,
    pub inactivity_timeout_secs: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub pending_capacity: Option<usize>,
    pub reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_initial_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub reconnect_backoff_multiplier: Option<f32>,
    pub reconnect_jitter: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub handshake_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub auto_stop_secs: Option<u64>,
    pub interrupt_settle_ms: Option<u64>,
    pub history_cap: Option<usize>,
    pub merge_window_secs: Option<u64>,
    pub history_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackYaml {
    pub tts_url: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub voice_id: Option<String>,
    pub tts_model: Option<String>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub transcription_url: Option<String>,
    pub auth_token: Option<String>,
}

macro_rules! set {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
}

macro_rules! set_some {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = Some(v);
        }
    };
}

impl YamlConfig {
    /// Load YAML configuration from a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Overlay the values present in the file on `config`.
    pub fn apply(self, config: &mut VoiceConfig) {
        if let Some(realtime) = self.realtime {
            let target = &mut config.realtime;
            set!(target.url, realtime.url);
            if let Some(model) = realtime.model {
                target.model = RealtimeModel::from_str_or_default(&model);
            }
            if let Some(voice) = realtime.voice {
                target.voice = RealtimeVoice::from_str_or_default(&voice);
            }
            set!(target.instructions, realtime.instructions);
            set!(target.temperature, realtime.temperature);
            set!(
                target.max_response_output_tokens,
                realtime.max_response_output_tokens
            );
            set_some!(target.transcription_model, realtime.transcription_model);
            set!(target.turn_detection, realtime.turn_detection);
            set!(target.modalities, realtime.modalities);
        }

        if let Some(auth) = self.auth {
            set_some!(config.auth.api_key, auth.api_key);
            set_some!(config.auth.token_url, auth.token_url);
            set_some!(config.auth.token_auth, auth.token_auth);
        }

        if let Some(audio) = self.audio {
            set!(config.audio.sample_rate, audio.sample_rate);
            set!(config.audio.block_size, audio.block_size);
            set!(config.audio.silence_threshold, audio.silence_threshold);
            set!(config.audio.silence_duration_ms, audio.silence_duration_ms);
            set_some!(config.audio.input_device, audio.input_device);
        }

        if let Some(connection) = self.connection {
            let target = &mut config.connection;
            set!(target.keepalive_secs, connection.keepalive_secs);
            set!(
                target.inactivity_timeout_secs,
                connection.inactivity_timeout_secs
            );
            set!(target.handshake_timeout_ms, connection.handshake_timeout_ms);
            set!(target.pending_capacity, connection.pending_capacity);
            set!(target.reconnection.enabled, connection.reconnect);
            set!(
                target.reconnection.max_attempts,
                connection.max_reconnect_attempts
            );
            set!(
                target.reconnection.initial_delay_ms,
                connection.reconnect_initial_delay_ms
            );
            set!(
                target.reconnection.max_delay_ms,
                connection.reconnect_max_delay_ms
            );
            set!(
                target.reconnection.backoff_multiplier,
                connection.reconnect_backoff_multiplier
            );
            set!(target.reconnection.jitter, connection.reconnect_jitter);
        }

        if let Some(session) = self.session {
            let target = &mut config.session;
            set!(target.handshake_retries, session.handshake_retries);
            set!(target.retry_delay_ms, session.retry_delay_ms);
            set!(target.auto_stop_secs, session.auto_stop_secs);
            set!(target.interrupt_settle_ms, session.interrupt_settle_ms);
            set!(target.history_cap, session.history_cap);
            set!(target.merge_window_secs, session.merge_window_secs);
            set_some!(target.history_file, session.history_file.map(PathBuf::from));
        }

        if let Some(fallback) = self.fallback {
            let target = &mut config.fallback;
            set!(target.tts_url, fallback.tts_url);
            set_some!(target.tts_api_key, fallback.elevenlabs_api_key);
            set_some!(target.voice_id, fallback.voice_id);
            set!(target.tts_model, fallback.tts_model);
            set!(target.stability, fallback.stability);
            set!(target.similarity_boost, fallback.similarity_boost);
            set_some!(target.transcription_url, fallback.transcription_url);
            set_some!(target.auth_token, fallback.auth_token);
        }
    }
}
