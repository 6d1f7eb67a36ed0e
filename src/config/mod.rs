//! Configuration for the voice client.
//!
//! Values come from defaults, environment variables (including a `.env` file
//! loaded by the binary) and an optional YAML file. Priority:
//! YAML > ENV vars > .env values > defaults.
//!
//! # Example
//! ```rust,no_run
//! use learnie_voice::config::VoiceConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment only
//! let config = VoiceConfig::from_env()?;
//!
//! // YAML on top of the environment
//! let config = VoiceConfig::from_file(&PathBuf::from("learnie.yaml"))?;
//! println!("Realtime endpoint: {}", config.realtime.url);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

mod env;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::capture::{
    CaptureSettings, DEFAULT_BLOCK_SIZE, DEFAULT_SILENCE_DURATION, DEFAULT_SILENCE_THRESHOLD,
};
use crate::core::fallback::{
    DEFAULT_TTS_MODEL, ELEVENLABS_TTS_URL, TranscriptionSettings, TtsSettings, VoiceSettings,
};
use crate::core::realtime::{
    ConnectionSettings, EphemeralTokenProvider, RealtimeConfig, ReconnectionConfig,
    StaticKeyProvider, TokenProvider, WebSocketConnector,
};
use crate::core::session::{DEFAULT_HISTORY_CAP, SessionSettings};

/// Capture rates the realtime API accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [16000, 24000];

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: '{value}'")]
    Env { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Credentials for the realtime socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthConfig {
    /// Long-lived API key used directly
    pub api_key: Option<String>,
    /// Intermediary endpoint that issues short-lived session tokens
    pub token_url: Option<String>,
    /// Bearer credential for the token endpoint
    pub token_auth: Option<String>,
}

impl Drop for AuthConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
        if let Some(ref mut auth) = self.token_auth {
            auth.zeroize();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Capture rate, 16000 or 24000
    pub sample_rate: u32,
    /// Samples per capture block
    pub block_size: usize,
    /// RMS below which a block counts as silent
    pub silence_threshold: f32,
    pub silence_duration_ms: u64,
    /// Microphone name; the system default when unset
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            block_size: DEFAULT_BLOCK_SIZE,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_duration_ms: DEFAULT_SILENCE_DURATION.as_millis() as u64,
            input_device: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub keepalive_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub handshake_timeout_ms: u64,
    /// Client events held until the handshake completes
    pub pending_capacity: usize,
    pub reconnection: ReconnectionConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            inactivity_timeout_secs: 300,
            handshake_timeout_ms: 10_000,
            pending_capacity: 64,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub handshake_retries: u32,
    pub retry_delay_ms: u64,
    pub auto_stop_secs: u64,
    pub interrupt_settle_ms: u64,
    pub history_cap: usize,
    pub merge_window_secs: u64,
    pub history_file: Option<PathBuf>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            handshake_retries: 2,
            retry_delay_ms: 2000,
            auto_stop_secs: 30,
            interrupt_settle_ms: 100,
            history_cap: DEFAULT_HISTORY_CAP,
            merge_window_secs: 10,
            history_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    pub tts_url: String,
    pub tts_api_key: Option<String>,
    pub voice_id: Option<String>,
    pub tts_model: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub transcription_url: Option<String>,
    /// Bearer credential for relay endpoints
    pub auth_token: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let voice = VoiceSettings::default();
        Self {
            tts_url: ELEVENLABS_TTS_URL.to_string(),
            tts_api_key: None,
            voice_id: None,
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            stability: voice.stability,
            similarity_boost: voice.similarity_boost,
            transcription_url: None,
            auth_token: None,
        }
    }
}

impl Drop for FallbackConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.tts_api_key {
            key.zeroize();
        }
        if let Some(ref mut token) = self.auth_token {
            token.zeroize();
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceConfig {
    pub realtime: RealtimeConfig,
    pub auth: AuthConfig,
    pub audio: AudioConfig,
    pub connection: ConnectionConfig,
    pub session: ConversationConfig,
    pub fallback: FallbackConfig,
}

impl VoiceConfig {
    /// Load from environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        env::apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file over the environment.
    ///
    /// The `.env` file is loaded by the binary at startup, so by the time
    /// this runs its values are ordinary environment variables.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::default();
        env::apply(&mut config)?;
        yaml.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample rate must be 16000 or 24000, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.block_size == 0 {
            return Err(ConfigError::Invalid("block size must be positive".to_string()));
        }
        if !(self.audio.silence_threshold > 0.0 && self.audio.silence_threshold < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "silence threshold must be between 0 and 1, got {}",
                self.audio.silence_threshold
            )));
        }
        if self.connection.pending_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pending capacity must be positive".to_string(),
            ));
        }
        if !(0.6..=1.2).contains(&self.realtime.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature must be between 0.6 and 1.2, got {}",
                self.realtime.temperature
            )));
        }

        self.realtime
            .ws_url()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        check_http_url("auth.token_url", self.auth.token_url.as_deref())?;
        check_http_url("fallback.tts_url", Some(self.fallback.tts_url.as_str()))?;
        check_http_url(
            "fallback.transcription_url",
            self.fallback.transcription_url.as_deref(),
        )?;
        Ok(())
    }

    /// Whether a credential source for the realtime socket is configured.
    pub fn has_realtime_credentials(&self) -> bool {
        self.auth.api_key.is_some() || self.auth.token_url.is_some()
    }

    /// Token source for the socket: the token endpoint when set, else the key.
    pub fn token_provider(&self) -> Result<Option<Arc<dyn TokenProvider>>, ConfigError> {
        if let Some(url) = &self.auth.token_url {
            let provider = EphemeralTokenProvider::new(url.clone(), self.auth.token_auth.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            return Ok(Some(Arc::new(provider)));
        }
        Ok(self
            .auth
            .api_key
            .as_ref()
            .map(|key| Arc::new(StaticKeyProvider::new(key.clone())) as Arc<dyn TokenProvider>))
    }

    pub fn connector(&self) -> Result<WebSocketConnector, ConfigError> {
        let url = self
            .realtime
            .ws_url()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(WebSocketConnector::new(url, self.token_provider()?))
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            sample_rate: self.audio.sample_rate,
            block_size: self.audio.block_size,
            silence_threshold: self.audio.silence_threshold,
            silence_duration: Duration::from_millis(self.audio.silence_duration_ms),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            keepalive_interval: Duration::from_secs(self.connection.keepalive_secs),
            inactivity_timeout: Duration::from_secs(self.connection.inactivity_timeout_secs),
            handshake_timeout: Duration::from_millis(self.connection.handshake_timeout_ms),
            pending_capacity: self.connection.pending_capacity,
            reconnection: self.connection.reconnection.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_retries: self.session.handshake_retries,
            retry_delay: Duration::from_millis(self.session.retry_delay_ms),
            auto_stop_after: Duration::from_secs(self.session.auto_stop_secs),
            interrupt_settle: Duration::from_millis(self.session.interrupt_settle_ms),
            history_cap: self.session.history_cap,
            merge_window: Duration::from_secs(self.session.merge_window_secs),
            history_file: self.session.history_file.clone(),
        }
    }

    pub fn tts_settings(&self) -> TtsSettings {
        TtsSettings {
            url: self.fallback.tts_url.clone(),
            api_key: self.fallback.tts_api_key.clone(),
            auth_token: self.fallback.auth_token.clone(),
            voice_id: self.fallback.voice_id.clone(),
            model_id: self.fallback.tts_model.clone(),
            voice_settings: VoiceSettings {
                stability: self.fallback.stability,
                similarity_boost: self.fallback.similarity_boost,
            },
            timeout: None,
        }
    }

    /// `None` when no transcription endpoint is configured.
    pub fn transcription_settings(&self) -> Option<TranscriptionSettings> {
        self.fallback
            .transcription_url
            .as_ref()
            .map(|url| TranscriptionSettings {
                url: url.clone(),
                auth_token: self.fallback.auth_token.clone(),
                timeout: None,
            })
    }
}

fn check_http_url(name: &str, value: Option<&str>) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    let url = url::Url::parse(value)
        .map_err(|e| ConfigError::Invalid(format!("{} '{}': {}", name, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!(
            "{} must use http or https, got {}",
            name, other
        ))),
    }
}
