//! Crate-level error type.
//!
//! Each layer has its own error enum; [`VoiceError`] wraps them for callers
//! that drive the whole stack and maps each to a retry class and a message
//! suitable for a child-facing UI.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::capture::CaptureError;
use crate::core::fallback::FallbackError;
use crate::core::playback::PlaybackError;
use crate::core::realtime::RealtimeError;
use crate::core::session::HistoryError;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation needs an active conversation
    #[error("No active conversation")]
    NotActive,

    /// The session controller has shut down
    #[error("Session closed")]
    SessionClosed,
}

pub type VoiceResult<T> = Result<T, VoiceError>;

impl VoiceError {
    /// Whether trying again without user action may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            VoiceError::Capture(e) => e.is_retryable(),
            VoiceError::Realtime(e) => e.is_retryable(),
            VoiceError::Fallback(e) => e.is_retryable(),
            VoiceError::Playback(_)
            | VoiceError::History(_)
            | VoiceError::Config(_)
            | VoiceError::NotActive
            | VoiceError::SessionClosed => false,
        }
    }

    /// Short message to show the user.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::Realtime(e) => realtime_message(e),
            VoiceError::Capture(e) => capture_message(e),
            VoiceError::Playback(_) => "Learnie's voice couldn't be played.".to_string(),
            VoiceError::Fallback(_) => "Something went wrong. Please try again.".to_string(),
            VoiceError::History(_) => "Couldn't save the conversation.".to_string(),
            VoiceError::Config(e) => e.to_string(),
            VoiceError::NotActive => "Tap to talk first!".to_string(),
            VoiceError::SessionClosed => "The conversation has ended.".to_string(),
        }
    }
}

pub(crate) fn realtime_message(err: &RealtimeError) -> String {
    match err {
        RealtimeError::SessionTimeout(_) => "Connection timed out. Please try again.".to_string(),
        RealtimeError::ConnectionLost { .. } => {
            "Connection lost. Tap to reconnect.".to_string()
        }
        RealtimeError::AuthenticationFailed(_) => {
            "Couldn't start a session with Learnie. Please try again later.".to_string()
        }
        RealtimeError::ConnectionFailed(_) | RealtimeError::WebSocketError(_) => {
            "Couldn't connect to Learnie. Please check your internet connection.".to_string()
        }
        RealtimeError::ProviderError(message) => message.clone(),
        _ => "Something went wrong. Please try again.".to_string(),
    }
}

pub(crate) fn capture_message(err: &CaptureError) -> String {
    match err {
        CaptureError::PermissionDenied(_) => {
            "Microphone access was denied. Please allow the microphone and try again.".to_string()
        }
        CaptureError::Device(_) => "No microphone was found.".to_string(),
        CaptureError::DeviceLost(_) => "The microphone stopped working.".to_string(),
        CaptureError::Closed => "The microphone was turned off.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        assert!(!VoiceError::from(CaptureError::PermissionDenied("no".into())).is_retryable());
        assert!(!VoiceError::from(CaptureError::Device("none".into())).is_retryable());
        assert!(VoiceError::from(RealtimeError::ConnectionFailed("refused".into())).is_retryable());
        assert!(!VoiceError::from(RealtimeError::ProtocolError("bad".into())).is_retryable());
        assert!(VoiceError::from(RealtimeError::SessionTimeout(10_000)).is_retryable());
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            VoiceError::from(RealtimeError::SessionTimeout(10_000)).user_message(),
            "Connection timed out. Please try again."
        );
        assert!(
            VoiceError::from(CaptureError::PermissionDenied("denied".into()))
                .user_message()
                .starts_with("Microphone access was denied")
        );
    }

    #[test]
    fn test_display_is_transparent() {
        let err = VoiceError::from(RealtimeError::NotConnected);
        assert_eq!(err.to_string(), "Not connected");
    }
}
