pub mod capture;
pub mod codec;
pub mod fallback;
pub mod playback;
pub mod realtime;
pub mod session;

// Re-export commonly used types for convenience
pub use capture::{AudioSource, CaptureError, CapturePipeline, CaptureSettings};
pub use fallback::{FallbackError, TranscriptionClient, TtsClient};
pub use playback::{AudioSink, PlaybackError, PlaybackQueue};
pub use realtime::{
    ConnectionManager, ConnectionState, RealtimeConfig, RealtimeError, RealtimeResult,
    WebSocketConnector,
};
pub use session::{
    ConversationHistory, ConversationPhase, Message, Role, SessionController, SessionSettings,
    SessionUpdate,
};
