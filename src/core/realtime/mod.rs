//! Realtime voice connection.
//!
//! A single full-duplex WebSocket to the realtime API (or a relay that
//! speaks the same protocol) carrying JSON events in both directions.
//!
//! # Architecture
//!
//! - [`messages`]: tagged client and server events
//! - [`transport`]: socket opening and frame conversion behind [`Connector`]
//! - [`ConnectionManager`]: handshake gating, keepalive, inactivity timeout,
//!   reconnection and dispatch of parsed events
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian, base64 encoded inside JSON. Input at the
//! capture rate, output at 24kHz.

mod base;
mod config;
mod connection;
pub mod messages;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use base::{
    ConnectionState, DisconnectCallback, DisconnectReason, GOING_AWAY, NORMAL_CLOSURE,
    RealtimeError, RealtimeErrorCallback, RealtimeResult, ReconnectionCallback,
    ReconnectionConfig, ReconnectionEvent, ServerEventCallback, StateChangeCallback,
};
pub use config::{
    DEFAULT_INSTRUCTIONS, OPENAI_REALTIME_URL, REALTIME_OUTPUT_SAMPLE_RATE, RealtimeConfig,
    RealtimeModel, RealtimeVoice,
};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use messages::{ClientEvent, ServerEvent, SessionConfig, TurnDetection};
pub use transport::{
    Connector, Duplex, EphemeralTokenProvider, Frame, StaticKeyProvider, TokenProvider,
    WebSocketConnector,
};
