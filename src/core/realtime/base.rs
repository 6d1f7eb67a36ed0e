//! Base types for the realtime voice connection.
//!
//! Errors, connection state, reconnection policy and the callback aliases
//! shared by the connection manager and its owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use super::messages::ServerEvent;

/// Close code used for an intentional, client-initiated disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code sent by a peer that is going away (page unload, server restart).
pub const GOING_AWAY: u16 = 1001;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RealtimeError {
    /// The socket could not be opened (after all retries)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection dropped and reconnection gave up
    #[error("Connection lost after {attempts} reconnection attempts")]
    ConnectionLost {
        /// Reconnection attempts made before giving up
        attempts: u32,
    },

    /// Token exchange or credentials rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Malformed or unexpected inbound payload
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No session handshake within the deadline
    #[error("Session handshake timed out after {0}ms")]
    SessionTimeout(u64),

    /// Error reported by the remote service
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// The connection was closed by the owner while an operation was in flight
    #[error("Connection cancelled")]
    Cancelled,
}

impl RealtimeError {
    /// Whether a fresh connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::ConnectionFailed(_)
                | RealtimeError::ConnectionLost { .. }
                | RealtimeError::WebSocketError(_)
                | RealtimeError::SessionTimeout(_)
        )
    }
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Reconnection Policy
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 3
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 2000ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms (30 seconds)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff. 1.0 gives a constant delay.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add jitter to the delay to prevent thundering herd.
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before the given attempt (1-based) using exponential backoff.
    /// Returns the delay in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            // Up to 25% either way
            let jitter = rand_jitter(delay * 0.25);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        }
    }

    /// Check if more reconnection attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Pseudo-random jitter in `-range..=range` from a clock-seeded LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of the duplex connection, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket
    #[default]
    Disconnected,
    /// Opening a socket (first attempt or reconnecting)
    Connecting,
    /// Socket open
    Open,
    /// Intentional close in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// No traffic for the inactivity window
    Inactivity,
    /// The server closed with 1000 or 1001
    Remote(u16),
}

// =============================================================================
// Callback Types
// =============================================================================

/// Reconnection event details.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionEvent {
    /// Reconnection attempt number (1-based)
    pub attempt: u32,
    /// Whether the attempt produced an open socket
    pub success: bool,
    /// Error message if the attempt failed
    pub error: Option<String>,
}

/// Callback type for parsed inbound events.
pub type ServerEventCallback =
    Arc<dyn Fn(ServerEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for connection state changes.
pub type StateChangeCallback =
    Arc<dyn Fn(ConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for terminal connection errors.
pub type RealtimeErrorCallback =
    Arc<dyn Fn(RealtimeError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for reconnection events.
pub type ReconnectionCallback =
    Arc<dyn Fn(ReconnectionEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for self-initiated disconnects.
pub type DisconnectCallback =
    Arc<dyn Fn(DisconnectReason) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
