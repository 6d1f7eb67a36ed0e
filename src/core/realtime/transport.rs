//! Socket transport for the realtime connection.
//!
//! The connection manager talks to a [`Connector`], which opens one duplex
//! [`Duplex`] of [`Frame`]s per attempt. [`WebSocketConnector`] is the
//! production implementation over `tokio-tungstenite`; tests substitute
//! their own connectors.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use zeroize::Zeroizing;

use super::base::{RealtimeError, RealtimeResult};

/// One WebSocket frame, reduced to what the realtime protocol uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON text frame
    Text(String),
    /// Keepalive ping
    Ping(Bytes),
    /// Keepalive reply
    Pong(Bytes),
    /// Close with an optional code
    Close(Option<u16>),
}

/// Outbound half of an open socket.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RealtimeError> + Send>>;

/// Inbound half of an open socket. Ends when the socket closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = RealtimeResult<Frame>> + Send>>;

/// An open duplex socket.
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens sockets for the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one socket. Called for the first attempt and every reconnect.
    async fn open(&self) -> RealtimeResult<Duplex>;
}

// =============================================================================
// Token providers
// =============================================================================

/// Supplies the bearer credential used to open the socket.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a credential. Called before every socket open.
    async fn token(&self) -> RealtimeResult<Zeroizing<String>>;
}

/// Uses a long-lived key directly.
pub struct StaticKeyProvider {
    key: Zeroizing<String>,
}

impl StaticKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Zeroizing::new(key.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticKeyProvider {
    async fn token(&self) -> RealtimeResult<Zeroizing<String>> {
        Ok(self.key.clone())
    }
}

/// Exchanges with an intermediary server for a short-lived client secret.
///
/// The intermediary answers `GET <url>` with a realtime session object whose
/// `client_secret.value` is the ephemeral token.
pub struct EphemeralTokenProvider {
    client: reqwest::Client,
    url: String,
    auth: Option<Zeroizing<String>>,
}

#[derive(Deserialize)]
struct SessionTokenResponse {
    client_secret: Option<ClientSecret>,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: Option<String>,
}

impl EphemeralTokenProvider {
    /// Create a provider for the given intermediary endpoint.
    ///
    /// `auth` is sent as a bearer header to the intermediary when present.
    pub fn new(url: impl Into<String>, auth: Option<String>) -> RealtimeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            auth: auth.map(Zeroizing::new),
        })
    }
}

#[async_trait]
impl TokenProvider for EphemeralTokenProvider {
    async fn token(&self) -> RealtimeResult<Zeroizing<String>> {
        tracing::debug!("Fetching realtime session token from {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RealtimeError::AuthenticationFailed(format!("token request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::AuthenticationFailed(format!(
                "Failed to get session token ({}): {}",
                status, body
            )));
        }

        let parsed: SessionTokenResponse = response
            .json()
            .await
            .map_err(|e| RealtimeError::AuthenticationFailed(format!("token response: {}", e)))?;

        parsed
            .client_secret
            .and_then(|secret| secret.value)
            .filter(|value| !value.is_empty())
            .map(Zeroizing::new)
            .ok_or_else(|| {
                RealtimeError::AuthenticationFailed(
                    "No client secret in session response".to_string(),
                )
            })
    }
}

// =============================================================================
// WebSocket connector
// =============================================================================

/// Opens realtime sockets with `tokio-tungstenite`.
pub struct WebSocketConnector {
    url: url::Url,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl WebSocketConnector {
    /// `tokens` may be `None` for endpoints that need no credential (local relays).
    pub fn new(url: url::Url, tokens: Option<Arc<dyn TokenProvider>>) -> Self {
        Self { url, tokens }
    }

    fn build_request(&self, token: Option<&str>) -> RealtimeResult<http::Request<()>> {
        let host = match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RealtimeError::InvalidConfiguration(format!(
                    "realtime url has no host: {}",
                    self.url
                )));
            }
        };

        let mut builder = http::Request::builder()
            .uri(self.url.as_str())
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }

        builder
            .body(())
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> RealtimeResult<Duplex> {
        let token = match &self.tokens {
            Some(provider) => Some(provider.token().await?),
            None => None,
        };
        let request = self.build_request(token.as_ref().map(|t| t.as_str()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Realtime socket open: {}", self.url.host_str().unwrap_or("?"));

        let (ws_sink, ws_stream) = ws_stream.split();

        let sink = ws_sink
            .sink_map_err(|e| RealtimeError::WebSocketError(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<Message, RealtimeError>(frame_to_message(frame))));

        let stream = ws_stream.filter_map(|msg| future::ready(message_to_frame(msg)));

        Ok(Duplex {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: String::new().into(),
        })),
    }
}

fn message_to_frame(msg: Result<Message, tungstenite::Error>) -> Option<RealtimeResult<Frame>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Ping(data)) => Some(Ok(Frame::Ping(data))),
        Ok(Message::Pong(data)) => Some(Ok(Frame::Pong(data))),
        Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| u16::from(f.code))))),
        Ok(Message::Binary(data)) => {
            tracing::warn!("Dropping unexpected binary frame ({} bytes)", data.len());
            None
        }
        Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(RealtimeError::WebSocketError(e.to_string()))),
    }
}
