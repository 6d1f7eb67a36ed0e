//! In-memory sockets for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::base::{RealtimeError, RealtimeResult};
use super::messages::ClientEvent;
use super::transport::{Connector, Duplex, Frame};

/// Server side of an in-memory socket.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<RealtimeResult<Frame>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerEnd {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(value.to_string())));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(text.to_string())));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Close(Some(code))));
    }

    pub fn fail(&self) {
        let _ = self
            .to_client
            .unbounded_send(Err(RealtimeError::WebSocketError("reset".to_string())));
    }

    /// Next frame written by the client, or `None` once the client hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }

    /// Next client event, skipping keepalive frames.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            match self.from_client.next().await? {
                Frame::Text(text) => {
                    return Some(serde_json::from_str(&text).expect("client sent invalid JSON"));
                }
                Frame::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Play the server half of the session handshake.
    pub async fn handshake(&mut self) -> ClientEvent {
        self.send_json(json!({"type": "session.created", "session": {"id": "sess_test"}}));
        let update = self.next_event().await.expect("no session.update");
        assert!(matches!(update, ClientEvent::SessionUpdate { .. }));
        self.send_json(json!({"type": "session.updated", "session": {"id": "sess_test"}}));
        update
    }
}

/// A connected pair of in-memory socket ends.
pub fn channel_duplex() -> (Duplex, ServerEnd) {
    let (to_client, client_rx) = mpsc::unbounded();
    let (client_tx, from_client) = mpsc::unbounded();
    let duplex = Duplex {
        sink: Box::pin(
            client_tx.sink_map_err(|e| RealtimeError::WebSocketError(e.to_string())),
        ),
        stream: Box::pin(client_rx),
    };
    (
        duplex,
        ServerEnd {
            to_client,
            from_client,
        },
    )
}

/// Hands out prepared sockets in order, failing once they run out.
#[derive(Default)]
pub struct ScriptedConnector {
    sockets: Mutex<VecDeque<Duplex>>,
    opens: AtomicU32,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a socket and return its server end.
    pub fn push_socket(&self) -> ServerEnd {
        let (duplex, server) = channel_duplex();
        self.sockets.lock().push_back(duplex);
        server
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self) -> RealtimeResult<Duplex> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.sockets
            .lock()
            .pop_front()
            .ok_or_else(|| RealtimeError::ConnectionFailed("connection refused".to_string()))
    }
}
