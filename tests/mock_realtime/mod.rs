//! Mock realtime WebSocket server
//!
//! Speaks the server half of the realtime protocol over a real socket:
//! sends `session.created` on accept and, unless silenced, answers each
//! `session.update` with `session.updated`. Everything else the client
//! sends is forwarded to the test.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

enum Outgoing {
    Text(String),
    Close(u16),
    Drop,
}

/// One accepted client socket.
pub struct MockConnection {
    /// `Authorization` header of the upgrade request
    pub authorization: Option<String>,
    /// `OpenAI-Beta` header of the upgrade request
    pub beta: Option<String>,
    to_client: mpsc::UnboundedSender<Outgoing>,
    from_client: mpsc::UnboundedReceiver<Value>,
}

impl MockConnection {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Outgoing::Text(value.to_string()));
    }

    /// Close with a close frame carrying `code`.
    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Outgoing::Close(code));
    }

    /// Drop the TCP connection without a close frame.
    pub fn drop_socket(&self) {
        let _ = self.to_client.send(Outgoing::Drop);
    }

    /// Next JSON event from the client.
    pub async fn next_event(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip events until one of type `kind` arrives.
    pub async fn expect_event(&mut self, kind: &str) -> Value {
        loop {
            let event = self
                .next_event()
                .await
                .unwrap_or_else(|| panic!("client never sent {}", kind));
            if event["type"] == kind {
                return event;
            }
        }
    }

    /// Events already received, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(event) = self.from_client.try_recv() {
            events.push(event);
        }
        events
    }
}

pub struct MockRealtimeServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockRealtimeServer {
    /// Server that completes the handshake.
    pub async fn start() -> Self {
        Self::spawn(true).await
    }

    /// Server that never confirms `session.update`.
    pub async fn start_silent() -> Self {
        Self::spawn(false).await
    }

    async fn spawn(confirm_update: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut count = 0u32;
            while let Ok((stream, _)) = listener.accept().await {
                count += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, count, confirm_update, tx).await {
                        eprintln!("Mock connection error: {}", e);
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}/v1/realtime", addr),
            connections,
        }
    }

    /// Wait for the next client to connect.
    pub async fn accept(&mut self) -> MockConnection {
        self.try_accept(WAIT).await.expect("no client connected")
    }

    pub async fn try_accept(&mut self, wait: Duration) -> Option<MockConnection> {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn handle_connection(
    stream: TcpStream,
    id: u32,
    confirm_update: bool,
    connections: mpsc::UnboundedSender<MockConnection>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut authorization = None;
    let mut beta = None;
    let mut ws = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            authorization = header("authorization");
            beta = header("openai-beta");
            Ok(resp)
        },
    )
    .await?;

    let (to_client, mut outgoing) = mpsc::unbounded_channel();
    let (to_test, from_client) = mpsc::unbounded_channel();
    let _ = connections.send(MockConnection {
        authorization,
        beta,
        to_client,
        from_client,
    });

    let session_id = format!("sess_mock_{}", id);
    let created = json!({"type": "session.created", "session": {"id": session_id}});
    ws.send(Message::Text(created.to_string().into())).await?;

    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(Outgoing::Text(text)) => ws.send(Message::Text(text.into())).await?,
                Some(Outgoing::Close(code)) => {
                    ws.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    })))
                    .await?;
                    return Ok(());
                }
                Some(Outgoing::Drop) | None => return Ok(()),
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event: Value = serde_json::from_str(text.as_str())?;
                    if confirm_update && event["type"] == "session.update" {
                        let updated = json!({
                            "type": "session.updated",
                            "session": {"id": session_id, "voice": event["session"]["voice"]}
                        });
                        ws.send(Message::Text(updated.to_string().into())).await?;
                    }
                    let _ = to_test.send(event);
                }
                Some(Ok(Message::Ping(data))) => ws.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
