//! Realtime connection manager.
//!
//! Owns one duplex connection per logical session:
//!
//! - opens the socket through a [`Connector`], retrying with backoff,
//! - performs the session handshake (`session.created` → one
//!   `session.update` → `session.updated`) before any client event is
//!   written, buffering early events in a bounded queue,
//! - keeps the socket alive with periodic pings and closes it after a
//!   window without traffic,
//! - reconnects after unexpected closes and reports a terminal
//!   [`RealtimeError::ConnectionLost`] once attempts are exhausted,
//! - parses every inbound frame once and hands it to a single dispatch
//!   callback.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use learnie_voice::core::realtime::{ConnectionManager, ConnectionSettings, RealtimeConfig};
//!
//! let manager = ConnectionManager::new(connector, RealtimeConfig::default(), ConnectionSettings::default());
//! manager.on_event(Arc::new(|event: ServerEvent| {
//!     Box::pin(async move {
//!         tracing::info!("event: {:?}", event);
//!     }) as Pin<Box<dyn Future<Output = ()> + Send>>
//! }));
//! manager.connect().await?;
//! manager.send_audio(&chunk)?;
//! manager.disconnect().await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::base::{
    ConnectionState, DisconnectCallback, DisconnectReason, GOING_AWAY, NORMAL_CLOSURE,
    RealtimeError, RealtimeErrorCallback, RealtimeResult, ReconnectionCallback,
    ReconnectionConfig, ReconnectionEvent, ServerEventCallback, StateChangeCallback,
};
use super::config::RealtimeConfig;
use super::messages::{ClientEvent, ServerEvent};
use super::transport::{Connector, Duplex, Frame, FrameSink};
use crate::core::codec::EncodedChunk;

/// Channel capacity for outbound client events.
const WS_CHANNEL_CAPACITY: usize = 256;

/// How long `disconnect()` waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Timing and buffering knobs for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Close the connection after this long without traffic
    pub inactivity_timeout: Duration,
    /// Deadline for `session.updated` after the socket opens
    pub handshake_timeout: Duration,
    /// Client events held while the handshake is in progress
    pub pending_capacity: usize,
    /// Backoff for socket opens and reconnects
    pub reconnection: ReconnectionConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            pending_capacity: 64,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Progress of the session handshake on the current socket.
#[derive(Debug, Clone, PartialEq)]
enum Handshake {
    Pending,
    Ready,
    Failed(RealtimeError),
}

/// Client events gated on the handshake.
struct Gate {
    ready: bool,
    /// An established session dropped and is being reopened
    reconnecting: bool,
    pending: VecDeque<ClientEvent>,
}

impl Gate {
    /// Hold an event for the next handshake. When full, the oldest audio
    /// append makes room.
    fn hold(&mut self, event: ClientEvent, capacity: usize) {
        if self.pending.len() >= capacity {
            match self.pending.iter().position(ClientEvent::is_audio) {
                Some(index) => {
                    self.pending.remove(index);
                    tracing::warn!(
                        "Pre-handshake buffer full ({}); dropped oldest audio chunk",
                        capacity
                    );
                }
                None => {
                    tracing::warn!("Pre-handshake buffer full of control events");
                }
            }
        }
        self.pending.push_back(event);
    }
}

#[derive(Default)]
struct Callbacks {
    event: RwLock<Option<ServerEventCallback>>,
    state: RwLock<Option<StateChangeCallback>>,
    error: RwLock<Option<RealtimeErrorCallback>>,
    reconnection: RwLock<Option<ReconnectionCallback>>,
    disconnect: RwLock<Option<DisconnectCallback>>,
}

/// State shared between the manager and its connection task.
struct Shared {
    state: RwLock<ConnectionState>,
    gate: Mutex<Gate>,
    session_id: RwLock<Option<String>>,
    callbacks: Callbacks,
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::debug!("Realtime connection state: {}", next);
            let cb = self.callbacks.state.read().clone();
            if let Some(cb) = cb {
                cb(next).await;
            }
        }
    }

    async fn report_error(&self, err: RealtimeError) {
        let cb = self.callbacks.error.read().clone();
        if let Some(cb) = cb {
            cb(err).await;
        }
    }

    async fn report_reconnection(&self, event: ReconnectionEvent) {
        let cb = self.callbacks.reconnection.read().clone();
        if let Some(cb) = cb {
            cb(event).await;
        }
    }

    async fn report_disconnect(&self, reason: DisconnectReason) {
        let cb = self.callbacks.disconnect.read().clone();
        if let Some(cb) = cb {
            cb(reason).await;
        }
    }

    async fn dispatch(&self, event: ServerEvent) {
        let cb = self.callbacks.event.read().clone();
        if let Some(cb) = cb {
            cb(event).await;
        }
    }

    fn close_gate(&self) {
        let mut gate = self.gate.lock();
        gate.ready = false;
        gate.reconnecting = false;
        gate.pending.clear();
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Manages the single realtime connection of a session.
///
/// Construct one per session controller; it is not a process global.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    realtime: RealtimeConfig,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<ClientEvent>>>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        realtime: RealtimeConfig,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            realtime,
            settings,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                gate: Mutex::new(Gate {
                    ready: false,
                    reconnecting: false,
                    pending: VecDeque::new(),
                }),
                session_id: RwLock::new(None),
                callbacks: Callbacks::default(),
            }),
            outbound: Mutex::new(None),
            connection_handle: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current socket state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Socket open and handshake complete.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open && self.shared.gate.lock().ready
    }

    /// Session ID from the last `session.created`.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().clone()
    }

    /// Number of client events waiting for the handshake.
    pub fn pending_len(&self) -> usize {
        self.shared.gate.lock().pending.len()
    }

    pub fn realtime_config(&self) -> &RealtimeConfig {
        &self.realtime
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    /// Register the dispatch callback for parsed inbound events.
    pub fn on_event(&self, callback: ServerEventCallback) {
        *self.shared.callbacks.event.write() = Some(callback);
    }

    /// Register a callback for connection state changes.
    pub fn on_state_change(&self, callback: StateChangeCallback) {
        *self.shared.callbacks.state.write() = Some(callback);
    }

    /// Register a callback for terminal errors on an established connection.
    pub fn on_error(&self, callback: RealtimeErrorCallback) {
        *self.shared.callbacks.error.write() = Some(callback);
    }

    /// Register a callback for reconnection attempts.
    pub fn on_reconnection(&self, callback: ReconnectionCallback) {
        *self.shared.callbacks.reconnection.write() = Some(callback);
    }

    /// Register a callback for closes the manager or the server initiated.
    pub fn on_disconnect(&self, callback: DisconnectCallback) {
        *self.shared.callbacks.disconnect.write() = Some(callback);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the connection and complete the session handshake.
    ///
    /// Returns immediately when already connected; concurrent callers wait
    /// for the attempt in flight. Socket opens are retried per the
    /// reconnection policy; a handshake that does not finish within the
    /// deadline fails with [`RealtimeError::SessionTimeout`] and tears the
    /// socket down.
    pub async fn connect(&self) -> RealtimeResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        // Stale task from a connection that already ended
        if let Some(handle) = self.connection_handle.lock().take() {
            handle.abort();
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.shared.close_gate();
        *self.shared.session_id.write() = None;

        self.shared.set_state(ConnectionState::Connecting).await;

        let duplex = match self.open_with_retry(&cancel).await {
            Ok(duplex) => duplex,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        *self.outbound.lock() = Some(tx);

        let (handshake_tx, mut handshake_rx) = watch::channel(Handshake::Pending);

        self.shared.set_state(ConnectionState::Open).await;

        let task = ConnectionTask {
            connector: self.connector.clone(),
            realtime: self.realtime.clone(),
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            outbound: rx,
            cancel: cancel.clone(),
            handshake: handshake_tx,
        };
        *self.connection_handle.lock() = Some(tokio::spawn(task.run(duplex)));

        let outcome = tokio::select! {
            changed = handshake_rx.wait_for(|h| *h != Handshake::Pending) => match changed {
                Ok(status) => match &*status {
                    Handshake::Ready => Ok(()),
                    Handshake::Failed(e) => Err(e.clone()),
                    Handshake::Pending => Err(RealtimeError::Cancelled),
                },
                Err(_) => Err(RealtimeError::Cancelled),
            },
            _ = cancel.cancelled() => Err(RealtimeError::Cancelled),
        };

        if let Err(e) = &outcome {
            tracing::warn!("Realtime connect failed: {}", e);
            cancel.cancel();
            *self.outbound.lock() = None;
            self.shared.close_gate();
            self.shared.set_state(ConnectionState::Disconnected).await;
        } else {
            tracing::info!(
                "Realtime session ready ({})",
                self.session_id().unwrap_or_default()
            );
        }
        outcome
    }

    async fn open_with_retry(&self, cancel: &CancellationToken) -> RealtimeResult<Duplex> {
        let policy = &self.settings.reconnection;
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                result = self.connector.open() => result,
                _ = cancel.cancelled() => return Err(RealtimeError::Cancelled),
            };

            match result {
                Ok(duplex) => {
                    if cancel.is_cancelled() {
                        // Owner went away while the socket was opening
                        return Err(RealtimeError::Cancelled);
                    }
                    return Ok(duplex);
                }
                Err(e) => {
                    if matches!(e, RealtimeError::AuthenticationFailed(_)) {
                        return Err(e);
                    }
                    if !policy.should_retry(attempt) {
                        tracing::error!(
                            "Realtime socket failed to open after {} attempts: {}",
                            attempt + 1,
                            e
                        );
                        return Err(RealtimeError::ConnectionFailed(format!(
                            "gave up after {} attempts: {}",
                            attempt + 1,
                            e
                        )));
                    }
                    attempt += 1;
                    let delay_ms = policy.calculate_delay(attempt);
                    tracing::warn!(
                        "Realtime socket open failed ({}); retry {}/{} in {}ms",
                        e,
                        attempt,
                        policy.max_attempts,
                        delay_ms
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        _ = cancel.cancelled() => return Err(RealtimeError::Cancelled),
                    }
                }
            }
        }
    }

    /// Close the connection intentionally.
    ///
    /// Sends close code 1000 so no reconnection is attempted, stops all
    /// timers and drops buffered events. Safe to call at any time, including
    /// while `connect()` is in flight; idempotent.
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        self.cancel.lock().cancel();
        *self.outbound.lock() = None;

        let handle = self.connection_handle.lock().take();
        if handle.is_none() && self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        if self.state() == ConnectionState::Open {
            self.shared.set_state(ConnectionState::Closing).await;
        }

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }

        self.shared.close_gate();
        *self.shared.session_id.write() = None;
        self.shared.set_state(ConnectionState::Disconnected).await;
        tracing::info!("Disconnected from realtime API");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Queue a client event for transmission.
    ///
    /// Fails with [`RealtimeError::NotConnected`] unless the socket is open
    /// or an established session is reconnecting. Until the handshake on
    /// the current socket completes, events are held in a bounded buffer
    /// and flushed in order once the session is confirmed; when the buffer
    /// is full the oldest audio append is dropped.
    pub fn send(&self, event: ClientEvent) -> RealtimeResult<()> {
        let mut gate = self.shared.gate.lock();
        let accepting = match self.state() {
            ConnectionState::Open => true,
            ConnectionState::Connecting => gate.reconnecting,
            _ => false,
        };
        if !accepting {
            return Err(RealtimeError::NotConnected);
        }

        if !gate.ready {
            gate.hold(event, self.settings.pending_capacity);
            return Ok(());
        }

        // Sent under the gate lock so a dropped socket requeues in order
        let sender = self.outbound.lock().clone();
        match sender {
            Some(sender) => sender.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RealtimeError::WebSocketError("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => RealtimeError::NotConnected,
            }),
            None => Err(RealtimeError::NotConnected),
        }
    }

    /// Append one encoded capture block to the server input buffer.
    pub fn send_audio(&self, chunk: &EncodedChunk) -> RealtimeResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.send(ClientEvent::from_chunk(chunk))
    }

    /// Finalize the user turn.
    pub fn commit_audio(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::InputAudioBufferCommit)
    }

    /// Drop uncommitted audio on the server.
    pub fn clear_audio_buffer(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::InputAudioBufferClear)
    }

    /// Request a response.
    pub fn create_response(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::response_create())
    }

    /// Interrupt the response being generated.
    pub fn cancel_response(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::ResponseCancel)
    }

    /// Add a typed user message and request a response to it.
    pub fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.send(ClientEvent::user_text(text))?;
        self.create_response()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
        if let Some(handle) = self.connection_handle.lock().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Connection Task
// =============================================================================

/// Why the frame pump returned.
enum PumpExit {
    Cancelled,
    Idle,
    RemoteClosed(u16),
    Failed(RealtimeError),
}

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    realtime: RealtimeConfig,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<ClientEvent>,
    cancel: CancellationToken,
    handshake: watch::Sender<Handshake>,
}

impl ConnectionTask {
    async fn run(mut self, first: Duplex) {
        let mut duplex = first;
        let mut reconnect_attempt: u32 = 0;
        let mut handshaken_once = false;

        'outer: loop {
            let exit = self.pump(&mut duplex, &mut handshaken_once, &mut reconnect_attempt).await;
            self.shared.gate.lock().ready = false;

            let failure = match exit {
                PumpExit::Cancelled => {
                    let _ = duplex.sink.send(Frame::Close(Some(NORMAL_CLOSURE))).await;
                    let _ = duplex.sink.close().await;
                    self.fail_handshake(RealtimeError::Cancelled);
                    break 'outer;
                }
                PumpExit::Idle => {
                    tracing::info!(
                        "No realtime traffic for {}s, disconnecting",
                        self.settings.inactivity_timeout.as_secs()
                    );
                    let _ = duplex.sink.send(Frame::Close(Some(NORMAL_CLOSURE))).await;
                    let _ = duplex.sink.close().await;
                    self.shared.set_state(ConnectionState::Disconnected).await;
                    self.shared.report_disconnect(DisconnectReason::Inactivity).await;
                    break 'outer;
                }
                PumpExit::RemoteClosed(code) if code == NORMAL_CLOSURE || code == GOING_AWAY => {
                    tracing::info!("Realtime socket closed by server (code {})", code);
                    if !handshaken_once {
                        self.fail_handshake(RealtimeError::ConnectionFailed(format!(
                            "closed during handshake (code {})",
                            code
                        )));
                        break 'outer;
                    }
                    self.shared.set_state(ConnectionState::Disconnected).await;
                    self.shared.report_disconnect(DisconnectReason::Remote(code)).await;
                    break 'outer;
                }
                PumpExit::RemoteClosed(code) => {
                    RealtimeError::WebSocketError(format!("closed unexpectedly (code {})", code))
                }
                PumpExit::Failed(e) => e,
            };

            if !handshaken_once {
                // Initial connect() owns retries of its own handshake
                let _ = duplex.sink.send(Frame::Close(Some(NORMAL_CLOSURE))).await;
                let _ = duplex.sink.close().await;
                self.fail_handshake(failure);
                break 'outer;
            }

            tracing::warn!("Realtime connection lost: {}", failure);
            self.hold_unsent();

            // Reconnect until a socket opens or attempts run out
            loop {
                let policy = &self.settings.reconnection;
                if !policy.should_retry(reconnect_attempt) {
                    tracing::error!(
                        "Reconnection disabled or max attempts ({}) reached",
                        policy.max_attempts
                    );
                    self.shared.close_gate();
                    self.shared.set_state(ConnectionState::Disconnected).await;
                    self.shared
                        .report_error(RealtimeError::ConnectionLost {
                            attempts: reconnect_attempt,
                        })
                        .await;
                    break 'outer;
                }

                reconnect_attempt += 1;
                self.shared.set_state(ConnectionState::Connecting).await;

                let delay_ms = policy.calculate_delay(reconnect_attempt);
                tracing::info!(
                    "Attempting reconnection {}/{} in {}ms",
                    reconnect_attempt,
                    if policy.max_attempts == 0 {
                        "∞".to_string()
                    } else {
                        policy.max_attempts.to_string()
                    },
                    delay_ms
                );

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = self.cancel.cancelled() => {
                        tracing::info!("Disconnect requested during reconnection delay");
                        break 'outer;
                    }
                }

                let opened = tokio::select! {
                    opened = self.connector.open() => opened,
                    _ = self.cancel.cancelled() => break 'outer,
                };

                match opened {
                    Ok(next) => {
                        tracing::info!("Reconnected to realtime API (attempt {})", reconnect_attempt);
                        duplex = next;
                        *self.shared.session_id.write() = None;
                        self.shared.set_state(ConnectionState::Open).await;
                        self.shared
                            .report_reconnection(ReconnectionEvent {
                                attempt: reconnect_attempt,
                                success: true,
                                error: None,
                            })
                            .await;
                        continue 'outer;
                    }
                    Err(e) => {
                        tracing::error!("Reconnection attempt {} failed: {}", reconnect_attempt, e);
                        self.shared
                            .report_reconnection(ReconnectionEvent {
                                attempt: reconnect_attempt,
                                success: false,
                                error: Some(e.to_string()),
                            })
                            .await;
                    }
                }
            }
        }

        self.shared.close_gate();
        tracing::debug!("Realtime connection task ended");
    }

    /// Move events queued for the dropped socket behind the gate, ahead of
    /// anything buffered since, so they go out after the next handshake.
    fn hold_unsent(&mut self) {
        let capacity = self.settings.pending_capacity;
        let mut gate = self.shared.gate.lock();
        gate.reconnecting = true;
        let newer: Vec<ClientEvent> = gate.pending.drain(..).collect();
        while let Ok(event) = self.outbound.try_recv() {
            gate.hold(event, capacity);
        }
        for event in newer {
            gate.hold(event, capacity);
        }
        if !gate.pending.is_empty() {
            tracing::debug!("Holding {} client events for reconnection", gate.pending.len());
        }
    }

    fn fail_handshake(&self, err: RealtimeError) {
        self.handshake.send_if_modified(|status| {
            if *status == Handshake::Pending {
                *status = Handshake::Failed(err);
                true
            } else {
                false
            }
        });
    }

    /// Move frames until the socket ends, the owner cancels, or a timer fires.
    async fn pump(
        &mut self,
        duplex: &mut Duplex,
        handshaken_once: &mut bool,
        reconnect_attempt: &mut u32,
    ) -> PumpExit {
        let start = Instant::now();
        let handshake_deadline = start + self.settings.handshake_timeout;
        let mut awaiting_update = false;
        let mut ready = false;
        let mut last_activity = start;
        let mut keepalive = tokio::time::interval_at(
            start + self.settings.keepalive_interval,
            self.settings.keepalive_interval,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,

                event = self.outbound.recv(), if ready => {
                    let Some(event) = event else {
                        return PumpExit::Cancelled;
                    };
                    if let Err(e) = write_event(&mut duplex.sink, &event).await {
                        return PumpExit::Failed(e);
                    }
                    last_activity = Instant::now();
                }

                frame = duplex.stream.next() => {
                    let frame = match frame {
                        None => {
                            return PumpExit::Failed(RealtimeError::WebSocketError(
                                "stream ended".to_string(),
                            ));
                        }
                        Some(Err(e)) => return PumpExit::Failed(e),
                        Some(Ok(frame)) => frame,
                    };

                    match frame {
                        Frame::Text(text) => {
                            last_activity = Instant::now();
                            let event = match ServerEvent::parse(&text) {
                                Ok(event) => event,
                                Err(e) => {
                                    tracing::warn!("Dropping inbound frame: {}", e);
                                    continue;
                                }
                            };

                            match &event {
                                ServerEvent::SessionCreated { session } if !ready => {
                                    *self.shared.session_id.write() = Some(session.id.clone());
                                    if !awaiting_update {
                                        awaiting_update = true;
                                        let update = ClientEvent::SessionUpdate {
                                            session: self.realtime.session_config(),
                                        };
                                        if let Err(e) = write_event(&mut duplex.sink, &update).await {
                                            return PumpExit::Failed(e);
                                        }
                                        tracing::debug!("Sent session.update for {}", session.id);
                                    }
                                }
                                ServerEvent::SessionUpdated { .. } if awaiting_update && !ready => {
                                    ready = true;
                                    *handshaken_once = true;
                                    *reconnect_attempt = 0;
                                    let flushed: Vec<ClientEvent> = {
                                        let mut gate = self.shared.gate.lock();
                                        gate.ready = true;
                                        gate.reconnecting = false;
                                        gate.pending.drain(..).collect()
                                    };
                                    if !flushed.is_empty() {
                                        tracing::debug!("Flushing {} buffered client events", flushed.len());
                                    }
                                    for event in &flushed {
                                        if let Err(e) = write_event(&mut duplex.sink, event).await {
                                            return PumpExit::Failed(e);
                                        }
                                    }
                                    self.handshake.send_replace(Handshake::Ready);
                                }
                                ServerEvent::Unhandled => {
                                    tracing::trace!("Unhandled server event");
                                    continue;
                                }
                                _ => {}
                            }

                            self.shared.dispatch(event).await;
                        }
                        Frame::Ping(data) => {
                            if let Err(e) = duplex.sink.send(Frame::Pong(data)).await {
                                return PumpExit::Failed(e);
                            }
                        }
                        Frame::Pong(_) => {
                            tracing::trace!("Keepalive pong");
                        }
                        Frame::Close(code) => {
                            return PumpExit::RemoteClosed(code.unwrap_or(NORMAL_CLOSURE));
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if let Err(e) = duplex.sink.send(Frame::Ping(Bytes::new())).await {
                        return PumpExit::Failed(e);
                    }
                }

                _ = tokio::time::sleep_until(handshake_deadline), if !ready => {
                    let ms = self.settings.handshake_timeout.as_millis() as u64;
                    tracing::warn!("No session handshake within {}ms", ms);
                    return PumpExit::Failed(RealtimeError::SessionTimeout(ms));
                }

                _ = tokio::time::sleep_until(last_activity + self.settings.inactivity_timeout) => {
                    return PumpExit::Idle;
                }
            }
        }
    }
}

async fn write_event(sink: &mut FrameSink, event: &ClientEvent) -> RealtimeResult<()> {
    let json = event.to_json()?;
    sink.send(Frame::Text(json)).await
}
