//! Session controller.
//!
//! Owns the connection manager, capture pipeline and playback queue of one
//! conversation. Every input (user commands, server events, connection and
//! device notifications, timers) is delivered to one channel and handled to
//! completion in arrival order by a single task, which feeds the
//! [`PhaseMachine`] and carries out the effects it returns.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{
    ConversationHistory, DEFAULT_HISTORY_CAP, DEFAULT_MERGE_WINDOW, Message, Role,
};
use super::phase::{ConversationPhase, Effect, PhaseMachine, SessionEvent};
use crate::core::capture::{CaptureError, CapturePipeline};
use crate::core::codec;
use crate::core::playback::{PlaybackItem, PlaybackQueue};
use crate::core::realtime::{
    ConnectionManager, DisconnectCallback, DisconnectReason, RealtimeError,
    RealtimeErrorCallback, RealtimeResult, ReconnectionCallback, ReconnectionEvent,
    ServerEvent, ServerEventCallback,
};
use crate::errors::{VoiceError, VoiceResult, capture_message, realtime_message};

/// Substituted for content the relay's safety system refused.
pub const MODERATION_REFUSAL: &str = "I'm sorry, I can't respond to that request.";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Controller tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Automatic retries after a failed handshake
    pub handshake_retries: u32,
    /// Wait before each handshake retry
    pub retry_delay: Duration,
    /// End the conversation after this long listening with no user speech
    pub auto_stop_after: Duration,
    /// Pause between an interrupt and resuming capture
    pub interrupt_settle: Duration,
    pub history_cap: usize,
    pub merge_window: Duration,
    /// Where history is persisted, if anywhere
    pub history_file: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_retries: 2,
            retry_delay: Duration::from_millis(2000),
            auto_stop_after: Duration::from_secs(30),
            interrupt_settle: Duration::from_millis(100),
            history_cap: DEFAULT_HISTORY_CAP,
            merge_window: DEFAULT_MERGE_WINDOW,
            history_file: None,
        }
    }
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Phase changed; `prompt` is the talk button label
    Phase {
        phase: ConversationPhase,
        prompt: &'static str,
    },
    /// A transcript fragment was added to history
    Transcript { role: Role, delta: String },
    /// Waiting on the assistant
    Processing(bool),
    /// Full history after a completed turn or a clear
    History(Vec<Message>),
    /// Message to display
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Status {
    phase: ConversationPhase,
    error: Option<String>,
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Interrupt,
    SendText(String),
    ClearHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Retry,
    AutoStop,
    ResumeCapture,
}

enum Input {
    Command(Command, oneshot::Sender<VoiceResult<()>>),
    Server(ServerEvent),
    Connected {
        attempt: u64,
        result: RealtimeResult<()>,
    },
    ConnectionError(RealtimeError),
    Disconnected(DisconnectReason),
    CaptureStarted {
        generation: u64,
        result: Result<(), CaptureError>,
    },
    CaptureFailed(CaptureError),
    UserSpeech,
    Silence,
    Speaking(bool),
    Timer(TimerKind, u64),
}

/// Handle to a running conversation.
///
/// Must be created inside a Tokio runtime. Dropping it stops the event loop;
/// call [`SessionController::stop`] first for an orderly teardown.
pub struct SessionController {
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<Status>,
    updates: broadcast::Sender<SessionUpdate>,
    history: Arc<Mutex<ConversationHistory>>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl SessionController {
    /// Wire the components together and start the event loop.
    ///
    /// Loads saved history when `settings.history_file` is set.
    pub fn new(
        manager: Arc<ConnectionManager>,
        capture: Arc<CapturePipeline>,
        playback: Arc<PlaybackQueue>,
        settings: SessionSettings,
    ) -> VoiceResult<Self> {
        let history = match &settings.history_file {
            Some(path) => {
                ConversationHistory::load(path, settings.history_cap, settings.merge_window)?
            }
            None => ConversationHistory::new(settings.history_cap, settings.merge_window),
        };
        if !history.is_empty() {
            info!("Loaded {} history messages", history.len());
        }
        let history = Arc::new(Mutex::new(history));

        let (inputs, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(Status::default());
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let uncommitted = Arc::new(AtomicBool::new(false));

        wire_connection(&manager, &inputs);
        wire_capture(&capture, &manager, &inputs, &uncommitted);
        wire_playback(&playback, &inputs);

        let shutdown = CancellationToken::new();
        let runner = Runner {
            machine: PhaseMachine::new(settings.handshake_retries),
            manager,
            capture,
            playback,
            settings,
            history: history.clone(),
            updates: updates.clone(),
            status: status_tx,
            inputs: inputs.clone(),
            uncommitted,
            turn_committed: false,
            discard_audio: false,
            connect_attempt: 0,
            connect_task: None,
            capture_generation: 0,
            retry_timer: TimerSlot::default(),
            auto_stop_timer: TimerSlot::default(),
            resume_timer: TimerSlot::default(),
        };
        let worker = tokio::spawn(runner.run(rx, shutdown.clone()));

        Ok(Self {
            inputs,
            status,
            updates,
            history,
            shutdown,
            worker,
        })
    }

    /// Begin a conversation. A no-op unless idle or in error.
    pub async fn start_conversation(&self) -> VoiceResult<()> {
        self.command(Command::Start).await
    }

    /// End the conversation and release the microphone, speaker and socket.
    pub async fn stop(&self) -> VoiceResult<()> {
        self.command(Command::Stop).await
    }

    /// Cut the assistant off and listen again.
    pub async fn interrupt(&self) -> VoiceResult<()> {
        self.command(Command::Interrupt).await
    }

    /// Send a typed user message and request a reply.
    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.command(Command::SendText(text.into())).await
    }

    /// Forget the conversation, including any saved file.
    pub async fn clear_history(&self) -> VoiceResult<()> {
        self.command(Command::ClearHistory).await
    }

    pub fn phase(&self) -> ConversationPhase {
        self.status.borrow().phase
    }

    /// Message retained while in the error phase.
    pub fn error_message(&self) -> Option<String> {
        self.status.borrow().error.clone()
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().messages()
    }

    /// Receive UI notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Wait until the conversation reaches `phase`.
    pub async fn wait_for_phase(&self, phase: ConversationPhase) -> VoiceResult<()> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.phase == phase)
            .await
            .map(|_| ())
            .map_err(|_| VoiceError::SessionClosed)
    }

    async fn command(&self, command: Command) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(command, tx))
            .map_err(|_| VoiceError::SessionClosed)?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.worker.abort();
    }
}

fn wire_connection(manager: &ConnectionManager, inputs: &mpsc::UnboundedSender<Input>) {
    let tx = inputs.clone();
    let event_callback: ServerEventCallback = Arc::new(move |event: ServerEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(Input::Server(event));
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    manager.on_event(event_callback);

    let tx = inputs.clone();
    let error_callback: RealtimeErrorCallback = Arc::new(move |err: RealtimeError| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(Input::ConnectionError(err));
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    manager.on_error(error_callback);

    let tx = inputs.clone();
    let disconnect_callback: DisconnectCallback = Arc::new(move |reason: DisconnectReason| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(Input::Disconnected(reason));
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    manager.on_disconnect(disconnect_callback);

    let reconnection_callback: ReconnectionCallback = Arc::new(|event: ReconnectionEvent| {
        Box::pin(async move {
            if event.success {
                info!("Realtime connection restored on attempt {}", event.attempt);
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    manager.on_reconnection(reconnection_callback);
}

fn wire_capture(
    capture: &CapturePipeline,
    manager: &Arc<ConnectionManager>,
    inputs: &mpsc::UnboundedSender<Input>,
    uncommitted: &Arc<AtomicBool>,
) {
    let threshold = capture.settings().silence_threshold;
    let manager = manager.clone();
    let uncommitted = uncommitted.clone();
    let tx = inputs.clone();
    capture.on_chunk(Arc::new(move |chunk| {
        if let Err(e) = manager.send_audio(&chunk) {
            warn!("Dropped capture block: {}", e);
            return;
        }
        let loud = codec::rms(&codec::decode(&chunk.data)) >= threshold;
        if loud && !uncommitted.swap(true, Ordering::SeqCst) {
            let _ = tx.send(Input::UserSpeech);
        }
    }));

    let tx = inputs.clone();
    capture.on_silence(Arc::new(move || {
        let _ = tx.send(Input::Silence);
    }));

    let tx = inputs.clone();
    capture.on_error(Arc::new(move |err| {
        let _ = tx.send(Input::CaptureFailed(err));
    }));
}

fn wire_playback(playback: &PlaybackQueue, inputs: &mpsc::UnboundedSender<Input>) {
    let tx = inputs.clone();
    playback.on_speaking_change(Arc::new(move |speaking| {
        let _ = tx.send(Input::Speaking(speaking));
    }));
}

/// One cancellable timer; a fire from an older arming is ignored.
#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<AbortHandle>,
}

impl TimerSlot {
    fn arm(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        inputs: &mpsc::UnboundedSender<Input>,
    ) {
        self.disarm();
        let generation = self.generation;
        let tx = inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer(kind, generation));
        });
        self.handle = Some(handle.abort_handle());
    }

    fn disarm(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }
}

struct Runner {
    machine: PhaseMachine,
    manager: Arc<ConnectionManager>,
    capture: Arc<CapturePipeline>,
    playback: Arc<PlaybackQueue>,
    settings: SessionSettings,
    history: Arc<Mutex<ConversationHistory>>,
    updates: broadcast::Sender<SessionUpdate>,
    status: watch::Sender<Status>,
    inputs: mpsc::UnboundedSender<Input>,
    /// Audio with speech has been appended since the last commit or clear
    uncommitted: Arc<AtomicBool>,
    /// This turn's commit went out, so a response may be requested
    turn_committed: bool,
    /// No response in flight: the last one was cancelled or finished, so
    /// deltas are dropped until the next `response.created`
    discard_audio: bool,
    connect_attempt: u64,
    connect_task: Option<AbortHandle>,
    capture_generation: u64,
    retry_timer: TimerSlot,
    auto_stop_timer: TimerSlot,
    resume_timer: TimerSlot,
}

impl Runner {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>, shutdown: CancellationToken) {
        loop {
            let input = tokio::select! {
                _ = shutdown.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle(input).await;
        }

        self.retry_timer.disarm();
        self.auto_stop_timer.disarm();
        self.resume_timer.disarm();
        debug!("Session controller stopped");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command, ack) => {
                let result = self.handle_command(command).await;
                let _ = ack.send(result);
            }
            Input::Server(event) => self.handle_server_event(event).await,
            Input::Connected { attempt, result } => {
                if attempt != self.connect_attempt {
                    debug!("Ignoring result of superseded connect attempt {}", attempt);
                    return;
                }
                match result {
                    Ok(()) => self.dispatch(SessionEvent::HandshakeSucceeded).await,
                    Err(RealtimeError::Cancelled) => {}
                    Err(e) => {
                        warn!("Conversation failed to start: {}", e);
                        self.dispatch(SessionEvent::HandshakeFailed(realtime_message(&e)))
                            .await;
                    }
                }
            }
            Input::ConnectionError(e) => {
                warn!("Realtime connection error: {}", e);
                self.dispatch(SessionEvent::ConnectionLost(realtime_message(&e)))
                    .await;
            }
            Input::Disconnected(reason) => match reason {
                DisconnectReason::Requested => {}
                DisconnectReason::Inactivity => self.dispatch(SessionEvent::Stop).await,
                DisconnectReason::Remote(code) => {
                    let message = format!("Connection lost (code: {}). Tap to reconnect.", code);
                    self.dispatch(SessionEvent::ConnectionLost(message)).await;
                }
            },
            Input::CaptureStarted { generation, result } => {
                if generation != self.capture_generation {
                    let wanted = matches!(
                        self.machine.phase,
                        ConversationPhase::Listening | ConversationPhase::Speaking
                    );
                    if result.is_ok() && !wanted {
                        self.capture.stop().await;
                    }
                    return;
                }
                match result {
                    Ok(()) => {
                        // Speech may have begun while the device was opening
                        if self.machine.phase == ConversationPhase::Speaking {
                            self.capture.set_paused(true);
                        }
                    }
                    Err(CaptureError::Closed) => {}
                    Err(e) => {
                        warn!("Microphone failed to start: {}", e);
                        self.dispatch(SessionEvent::CaptureFailed(capture_message(&e)))
                            .await;
                    }
                }
            }
            Input::CaptureFailed(e) => {
                warn!("Microphone failed: {}", e);
                self.dispatch(SessionEvent::CaptureFailed(capture_message(&e)))
                    .await;
            }
            Input::UserSpeech => {
                if self.machine.phase == ConversationPhase::Listening {
                    self.arm_auto_stop();
                }
            }
            Input::Silence => self.dispatch(SessionEvent::SilenceTimeout).await,
            Input::Speaking(true) => {}
            Input::Speaking(false) => {
                // A newer reply may already be queued
                if !self.playback.is_speaking() {
                    self.dispatch(SessionEvent::PlaybackDrained).await;
                }
            }
            Input::Timer(kind, generation) => self.handle_timer(kind, generation).await,
        }
    }

    async fn handle_command(&mut self, command: Command) -> VoiceResult<()> {
        match command {
            Command::Start => {
                if self.machine.phase.can_start() {
                    self.dispatch(SessionEvent::Start).await;
                } else {
                    debug!("Start ignored while {}", self.machine.phase);
                }
                Ok(())
            }
            Command::Stop => {
                self.dispatch(SessionEvent::Stop).await;
                Ok(())
            }
            Command::Interrupt => {
                self.dispatch(SessionEvent::Interrupt).await;
                Ok(())
            }
            Command::SendText(text) => {
                if !matches!(
                    self.machine.phase,
                    ConversationPhase::Listening | ConversationPhase::Speaking
                ) {
                    return Err(VoiceError::NotActive);
                }
                let text = text.trim();
                if text.is_empty() {
                    return Ok(());
                }
                self.manager.send_text(text)?;
                self.history.lock().append(Role::User, text);
                self.publish(SessionUpdate::Transcript {
                    role: Role::User,
                    delta: text.to_string(),
                });
                self.publish(SessionUpdate::Processing(true));
                Ok(())
            }
            Command::ClearHistory => {
                self.history.lock().clear();
                if let Some(path) = &self.settings.history_file {
                    ConversationHistory::delete_file(path)?;
                }
                self.publish(SessionUpdate::History(Vec::new()));
                Ok(())
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SpeechStarted { .. } => {
                if self.machine.phase == ConversationPhase::Listening {
                    self.arm_auto_stop();
                }
            }
            ServerEvent::SpeechStopped { .. } => {
                self.publish(SessionUpdate::Processing(true));
            }
            ServerEvent::InputAudioBufferCommitted { .. } => {
                self.uncommitted.store(false, Ordering::SeqCst);
            }
            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    self.append_history(Role::User, transcript);
                    self.publish_history();
                }
            }
            ServerEvent::ResponseCreated { .. } => {
                self.discard_audio = false;
                self.publish(SessionUpdate::Processing(true));
            }
            ServerEvent::AudioDelta { delta, .. } => {
                if self.discard_audio {
                    debug!("Dropping audio delta with no response in flight");
                    return;
                }
                self.dispatch(SessionEvent::RemoteAudioStarted).await;
                if self.machine.phase == ConversationPhase::Speaking {
                    self.playback.enqueue(PlaybackItem::Base64(delta));
                }
            }
            ServerEvent::AudioTranscriptDelta { delta, .. } | ServerEvent::TextDelta { delta } => {
                if !self.discard_audio && self.machine.phase.is_active() {
                    self.append_history(Role::Assistant, &delta);
                }
            }
            ServerEvent::ResponseDone { .. } => {
                self.discard_audio = true;
                self.publish(SessionUpdate::Processing(false));
                self.dispatch(SessionEvent::RemoteDone).await;
                self.publish_history();
                self.save_history();
            }
            ServerEvent::ModerationViolation { message } => {
                warn!(
                    "Response withheld by moderation: {}",
                    message.as_deref().unwrap_or("no reason given")
                );
                self.append_history(Role::Assistant, MODERATION_REFUSAL);
                self.publish(SessionUpdate::Processing(false));
                self.publish_history();
            }
            ServerEvent::Error { .. } => {
                let message = event
                    .error_message()
                    .unwrap_or_else(|| "Unknown error".to_string());
                warn!("Realtime API error: {}", message);
                self.publish(SessionUpdate::Error(message));
            }
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::AudioDone { .. }
            | ServerEvent::AudioTranscriptDone { .. }
            | ServerEvent::Pong
            | ServerEvent::Heartbeat
            | ServerEvent::Unhandled => {}
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind, generation: u64) {
        let slot = match kind {
            TimerKind::Retry => &mut self.retry_timer,
            TimerKind::AutoStop => &mut self.auto_stop_timer,
            TimerKind::ResumeCapture => &mut self.resume_timer,
        };
        if !slot.is_current(generation) {
            return;
        }
        slot.handle = None;

        match kind {
            TimerKind::Retry => {
                info!("Retrying conversation start");
                self.dispatch(SessionEvent::RetryElapsed).await;
            }
            TimerKind::AutoStop => {
                info!(
                    "No speech for {}s, ending conversation",
                    self.settings.auto_stop_after.as_secs()
                );
                self.dispatch(SessionEvent::AutoStop).await;
            }
            TimerKind::ResumeCapture => {
                if self.machine.phase == ConversationPhase::Listening {
                    self.capture.set_paused(false);
                }
            }
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let before = self.machine.phase;
        let effects = self.machine.apply(&event);
        let after = self.machine.phase;

        self.status.send_if_modified(|status| {
            let next = Status {
                phase: after,
                error: self.machine.error.clone(),
            };
            if *status != next {
                *status = next;
                true
            } else {
                false
            }
        });
        if before != after {
            debug!("Phase {} -> {} on {:?}", before, after, event);
            self.publish(SessionUpdate::Phase {
                phase: after,
                prompt: after.prompt(),
            });
        }

        for effect in effects {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Connect => {
                self.connect_attempt += 1;
                self.discard_audio = false;
                self.turn_committed = false;
                self.uncommitted.store(false, Ordering::SeqCst);
                let attempt = self.connect_attempt;
                let manager = self.manager.clone();
                let tx = self.inputs.clone();
                let task = tokio::spawn(async move {
                    let result = manager.connect().await;
                    let _ = tx.send(Input::Connected { attempt, result });
                });
                self.connect_task = Some(task.abort_handle());
            }
            Effect::Disconnect => {
                // Any connect still in flight is no longer wanted
                self.connect_attempt += 1;
                if let Some(task) = self.connect_task.take() {
                    task.abort();
                }
                self.retry_timer.disarm();
                if let Err(e) = self.manager.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
            }
            Effect::StartCapture => {
                self.capture_generation += 1;
                let generation = self.capture_generation;
                let capture = self.capture.clone();
                let tx = self.inputs.clone();
                tokio::spawn(async move {
                    let result = capture.start().await;
                    let _ = tx.send(Input::CaptureStarted { generation, result });
                });
            }
            Effect::StopCapture => {
                self.capture_generation += 1;
                self.resume_timer.disarm();
                self.capture.stop().await;
            }
            Effect::PauseCapture => {
                self.resume_timer.disarm();
                self.capture.set_paused(true);
            }
            Effect::ResumeCapture => self.capture.set_paused(false),
            Effect::ResumeCaptureAfterSettle => {
                let delay = self.settings.interrupt_settle;
                self.resume_timer
                    .arm(TimerKind::ResumeCapture, delay, &self.inputs);
            }
            Effect::CommitAudio => {
                self.turn_committed = false;
                if self.uncommitted.swap(false, Ordering::SeqCst) {
                    match self.manager.commit_audio() {
                        Ok(()) => self.turn_committed = true,
                        Err(e) => warn!("Failed to commit audio: {}", e),
                    }
                } else {
                    debug!("Silence with no new speech, nothing to commit");
                }
            }
            Effect::RequestResponse => {
                if !std::mem::take(&mut self.turn_committed) {
                    return;
                }
                match self.manager.create_response() {
                    Ok(()) => self.publish(SessionUpdate::Processing(true)),
                    Err(e) => warn!("Failed to request response: {}", e),
                }
            }
            Effect::CancelResponse => {
                self.discard_audio = true;
                if let Err(e) = self.manager.cancel_response() {
                    debug!("Failed to cancel response: {}", e);
                }
            }
            Effect::ClearInputAudio => {
                self.uncommitted.store(false, Ordering::SeqCst);
                if let Err(e) = self.manager.clear_audio_buffer() {
                    debug!("Failed to clear input audio: {}", e);
                }
            }
            Effect::StopPlayback => self.playback.stop(),
            Effect::ScheduleRetry => {
                let delay = self.settings.retry_delay;
                info!(
                    "Retrying in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    self.machine.retries,
                    self.machine.max_retries
                );
                self.retry_timer.arm(TimerKind::Retry, delay, &self.inputs);
            }
            Effect::ArmAutoStop => self.arm_auto_stop(),
            Effect::DisarmAutoStop => self.auto_stop_timer.disarm(),
            Effect::SaveHistory => self.save_history(),
            Effect::SurfaceError(message) => self.publish(SessionUpdate::Error(message)),
        }
    }

    fn arm_auto_stop(&mut self) {
        let delay = self.settings.auto_stop_after;
        self.auto_stop_timer
            .arm(TimerKind::AutoStop, delay, &self.inputs);
    }

    fn append_history(&mut self, role: Role, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.history.lock().append(role, delta);
        self.publish(SessionUpdate::Transcript {
            role,
            delta: delta.to_string(),
        });
    }

    fn publish_history(&self) {
        let messages = self.history.lock().messages();
        self.publish(SessionUpdate::History(messages));
    }

    fn save_history(&self) {
        let Some(path) = &self.settings.history_file else {
            return;
        };
        if let Err(e) = self.history.lock().save(path) {
            warn!("{}", e);
        }
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::CaptureSettings;
    use crate::core::capture::testing::ChannelSource;
    use crate::core::playback::testing::RecordingSink;
    use crate::core::realtime::testing::{ScriptedConnector, ServerEnd};
    use crate::core::realtime::{
        ClientEvent, ConnectionSettings, RealtimeConfig, ReconnectionConfig,
    };
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        connector: Arc<ScriptedConnector>,
        source: Arc<ChannelSource>,
        capture: Arc<CapturePipeline>,
        sink: Arc<RecordingSink>,
        controller: SessionController,
    }

    fn harness_with(settings: SessionSettings, sink: Arc<RecordingSink>) -> Harness {
        let connector = ScriptedConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            RealtimeConfig::default(),
            ConnectionSettings {
                reconnection: ReconnectionConfig::disabled(),
                ..Default::default()
            },
        ));
        let source = ChannelSource::new();
        let capture = Arc::new(CapturePipeline::new(
            source.clone(),
            CaptureSettings {
                sample_rate: 1000,
                block_size: 100,
                ..Default::default()
            },
        ));
        let playback = Arc::new(PlaybackQueue::new(sink.clone(), 24000));
        let controller =
            SessionController::new(manager, capture.clone(), playback, settings).unwrap();
        Harness {
            connector,
            source,
            capture,
            sink,
            controller,
        }
    }

    impl Harness {
        fn capture_ready(&self) -> bool {
            self.source.opens.load(Ordering::SeqCst) > self.source.closes.load(Ordering::SeqCst)
        }
    }

    fn harness() -> Harness {
        harness_with(SessionSettings::default(), RecordingSink::new())
    }

    async fn wait_phase(controller: &SessionController, phase: ConversationPhase) {
        timeout(WAIT, controller.wait_for_phase(phase))
            .await
            .unwrap_or_else(|_| panic!("phase never reached {}", phase))
            .unwrap();
    }

    async fn start_listening(h: &Harness) -> ServerEnd {
        let mut server = h.connector.push_socket();
        h.controller.start_conversation().await.unwrap();
        assert_eq!(h.controller.phase(), ConversationPhase::Connecting);
        server.handshake().await;
        wait_phase(&h.controller, ConversationPhase::Listening).await;
        // Wait for the microphone to open
        for _ in 0..100 {
            if h.source.push(vec![0.0; 100]).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.capture_ready());
        server
    }

    fn audio_delta(first: f32) -> serde_json::Value {
        json!({"type": "response.audio.delta", "delta": codec::encode_base64(&[first, 0.0])})
    }

    /// Skip frames until one of the wanted type arrives.
    async fn next_event_of(server: &mut ServerEnd, event_type: &str) -> ClientEvent {
        loop {
            let event = timeout(WAIT, server.next_event())
                .await
                .expect("timed out waiting for client event")
                .expect("client closed");
            if event.event_type() == event_type {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_round_trip() {
        let h = harness();
        let mut updates = h.controller.subscribe();
        let server = start_listening(&h).await;

        server.send_json(audio_delta(0.5));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;

        server.send_json(json!({"type": "response.done"}));
        wait_phase(&h.controller, ConversationPhase::Listening).await;

        assert_eq!(h.sink.played.lock().len(), 1);
        let mut phases = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::Phase { phase, .. } = update {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                ConversationPhase::Connecting,
                ConversationPhase::Listening,
                ConversationPhase::Speaking,
                ConversationPhase::Listening,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_waits_for_playback_to_drain() {
        let h = harness_with(
            SessionSettings::default(),
            RecordingSink::with_delay(Duration::from_millis(500)),
        );
        let server = start_listening(&h).await;

        server.send_json(audio_delta(0.25));
        server.send_json(audio_delta(0.5));
        server.send_json(json!({"type": "response.done"}));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.controller.phase(), ConversationPhase::Speaking);

        wait_phase(&h.controller, ConversationPhase::Listening).await;
        assert_eq!(h.sink.played_ids(), vec![0.25, 0.5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_after_response_done_keeps_listening() {
        let h = harness();
        let server = start_listening(&h).await;

        server.send_json(audio_delta(0.5));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;
        server.send_json(json!({"type": "response.done"}));
        wait_phase(&h.controller, ConversationPhase::Listening).await;

        // Straggler from the finished response
        server.send_json(audio_delta(0.7));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);
        assert!(!h.capture.is_paused());
        assert_eq!(h.sink.played_ids(), vec![0.5]);

        // A new response still speaks
        server.send_json(json!({"type": "response.created"}));
        server.send_json(audio_delta(0.4));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ignored_while_active() {
        let h = harness();
        let _server = start_listening(&h).await;
        h.controller.start_conversation().await.unwrap();
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);
        assert_eq!(h.connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_commits_and_requests_response() {
        let h = harness();
        let mut server = start_listening(&h).await;

        assert!(h.source.push(vec![0.5; 100]).await);
        let append = next_event_of(&mut server, "input_audio_buffer.append").await;
        assert!(append.is_audio());

        // 2000ms at 1000Hz
        for _ in 0..20 {
            h.source.push(vec![0.0; 100]).await;
        }
        next_event_of(&mut server, "input_audio_buffer.commit").await;
        next_event_of(&mut server, "response.create").await;
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_without_speech_commits_nothing() {
        let h = harness();
        let mut server = start_listening(&h).await;

        for _ in 0..25 {
            h.source.push(vec![0.0; 100]).await;
        }
        h.controller.send_text("hello").await.unwrap();

        // The typed message is the first non-audio event
        let event = loop {
            let event = timeout(WAIT, server.next_event()).await.unwrap().unwrap();
            if !event.is_audio() {
                break event;
            }
        };
        assert_eq!(event.event_type(), "conversation.item.create");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cancels_and_resumes_listening() {
        let h = harness_with(
            SessionSettings::default(),
            RecordingSink::with_delay(Duration::from_secs(10)),
        );
        let mut server = start_listening(&h).await;

        server.send_json(audio_delta(0.3));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;

        h.controller.interrupt().await.unwrap();
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);
        assert!(h.sink.halts.load(Ordering::SeqCst) >= 1);

        next_event_of(&mut server, "response.cancel").await;
        next_event_of(&mut server, "input_audio_buffer.clear").await;

        // Late audio from the cancelled response is dropped
        server.send_json(audio_delta(0.9));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);

        // The next response plays again
        server.send_json(json!({"type": "response.created"}));
        server.send_json(audio_delta(0.4));
        wait_phase(&h.controller, ConversationPhase::Speaking).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_to_idle_and_closes() {
        let h = harness();
        let mut server = start_listening(&h).await;

        h.controller.stop().await.unwrap();
        assert_eq!(h.controller.phase(), ConversationPhase::Idle);
        assert_eq!(h.source.closes.load(Ordering::SeqCst), 1);

        let mut saw_close = false;
        while let Some(frame) = server.next_frame().await {
            if matches!(frame, crate::core::realtime::Frame::Close(Some(1000))) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_retries_then_errors() {
        let h = harness();
        let mut updates = h.controller.subscribe();

        h.controller.start_conversation().await.unwrap();
        wait_phase(&h.controller, ConversationPhase::Error).await;
        assert!(h.controller.error_message().is_some());

        // Initial attempt plus two scheduled retries
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.opens(), 3);
        assert_eq!(h.controller.phase(), ConversationPhase::Error);

        let mut errors = 0;
        while let Ok(update) = updates.try_recv() {
            if matches!(update, SessionUpdate::Error(_)) {
                errors += 1;
            }
        }
        assert_eq!(errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_handshake_timeout() {
        let h = harness();
        // First socket never answers
        let _silent = h.connector.push_socket();
        let mut server = h.connector.push_socket();

        h.controller.start_conversation().await.unwrap();
        wait_phase(&h.controller, ConversationPhase::Error).await;
        assert_eq!(
            h.controller.error_message().as_deref(),
            Some("Connection timed out. Please try again.")
        );

        server.handshake().await;
        wait_phase(&h.controller, ConversationPhase::Listening).await;
        assert_eq!(h.controller.error_message(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_connect_abandons_attempt() {
        let h = harness();
        let _server = h.connector.push_socket();

        h.controller.start_conversation().await.unwrap();
        h.controller.stop().await.unwrap();
        assert_eq!(h.controller.phase(), ConversationPhase::Idle);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.controller.phase(), ConversationPhase::Idle);
        assert_eq!(h.controller.error_message(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_surfaces_error() {
        let h = harness();
        *h.source.fail_with.lock() = Some(CaptureError::PermissionDenied("denied".into()));
        let mut server = h.connector.push_socket();

        h.controller.start_conversation().await.unwrap();
        server.handshake().await;
        wait_phase(&h.controller, ConversationPhase::Error).await;
        assert!(
            h.controller
                .error_message()
                .unwrap()
                .starts_with("Microphone access was denied")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_becomes_error() {
        let h = harness();
        let server = start_listening(&h).await;

        server.close(1001);
        wait_phase(&h.controller, ConversationPhase::Error).await;
        assert_eq!(
            h.controller.error_message().as_deref(),
            Some("Connection lost (code: 1001). Tap to reconnect.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_stop_after_quiet_listening() {
        let h = harness();
        let _server = start_listening(&h).await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.controller.phase(), ConversationPhase::Listening);
        wait_phase(&h.controller, ConversationPhase::Idle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_from_transcripts() {
        let h = harness();
        let server = start_listening(&h).await;

        server.send_json(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "Why is the sky blue?"
        }));
        server.send_json(json!({"type": "response.audio_transcript.delta", "delta": "Because "}));
        server.send_json(json!({"type": "response.audio_transcript.delta", "delta": "of light!"}));
        server.send_json(json!({"type": "moderation.violation", "message": "flagged"}));
        server.send_json(json!({"type": "response.done"}));

        let mut history = Vec::new();
        for _ in 0..50 {
            history = h.controller.history();
            if history.len() == 2 && history[1].content.ends_with("request.") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "Why is the sky blue?");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(
            history[1].content,
            format!("Because of light!{}", MODERATION_REFUSAL)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_persisted_and_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let settings = SessionSettings {
            history_file: Some(path.clone()),
            ..Default::default()
        };
        let h = harness_with(settings.clone(), RecordingSink::new());
        let _server = start_listening(&h).await;

        h.controller.send_text("Count to three").await.unwrap();
        h.controller.stop().await.unwrap();
        assert!(path.exists());

        drop(h);
        let h = harness_with(settings, RecordingSink::new());
        assert_eq!(h.controller.history()[0].content, "Count to three");

        h.controller.clear_history().await.unwrap();
        assert!(h.controller.history().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_requires_active_conversation() {
        let h = harness();
        assert!(matches!(
            h.controller.send_text("hi").await,
            Err(VoiceError::NotActive)
        ));
    }
}
