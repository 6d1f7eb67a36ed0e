//! Conversation phases and the transition table.
//!
//! [`transition`] is a pure function from the current [`PhaseMachine`] and
//! a [`SessionEvent`] to the next machine and the [`Effect`]s the controller
//! must carry out. Every pair is defined; events that mean nothing in a
//! phase leave it unchanged with no effects.

use std::fmt;

use serde::Serialize;

/// Where the conversation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationPhase {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error,
}

impl ConversationPhase {
    pub const ALL: [ConversationPhase; 5] = [
        ConversationPhase::Idle,
        ConversationPhase::Connecting,
        ConversationPhase::Listening,
        ConversationPhase::Speaking,
        ConversationPhase::Error,
    ];

    /// Label shown on the talk button.
    pub fn prompt(&self) -> &'static str {
        match self {
            ConversationPhase::Idle => "Tap to talk!",
            ConversationPhase::Connecting => "Getting ready...",
            ConversationPhase::Listening => "I'm listening!",
            ConversationPhase::Speaking => "Tap to interrupt",
            ConversationPhase::Error => "Tap to try again",
        }
    }

    /// A connection is wanted in this phase.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConversationPhase::Connecting | ConversationPhase::Listening | ConversationPhase::Speaking
        )
    }

    /// A fresh `Start` is accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, ConversationPhase::Idle | ConversationPhase::Error)
    }
}

impl fmt::Display for ConversationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationPhase::Idle => "idle",
            ConversationPhase::Connecting => "connecting",
            ConversationPhase::Listening => "listening",
            ConversationPhase::Speaking => "speaking",
            ConversationPhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// User asked to talk
    Start,
    /// User ended the conversation
    Stop,
    /// User cut the assistant off
    Interrupt,
    /// Connection open and session configured
    HandshakeSucceeded,
    /// Connection or handshake failed
    HandshakeFailed(String),
    /// Assistant audio arrived
    RemoteAudioStarted,
    /// Assistant finished generating
    RemoteDone,
    /// Playback queue ran dry
    PlaybackDrained,
    /// Client-side silence after user speech
    SilenceTimeout,
    /// Established connection gave up reconnecting
    ConnectionLost(String),
    /// Microphone failed
    CaptureFailed(String),
    /// Handshake retry delay elapsed
    RetryElapsed,
    /// Listening turn idle for too long
    AutoStop,
}

impl SessionEvent {
    /// One instance of every event kind, for exhaustive checks.
    pub fn samples() -> Vec<SessionEvent> {
        vec![
            SessionEvent::Start,
            SessionEvent::Stop,
            SessionEvent::Interrupt,
            SessionEvent::HandshakeSucceeded,
            SessionEvent::HandshakeFailed("handshake".to_string()),
            SessionEvent::RemoteAudioStarted,
            SessionEvent::RemoteDone,
            SessionEvent::PlaybackDrained,
            SessionEvent::SilenceTimeout,
            SessionEvent::ConnectionLost("lost".to_string()),
            SessionEvent::CaptureFailed("mic".to_string()),
            SessionEvent::RetryElapsed,
            SessionEvent::AutoStop,
        ]
    }
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect,
    Disconnect,
    StartCapture,
    StopCapture,
    PauseCapture,
    ResumeCapture,
    /// Resume capture after the interrupt settle delay
    ResumeCaptureAfterSettle,
    CommitAudio,
    RequestResponse,
    CancelResponse,
    ClearInputAudio,
    StopPlayback,
    ScheduleRetry,
    ArmAutoStop,
    DisarmAutoStop,
    SaveHistory,
    SurfaceError(String),
}

/// Phase plus the little context the transitions need.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseMachine {
    pub phase: ConversationPhase,
    /// Message shown while in `Error`
    pub error: Option<String>,
    /// Handshake retries used in this attempt
    pub retries: u32,
    /// Automatic handshake retries allowed
    pub max_retries: u32,
    /// A retry timer is outstanding
    pub retry_pending: bool,
    /// `response.done` seen for the current reply
    pub remote_done: bool,
    /// Playback has nothing queued
    pub drained: bool,
}

impl PhaseMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            phase: ConversationPhase::Idle,
            error: None,
            retries: 0,
            max_retries,
            retry_pending: false,
            remote_done: false,
            drained: true,
        }
    }

    /// Apply an event in place and return the effects.
    pub fn apply(&mut self, event: &SessionEvent) -> Vec<Effect> {
        let (next, effects) = transition(self, event);
        *self = next;
        effects
    }
}

fn teardown() -> Vec<Effect> {
    vec![
        Effect::DisarmAutoStop,
        Effect::StopCapture,
        Effect::StopPlayback,
        Effect::Disconnect,
    ]
}

fn back_to_listening(mut next: PhaseMachine, resume: Effect) -> (PhaseMachine, Vec<Effect>) {
    next.phase = ConversationPhase::Listening;
    next.remote_done = false;
    next.drained = true;
    (next, vec![resume, Effect::ArmAutoStop])
}

/// The transition table.
pub fn transition(current: &PhaseMachine, event: &SessionEvent) -> (PhaseMachine, Vec<Effect>) {
    use ConversationPhase as P;
    use SessionEvent as E;

    let mut next = current.clone();
    let stay = |m: PhaseMachine| (m, Vec::new());

    match (current.phase, event) {
        // Starting
        (P::Idle | P::Error, E::Start) => {
            next.phase = P::Connecting;
            next.error = None;
            next.retries = 0;
            next.retry_pending = false;
            next.remote_done = false;
            next.drained = true;
            (next, vec![Effect::Connect])
        }
        (P::Error, E::RetryElapsed) if current.retry_pending => {
            next.phase = P::Connecting;
            next.retry_pending = false;
            (next, vec![Effect::Connect])
        }

        // Handshake
        (P::Connecting, E::HandshakeSucceeded) => {
            next.phase = P::Listening;
            next.error = None;
            next.retries = 0;
            (next, vec![Effect::StartCapture, Effect::ArmAutoStop])
        }
        (P::Connecting, E::HandshakeFailed(message)) => {
            next.phase = P::Error;
            next.error = Some(message.clone());
            let mut effects = vec![Effect::Disconnect, Effect::SurfaceError(message.clone())];
            if current.retries < current.max_retries {
                next.retries += 1;
                next.retry_pending = true;
                effects.push(Effect::ScheduleRetry);
            }
            (next, effects)
        }

        // Assistant turn
        (P::Listening, E::RemoteAudioStarted) => {
            next.phase = P::Speaking;
            next.remote_done = false;
            next.drained = false;
            (next, vec![Effect::DisarmAutoStop, Effect::PauseCapture])
        }
        (P::Speaking, E::RemoteAudioStarted) => {
            next.drained = false;
            stay(next)
        }
        (P::Speaking, E::RemoteDone) => {
            if current.drained {
                back_to_listening(next, Effect::ResumeCapture)
            } else {
                next.remote_done = true;
                stay(next)
            }
        }
        (P::Speaking, E::PlaybackDrained) => {
            if current.remote_done {
                back_to_listening(next, Effect::ResumeCapture)
            } else {
                next.drained = true;
                stay(next)
            }
        }
        (P::Speaking, E::Interrupt) => {
            let (next, mut tail) = back_to_listening(next, Effect::ResumeCaptureAfterSettle);
            let mut effects = vec![
                Effect::StopPlayback,
                Effect::CancelResponse,
                Effect::ClearInputAudio,
            ];
            effects.append(&mut tail);
            (next, effects)
        }

        // User turn
        (P::Listening, E::SilenceTimeout) => {
            (next, vec![Effect::CommitAudio, Effect::RequestResponse])
        }

        // Ending
        (P::Connecting | P::Listening | P::Speaking, E::Stop) => {
            next.phase = P::Idle;
            next.error = None;
            next.retry_pending = false;
            let mut effects = teardown();
            effects.push(Effect::SaveHistory);
            (next, effects)
        }
        (P::Error, E::Stop) => {
            next.phase = P::Idle;
            next.error = None;
            next.retry_pending = false;
            (next, vec![Effect::Disconnect])
        }
        (P::Listening, E::AutoStop) => {
            next.phase = P::Idle;
            let mut effects = teardown();
            effects.push(Effect::SaveHistory);
            (next, effects)
        }

        // Failures
        (P::Listening | P::Speaking, E::ConnectionLost(message)) => {
            next.phase = P::Error;
            next.error = Some(message.clone());
            next.retry_pending = false;
            let mut effects = teardown();
            effects.push(Effect::SurfaceError(message.clone()));
            (next, effects)
        }
        (P::Connecting | P::Listening | P::Speaking, E::CaptureFailed(message)) => {
            next.phase = P::Error;
            next.error = Some(message.clone());
            next.retry_pending = false;
            let mut effects = teardown();
            effects.push(Effect::SurfaceError(message.clone()));
            (next, effects)
        }

        _ => stay(next),
    }
}
