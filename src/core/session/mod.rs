//! Conversation session: phases, history and the controller that drives
//! capture, playback and the realtime connection.

mod controller;
mod history;
mod phase;

pub use controller::{MODERATION_REFUSAL, SessionController, SessionSettings, SessionUpdate};
pub use history::{
    ConversationHistory, DEFAULT_HISTORY_CAP, DEFAULT_MERGE_WINDOW, HistoryError, Message, Role,
};
pub use phase::{ConversationPhase, Effect, PhaseMachine, SessionEvent, transition};
