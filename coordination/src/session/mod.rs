//! Conversation session model.
//!
//! A [`Session`] is the single owner of the "floor": who is speaking, what was
//! said, and the counters the lifetime limits look at. It is a plain data
//! structure with no I/O; the scheduler actor is the only code that mutates
//! one, which is what makes its check-and-set operations atomic.

pub mod limits;
pub mod selection;
pub mod state;

pub use limits::SessionLimits;
pub use selection::SpeakerSelector;
pub use state::{
    AgentId, EndReason, PhaseTransition, Session, SessionId, SessionPhase, SessionSnapshot,
    SpeechEvent, SpeechRecord, SpeechRegistration, SpeechText, TransitionError, TriggerKind,
    MAX_SPEECH_DURATION,
};
