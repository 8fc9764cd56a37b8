//! Event types for turn coordination
//!
//! Everything observable about a session is published as a [`TurnEvent`]:
//! transports fan utterances out to clients, transcripts log them, tests
//! assert on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::DropReason;
use crate::session::{AgentId, EndReason, SessionId, TriggerKind};

/// All turn coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A session's tick loop started
    SessionStarted {
        session_id: SessionId,
        participants: Vec<AgentId>,
        topic: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent was given the floor and its utterance is being generated
    SpeechRequested {
        session_id: SessionId,
        agent_id: AgentId,
        trigger: TriggerKind,
        seq: u64,
        timestamp: DateTime<Utc>,
    },

    /// An utterance's text is final and it starts playing now
    UtteranceFinalized {
        session_id: SessionId,
        agent_id: AgentId,
        trigger: TriggerKind,
        seq: u64,
        text: String,
        emotion: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A speech finished playing and the floor is free
    SpeechEnded {
        session_id: SessionId,
        agent_id: AgentId,
        seq: u64,
        timestamp: DateTime<Utc>,
    },

    /// Generation failed; the floor was released
    GenerationFailed {
        session_id: SessionId,
        agent_id: AgentId,
        seq: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The request gate refused a generation
    RequestRejected {
        session_id: SessionId,
        agent_id: AgentId,
        trigger: TriggerKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A listener scored the last utterance
    ReactionRecorded {
        session_id: SessionId,
        listener_id: AgentId,
        speaker_id: AgentId,
        engagement: f64,
        agreement: f64,
        should_respond: bool,
        emotional_response: String,
        fallback: bool,
        timestamp: DateTime<Utc>,
    },

    /// A reactive trigger is waiting out its delay
    TriggerScheduled {
        session_id: SessionId,
        trigger_id: String,
        agent_id: AgentId,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A reactive trigger passed re-validation and took the floor
    TriggerFired {
        session_id: SessionId,
        trigger_id: String,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A reactive trigger failed re-validation
    TriggerDropped {
        session_id: SessionId,
        trigger_id: String,
        agent_id: Option<AgentId>,
        reason: DropReason,
        timestamp: DateTime<Utc>,
    },

    /// The session ended
    SessionEnded {
        session_id: SessionId,
        reason: EndReason,
        rounds: u32,
        total_speeches: u32,
        timestamp: DateTime<Utc>,
    },
}

impl TurnEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TurnEvent::SessionStarted { timestamp, .. } => *timestamp,
            TurnEvent::SpeechRequested { timestamp, .. } => *timestamp,
            TurnEvent::UtteranceFinalized { timestamp, .. } => *timestamp,
            TurnEvent::SpeechEnded { timestamp, .. } => *timestamp,
            TurnEvent::GenerationFailed { timestamp, .. } => *timestamp,
            TurnEvent::RequestRejected { timestamp, .. } => *timestamp,
            TurnEvent::ReactionRecorded { timestamp, .. } => *timestamp,
            TurnEvent::TriggerScheduled { timestamp, .. } => *timestamp,
            TurnEvent::TriggerFired { timestamp, .. } => *timestamp,
            TurnEvent::TriggerDropped { timestamp, .. } => *timestamp,
            TurnEvent::SessionEnded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::SessionStarted { .. } => "session_started",
            TurnEvent::SpeechRequested { .. } => "speech_requested",
            TurnEvent::UtteranceFinalized { .. } => "utterance_finalized",
            TurnEvent::SpeechEnded { .. } => "speech_ended",
            TurnEvent::GenerationFailed { .. } => "generation_failed",
            TurnEvent::RequestRejected { .. } => "request_rejected",
            TurnEvent::ReactionRecorded { .. } => "reaction_recorded",
            TurnEvent::TriggerScheduled { .. } => "trigger_scheduled",
            TurnEvent::TriggerFired { .. } => "trigger_fired",
            TurnEvent::TriggerDropped { .. } => "trigger_dropped",
            TurnEvent::SessionEnded { .. } => "session_ended",
        }
    }

    /// Every event is session-scoped
    pub fn session_id(&self) -> &str {
        match self {
            TurnEvent::SessionStarted { session_id, .. }
            | TurnEvent::SpeechRequested { session_id, .. }
            | TurnEvent::UtteranceFinalized { session_id, .. }
            | TurnEvent::SpeechEnded { session_id, .. }
            | TurnEvent::GenerationFailed { session_id, .. }
            | TurnEvent::RequestRejected { session_id, .. }
            | TurnEvent::ReactionRecorded { session_id, .. }
            | TurnEvent::TriggerScheduled { session_id, .. }
            | TurnEvent::TriggerFired { session_id, .. }
            | TurnEvent::TriggerDropped { session_id, .. }
            | TurnEvent::SessionEnded { session_id, .. } => session_id,
        }
    }

    /// The agent the event is about, if any. Reactions report the listener.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            TurnEvent::SpeechRequested { agent_id, .. }
            | TurnEvent::UtteranceFinalized { agent_id, .. }
            | TurnEvent::SpeechEnded { agent_id, .. }
            | TurnEvent::GenerationFailed { agent_id, .. }
            | TurnEvent::RequestRejected { agent_id, .. }
            | TurnEvent::TriggerScheduled { agent_id, .. }
            | TurnEvent::TriggerFired { agent_id, .. } => Some(agent_id),
            TurnEvent::ReactionRecorded { listener_id, .. } => Some(listener_id),
            TurnEvent::TriggerDropped { agent_id, .. } => agent_id.as_deref(),
            TurnEvent::SessionStarted { .. } | TurnEvent::SessionEnded { .. } => None,
        }
    }
}
