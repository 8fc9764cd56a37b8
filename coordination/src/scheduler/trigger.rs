//! Pending reactive triggers and how their claims resolve.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::reaction::Reaction;
use crate::session::{AgentId, SessionId};

/// A reactive bid for the floor waiting out its delay.
///
/// Consumed exactly once by its own timer task. The session keeps the
/// authoritative copy and checks the claim against it.
#[derive(Debug, Clone)]
pub struct PendingTrigger {
    pub id: String,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub scheduled_at: Instant,
    pub fire_at: Instant,
    /// Session speech sequence when the trigger was scheduled.
    pub observed_seq: u64,
    pub reaction: Reaction,
    /// Child of the session token; cancelled when the session stops.
    pub cancel: CancellationToken,
}

/// Why a reactive trigger did not get the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The session is no longer active.
    SessionEnded,
    /// Someone holds the floor.
    SpeakerActive,
    /// The floor is free but the post-speech grace has not elapsed.
    NotAcceptable,
    /// A speech started after the trigger was scheduled.
    SpeechStartedSince,
    /// The request gate refused the generation.
    GateRejected,
    /// The session has no record of this trigger.
    UnknownTrigger,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionEnded => write!(f, "session_ended"),
            Self::SpeakerActive => write!(f, "speaker_active"),
            Self::NotAcceptable => write!(f, "not_acceptable"),
            Self::SpeechStartedSince => write!(f, "speech_started_since"),
            Self::GateRejected => write!(f, "gate_rejected"),
            Self::UnknownTrigger => write!(f, "unknown_trigger"),
        }
    }
}

/// Result of a trigger asking for the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted { seq: u64 },
    Dropped(DropReason),
}
