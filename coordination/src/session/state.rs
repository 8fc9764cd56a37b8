//! Session state machine, speech history and the floor.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{CoordinationError, CoordinationResult};

/// Longest speech the floor accepts. Longer reported durations are rejected.
pub const MAX_SPEECH_DURATION: Duration = Duration::from_secs(60 * 60);

/// Unique identifier for sessions
pub type SessionId = String;

/// Opaque identifier of a participating agent
pub type AgentId = String;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Created, tick loop not started.
    Idle,
    /// Tick loop running; speeches may start.
    Active,
    /// Stopped or limit reached. Absorbing.
    Ended,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [SessionPhase] {
        match self {
            Self::Idle => &[Self::Active, Self::Ended],
            Self::Active => &[Self::Ended],
            Self::Ended => &[],
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// What caused a speech to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Chosen by the tick loop after a silence gap.
    Autonomous,
    /// A listener asked for the floor after evaluating the last utterance.
    Reactive,
    /// Explicitly queued through `request_turn`.
    Requested,
    /// Reported by the caller via `register_speech_start` with no claim.
    External,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Autonomous => write!(f, "autonomous"),
            Self::Reactive => write!(f, "reactive"),
            Self::Requested => write!(f, "requested"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Text of a speech. Moves from `Pending` to `Final` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechText {
    Pending,
    Final(String),
}

impl SpeechText {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn as_final(&self) -> Option<&str> {
        match self {
            Self::Final(text) => Some(text),
            Self::Pending => None,
        }
    }
}

/// One speech in a session's history.
#[derive(Debug, Clone)]
pub struct SpeechEvent {
    /// Session-local sequence number, incremented for every speech start.
    pub seq: u64,
    pub agent_id: AgentId,
    pub trigger: TriggerKind,
    pub started_at: Instant,
    /// Placeholder window while pending, real speaking time once final.
    pub duration: Duration,
    pub text: SpeechText,
    pub emotion: Option<String>,
}

impl SpeechEvent {
    pub fn end_time(&self) -> Instant {
        let duration = self.duration.min(MAX_SPEECH_DURATION);
        self.started_at
            .checked_add(duration)
            .unwrap_or(self.started_at)
    }

    pub fn is_pending(&self) -> bool {
        self.text.is_pending()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    MaxRounds { rounds: u32 },
    MaxSpeeches { speeches: u32 },
    MaxDuration { elapsed_secs: u64 },
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::MaxRounds { rounds } => write!(f, "round limit reached ({rounds})"),
            Self::MaxSpeeches { speeches } => write!(f, "speech limit reached ({speeches})"),
            Self::MaxDuration { elapsed_secs } => {
                write!(f, "duration limit reached ({elapsed_secs}s)")
            }
        }
    }
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// How `register_speech_start` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechRegistration {
    /// Completed the pending placeholder for the same agent.
    Finalized { seq: u64 },
    /// Recorded a speech the session had not claimed itself.
    External { seq: u64 },
}

impl SpeechRegistration {
    pub fn seq(self) -> u64 {
        match self {
            Self::Finalized { seq } | Self::External { seq } => seq,
        }
    }
}

/// A conversation session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub participants: Vec<AgentId>,
    /// Locked for the lifetime of the session.
    pub topic: String,
    pub created_at: DateTime<Utc>,
    phase: SessionPhase,
    started_at: Option<Instant>,
    /// Completed speeches.
    rounds: u32,
    /// Floor claims, including generations that later failed.
    total_speeches: u32,
    history: Vec<SpeechEvent>,
    current_speaker: Option<AgentId>,
    /// Last time the floor went quiet. Never moves backwards.
    last_speech_end: Option<Instant>,
    last_reactive_trigger: Option<Instant>,
    speech_seq: u64,
    turn_queue: VecDeque<AgentId>,
    end_reason: Option<EndReason>,
    transitions: Vec<PhaseTransition>,
}

impl Session {
    /// Create an idle session. Participants must be at least two unique, non-empty ids.
    pub fn new(
        id: impl Into<SessionId>,
        participants: Vec<AgentId>,
        topic: impl Into<String>,
    ) -> CoordinationResult<Self> {
        if participants.len() < 2 {
            return Err(CoordinationError::InvalidParticipants(format!(
                "a session needs at least two participants, got {}",
                participants.len()
            )));
        }
        let mut seen = HashSet::new();
        for participant in &participants {
            if participant.trim().is_empty() {
                return Err(CoordinationError::InvalidParticipants(
                    "participant ids must be non-empty".into(),
                ));
            }
            if !seen.insert(participant.as_str()) {
                return Err(CoordinationError::InvalidParticipants(format!(
                    "duplicate participant `{participant}`"
                )));
            }
        }

        Ok(Self {
            id: id.into(),
            participants,
            topic: topic.into(),
            created_at: Utc::now(),
            phase: SessionPhase::Idle,
            started_at: None,
            rounds: 0,
            total_speeches: 0,
            history: Vec::new(),
            current_speaker: None,
            last_speech_end: None,
            last_reactive_trigger: None,
            speech_seq: 0,
            turn_queue: VecDeque::new(),
            end_reason: None,
            transitions: Vec::new(),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: SessionPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        Ok(())
    }

    pub fn activate(&mut self, now: Instant) -> Result<(), TransitionError> {
        self.transition(SessionPhase::Active, "session started")?;
        self.started_at = Some(now);
        Ok(())
    }

    /// End the session and release the floor. Returns false if it had already ended.
    pub fn end(&mut self, reason: EndReason) -> bool {
        if self
            .transition(SessionPhase::Ended, &reason.to_string())
            .is_err()
        {
            return false;
        }
        self.current_speaker = None;
        self.end_reason = Some(reason);
        true
    }

    /// Time since activation.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start))
    }

    // =========================================================================
    // Floor
    // =========================================================================

    pub fn current_speaker(&self) -> Option<&str> {
        self.current_speaker.as_deref()
    }

    /// Whether the floor is held by a speech still waiting for its text.
    pub fn is_generating(&self) -> bool {
        self.current_speaker.is_some() && self.history.last().is_some_and(SpeechEvent::is_pending)
    }

    pub fn speech_seq(&self) -> u64 {
        self.speech_seq
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn total_speeches(&self) -> u32 {
        self.total_speeches
    }

    pub fn history(&self) -> &[SpeechEvent] {
        &self.history
    }

    pub fn last_speaker(&self) -> Option<&str> {
        self.history.last().map(|e| e.agent_id.as_str())
    }

    pub fn last_speech_end(&self) -> Option<Instant> {
        self.last_speech_end
    }

    pub fn is_participant(&self, agent_id: &str) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }

    /// Take the floor for `agent_id` with a pending placeholder speech.
    ///
    /// Fails with `InvariantViolation` if another speech holds the floor; the
    /// caller drops the second claim.
    pub fn claim_slot(
        &mut self,
        agent_id: &str,
        trigger: TriggerKind,
        now: Instant,
        placeholder: Duration,
    ) -> CoordinationResult<u64> {
        self.ensure_active()?;
        self.ensure_participant(agent_id)?;
        if let Some(holder) = &self.current_speaker {
            return Err(CoordinationError::invariant(
                &self.id,
                format!("floor held by {holder}, rejected claim for {agent_id}"),
            ));
        }

        self.speech_seq += 1;
        self.total_speeches += 1;
        self.history.push(SpeechEvent {
            seq: self.speech_seq,
            agent_id: agent_id.to_string(),
            trigger,
            started_at: now,
            duration: placeholder,
            text: SpeechText::Pending,
            emotion: None,
        });
        self.current_speaker = Some(agent_id.to_string());
        Ok(self.speech_seq)
    }

    /// Replace the pending placeholder `seq` with the real utterance.
    pub fn finalize_pending(
        &mut self,
        seq: u64,
        text: String,
        duration: Duration,
        emotion: Option<String>,
        now: Instant,
    ) -> CoordinationResult<&SpeechEvent> {
        self.ensure_active()?;
        let idx = match self.history.len().checked_sub(1) {
            Some(idx) if self.history[idx].seq == seq && self.history[idx].is_pending() => idx,
            _ => {
                return Err(CoordinationError::invariant(
                    &self.id,
                    format!("no pending speech with seq {seq}"),
                ))
            }
        };

        ensure_speech_duration(&self.history[idx].agent_id, duration)?;

        self.rounds += 1;
        let event = &mut self.history[idx];
        event.started_at = now;
        event.duration = duration;
        event.text = SpeechText::Final(text);
        event.emotion = emotion;
        Ok(&self.history[idx])
    }

    /// Record that `agent_id` started speaking `text` for `duration`.
    ///
    /// Finalizes that agent's pending placeholder if there is one. Otherwise,
    /// with the floor free, records an externally produced speech.
    pub fn register_speech_start(
        &mut self,
        agent_id: &str,
        text: String,
        duration: Duration,
        emotion: Option<String>,
        now: Instant,
    ) -> CoordinationResult<SpeechRegistration> {
        self.ensure_active()?;
        self.ensure_participant(agent_id)?;
        ensure_speech_duration(agent_id, duration)?;

        let pending_seq = self
            .history
            .last()
            .filter(|e| e.is_pending() && e.agent_id == agent_id)
            .map(|e| e.seq);
        if let Some(seq) = pending_seq {
            self.finalize_pending(seq, text, duration, emotion, now)?;
            return Ok(SpeechRegistration::Finalized { seq });
        }

        if let Some(holder) = &self.current_speaker {
            return Err(CoordinationError::invariant(
                &self.id,
                format!("{agent_id} started speaking while {holder} holds the floor"),
            ));
        }

        self.speech_seq += 1;
        self.total_speeches += 1;
        self.rounds += 1;
        self.history.push(SpeechEvent {
            seq: self.speech_seq,
            agent_id: agent_id.to_string(),
            trigger: TriggerKind::External,
            started_at: now,
            duration,
            text: SpeechText::Final(text),
            emotion,
        });
        self.current_speaker = Some(agent_id.to_string());
        Ok(SpeechRegistration::External {
            seq: self.speech_seq,
        })
    }

    /// Drop the pending placeholder `seq` after a failed generation and free the floor.
    ///
    /// The failure counts as a zero-length turn for silence timing.
    pub fn abandon_pending(&mut self, seq: u64, now: Instant) -> bool {
        if !self
            .history
            .last()
            .is_some_and(|e| e.seq == seq && e.is_pending())
        {
            return false;
        }
        if let Some(event) = self.history.pop() {
            if self.current_speaker.as_deref() == Some(event.agent_id.as_str()) {
                self.current_speaker = None;
            }
        }
        self.mark_floor_free(now);
        true
    }

    /// Release the floor if the current speech ended at least `settle_buffer` ago.
    ///
    /// Returns the finished speech so it can be handed to the listeners.
    pub fn settle(&mut self, now: Instant, settle_buffer: Duration) -> Option<SpeechEvent> {
        self.current_speaker.as_ref()?;
        let event = self.history.last().filter(|e| !e.is_pending())?;
        let end = event.end_time();
        if end.checked_add(settle_buffer).map_or(true, |settled| now < settled) {
            return None;
        }
        let finished = event.clone();
        self.current_speaker = None;
        self.mark_floor_free(end);
        Some(finished)
    }

    fn mark_floor_free(&mut self, at: Instant) {
        self.last_speech_end = Some(self.last_speech_end.map_or(at, |prev| prev.max(at)));
    }

    /// Time the floor has been quiet, measured from activation before the first speech.
    pub fn silence_elapsed(&self, now: Instant) -> Duration {
        self.last_speech_end
            .or(self.started_at)
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    // =========================================================================
    // Reactive triggers
    // =========================================================================

    /// Whether a reactive trigger may take the floor right now.
    pub fn can_accept_reactive_trigger(&self, now: Instant, grace: Duration) -> bool {
        self.is_active()
            && self.current_speaker.is_none()
            && self.last_speech_end.map_or(true, |end| now >= end + grace)
    }

    pub fn notify_reactive_trigger(&mut self, now: Instant) {
        self.last_reactive_trigger = Some(now);
    }

    /// Whether the autonomous path should still back off after a reactive trigger.
    pub fn in_reactive_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_reactive_trigger
            .is_some_and(|at| now < at + cooldown)
    }

    // =========================================================================
    // Requested turns
    // =========================================================================

    /// Queue a turn for `agent_id`. Priority requests jump the queue.
    pub fn enqueue_turn(&mut self, agent_id: &str, priority: bool) -> CoordinationResult<()> {
        self.ensure_participant(agent_id)?;
        if let Some(pos) = self.turn_queue.iter().position(|a| a == agent_id) {
            if !priority {
                return Ok(());
            }
            self.turn_queue.remove(pos);
        }
        if priority {
            self.turn_queue.push_front(agent_id.to_string());
        } else {
            self.turn_queue.push_back(agent_id.to_string());
        }
        Ok(())
    }

    pub fn pop_queued_turn(&mut self) -> Option<AgentId> {
        self.turn_queue.pop_front()
    }

    pub fn has_queued_turns(&self) -> bool {
        !self.turn_queue.is_empty()
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// The last `limit` finalized utterances as `agent: text` lines, oldest first.
    pub fn context_lines(&self, limit: usize) -> Vec<String> {
        let lines: Vec<String> = self
            .history
            .iter()
            .filter_map(|e| {
                e.text
                    .as_final()
                    .map(|text| format!("{}: {}", e.agent_id, text))
            })
            .collect();
        let skip = lines.len().saturating_sub(limit);
        lines.into_iter().skip(skip).collect()
    }

    /// Human-readable one-line summary.
    pub fn status_line(&self) -> String {
        format!(
            "Session {} [{}] rounds={} speeches={} speaker={}",
            self.id,
            self.phase,
            self.rounds,
            self.total_speeches,
            self.current_speaker.as_deref().unwrap_or("-")
        )
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            topic: self.topic.clone(),
            phase: self.phase,
            participants: self.participants.clone(),
            rounds: self.rounds,
            total_speeches: self.total_speeches,
            current_speaker: self.current_speaker.clone(),
            generating: self.is_generating(),
            queued_turns: self.turn_queue.iter().cloned().collect(),
            elapsed_ms: self.elapsed(now).as_millis() as u64,
            created_at: self.created_at,
            end_reason: self.end_reason.clone(),
            history: self.history.iter().map(SpeechRecord::from).collect(),
        }
    }

    fn ensure_active(&self) -> CoordinationResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoordinationError::invariant(
                &self.id,
                format!("session is {}", self.phase),
            ))
        }
    }

    fn ensure_participant(&self, agent_id: &str) -> CoordinationResult<()> {
        if self.is_participant(agent_id) {
            Ok(())
        } else {
            Err(CoordinationError::InvalidParticipants(format!(
                "`{agent_id}` is not a participant of session {}",
                self.id
            )))
        }
    }
}

fn ensure_speech_duration(agent_id: &str, duration: Duration) -> CoordinationResult<()> {
    if duration > MAX_SPEECH_DURATION {
        return Err(CoordinationError::SpeechTooLong {
            agent_id: agent_id.to_string(),
            duration,
            max: MAX_SPEECH_DURATION,
        });
    }
    Ok(())
}

/// Serializable view of one speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub seq: u64,
    pub agent_id: AgentId,
    pub trigger: TriggerKind,
    /// `None` while the speech is still being generated.
    pub text: Option<String>,
    pub emotion: Option<String>,
    pub duration_ms: u64,
}

impl From<&SpeechEvent> for SpeechRecord {
    fn from(event: &SpeechEvent) -> Self {
        Self {
            seq: event.seq,
            agent_id: event.agent_id.clone(),
            trigger: event.trigger,
            text: event.text.as_final().map(str::to_string),
            emotion: event.emotion.clone(),
            duration_ms: event.duration.as_millis() as u64,
        }
    }
}

/// Serializable point-in-time view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub topic: String,
    pub phase: SessionPhase,
    pub participants: Vec<AgentId>,
    pub rounds: u32,
    pub total_speeches: u32,
    pub current_speaker: Option<AgentId>,
    pub generating: bool,
    pub queued_turns: Vec<AgentId>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
    pub history: Vec<SpeechRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACEHOLDER: Duration = Duration::from_secs(5);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn active_session() -> (Session, Instant) {
        let mut session = Session::new(
            "s-1",
            vec!["sage".into(), "spark".into(), "flint".into()],
            "tidal power",
        )
        .unwrap();
        let t0 = Instant::now();
        session.activate(t0).unwrap();
        (session, t0)
    }

    #[test]
    fn test_new_rejects_bad_participants() {
        let single = Session::new("s", vec!["sage".into()], "t");
        assert!(matches!(single, Err(CoordinationError::InvalidParticipants(_))));

        let dup = Session::new("s", vec!["sage".into(), "sage".into()], "t");
        assert!(matches!(dup, Err(CoordinationError::InvalidParticipants(_))));

        let blank = Session::new("s", vec!["sage".into(), " ".into()], "t");
        assert!(blank.is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (mut session, _) = active_session();
        assert!(session.is_active());
        assert!(session.end(EndReason::Stopped));
        assert_eq!(session.phase(), SessionPhase::Ended);

        // Ended is absorbing
        assert!(!session.end(EndReason::Stopped));
        assert!(session.transition(SessionPhase::Active, "again").is_err());
        assert_eq!(session.transitions().len(), 2);
        assert_eq!(session.end_reason(), Some(&EndReason::Stopped));
    }

    #[test]
    fn test_second_claim_is_invariant_violation() {
        let (mut session, t0) = active_session();
        let seq = session
            .claim_slot("sage", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .unwrap();
        assert_eq!(seq, 1);
        assert!(session.is_generating());

        let err = session
            .claim_slot("spark", TriggerKind::Reactive, t0, PLACEHOLDER)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvariantViolation { .. }));
        assert_eq!(session.current_speaker(), Some("sage"));
        assert_eq!(session.total_speeches(), 1);
    }

    #[test]
    fn test_claim_requires_participant_and_active() {
        let (mut session, t0) = active_session();
        assert!(session
            .claim_slot("stranger", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .is_err());

        session.end(EndReason::Stopped);
        assert!(session
            .claim_slot("sage", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .is_err());
    }

    #[test]
    fn test_register_finalizes_pending() {
        let (mut session, t0) = active_session();
        session
            .claim_slot("sage", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .unwrap();

        let t1 = t0 + secs(1);
        let registration = session
            .register_speech_start("sage", "Consider the tides.".into(), secs(3), None, t1)
            .unwrap();
        assert_eq!(registration, SpeechRegistration::Finalized { seq: 1 });
        assert_eq!(session.rounds(), 1);
        assert_eq!(session.total_speeches(), 1);

        let event = session.history().last().unwrap();
        assert_eq!(event.text.as_final(), Some("Consider the tides."));
        assert_eq!(event.end_time(), t1 + secs(3));
        assert!(!session.is_generating());
    }

    #[test]
    fn test_register_external_when_floor_free() {
        let (mut session, t0) = active_session();
        let registration = session
            .register_speech_start("flint", "Prove it.".into(), secs(2), None, t0)
            .unwrap();
        assert_eq!(registration, SpeechRegistration::External { seq: 1 });
        assert_eq!(session.current_speaker(), Some("flint"));
        assert_eq!(session.history()[0].trigger, TriggerKind::External);

        let err = session
            .register_speech_start("spark", "Imagine!".into(), secs(2), None, t0)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvariantViolation { .. }));
    }

    #[test]
    fn test_settle_waits_for_buffer() {
        let (mut session, t0) = active_session();
        session
            .register_speech_start("sage", "Hello.".into(), secs(3), None, t0)
            .unwrap();

        assert!(session.settle(t0 + secs(4), secs(2)).is_none());
        let finished = session.settle(t0 + secs(5), secs(2)).unwrap();
        assert_eq!(finished.agent_id, "sage");
        assert_eq!(session.current_speaker(), None);
        assert_eq!(session.last_speech_end(), Some(t0 + secs(3)));
        assert_eq!(session.silence_elapsed(t0 + secs(8)), secs(5));
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let (mut session, t0) = active_session();
        let err = session
            .register_speech_start("sage", "Forever.".into(), Duration::MAX, None, t0)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::SpeechTooLong { .. }));
        assert_eq!(session.current_speaker(), None);
        assert_eq!(session.speech_seq(), 0);

        let seq = session
            .claim_slot("spark", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .unwrap();
        let err = session
            .finalize_pending(seq, "Longer still.".into(), Duration::MAX, None, t0)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::SpeechTooLong { .. }));
        assert_eq!(session.rounds(), 0);
        assert!(session.history()[0].is_pending());

        // The cap itself is accepted and settles normally
        session
            .finalize_pending(seq, "An hour.".into(), MAX_SPEECH_DURATION, None, t0)
            .unwrap();
        let done = t0 + MAX_SPEECH_DURATION + secs(2);
        assert_eq!(session.settle(done, secs(2)).map(|e| e.seq), Some(seq));
    }

    #[test]
    fn test_end_time_never_overflows() {
        let t0 = Instant::now();
        let event = SpeechEvent {
            seq: 1,
            agent_id: "sage".into(),
            trigger: TriggerKind::External,
            started_at: t0,
            duration: Duration::MAX,
            text: SpeechText::Final("...".into()),
            emotion: None,
        };
        assert_eq!(event.end_time(), t0 + MAX_SPEECH_DURATION);
    }

    #[test]
    fn test_settle_ignores_pending() {
        let (mut session, t0) = active_session();
        session
            .claim_slot("sage", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .unwrap();
        assert!(session.settle(t0 + secs(60), secs(2)).is_none());
    }

    #[test]
    fn test_abandon_frees_floor() {
        let (mut session, t0) = active_session();
        let seq = session
            .claim_slot("sage", TriggerKind::Autonomous, t0, PLACEHOLDER)
            .unwrap();

        assert!(!session.abandon_pending(seq + 1, t0));
        assert!(session.abandon_pending(seq, t0 + secs(1)));
        assert_eq!(session.current_speaker(), None);
        assert!(session.history().is_empty());
        assert_eq!(session.total_speeches(), 1);
        assert_eq!(session.rounds(), 0);
        assert_eq!(session.last_speech_end(), Some(t0 + secs(1)));
    }

    #[test]
    fn test_reactive_acceptance_and_cooldown() {
        let (mut session, t0) = active_session();
        assert!(session.can_accept_reactive_trigger(t0, secs(1)));

        session
            .register_speech_start("sage", "Hello.".into(), secs(3), None, t0)
            .unwrap();
        assert!(!session.can_accept_reactive_trigger(t0 + secs(1), secs(1)));

        session.settle(t0 + secs(5), secs(2)).unwrap();
        assert!(session.can_accept_reactive_trigger(t0 + secs(5), secs(1)));

        session.notify_reactive_trigger(t0 + secs(5));
        assert!(session.in_reactive_cooldown(t0 + secs(34), secs(30)));
        assert!(!session.in_reactive_cooldown(t0 + secs(35), secs(30)));
    }

    #[test]
    fn test_speech_ends_are_monotonic() {
        let (mut session, t0) = active_session();
        let mut now = t0;
        for agent in ["sage", "spark", "flint", "sage"] {
            session
                .register_speech_start(agent, "...".into(), secs(2), None, now)
                .unwrap();
            now += secs(4);
            session.settle(now, secs(2)).unwrap();
        }
        let ends: Vec<Instant> = session.history().iter().map(SpeechEvent::end_time).collect();
        assert!(ends.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(session.rounds(), 4);
    }

    #[test]
    fn test_turn_queue_priority() {
        let (mut session, _) = active_session();
        session.enqueue_turn("spark", false).unwrap();
        session.enqueue_turn("flint", false).unwrap();
        session.enqueue_turn("spark", false).unwrap();
        session.enqueue_turn("flint", true).unwrap();
        assert!(session.enqueue_turn("stranger", true).is_err());

        assert_eq!(session.pop_queued_turn().as_deref(), Some("flint"));
        assert_eq!(session.pop_queued_turn().as_deref(), Some("spark"));
        assert_eq!(session.pop_queued_turn(), None);
    }

    #[test]
    fn test_context_lines_keep_latest() {
        let (mut session, t0) = active_session();
        let mut now = t0;
        for (agent, text) in [("sage", "one"), ("spark", "two"), ("flint", "three")] {
            session
                .register_speech_start(agent, text.into(), secs(1), None, now)
                .unwrap();
            now += secs(3);
            session.settle(now, secs(2)).unwrap();
        }
        assert_eq!(
            session.context_lines(2),
            vec!["spark: two".to_string(), "flint: three".to_string()]
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let (mut session, t0) = active_session();
        session
            .claim_slot("spark", TriggerKind::Requested, t0, PLACEHOLDER)
            .unwrap();

        let snapshot = session.snapshot(t0 + secs(1));
        assert!(snapshot.generating);
        assert_eq!(snapshot.history[0].text, None);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["phase"], "active");
        assert_eq!(json["history"][0]["trigger"], "requested");
        assert_eq!(json["elapsed_ms"], 1000);
        assert!(session.status_line().contains("speaker=spark"));
    }
}
