//! Session actor: the one task that owns a [`Session`].
//!
//! The tick loop, every handle call, generation results and reaction-pass
//! results all arrive here and are applied one at a time. Every
//! check-and-set on the floor therefore runs without an intervening await,
//! which is what rules out two speeches starting at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::handle::SessionHandle;
use super::trigger::{ClaimOutcome, DropReason, PendingTrigger};
use crate::config::TurnConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{SharedEventBus, TurnEvent};
use crate::gate::SharedRequestGate;
use crate::gateway::{GatewayError, GenerationRequest, SharedGateway, Utterance};
use crate::reaction::{CompletedSpeech, Reaction, ReactionAggregator, ReactionPass};
use crate::session::{
    AgentId, EndReason, Session, SessionLimits, SessionSnapshot, SpeakerSelector, SpeechEvent,
    SpeechRegistration, SpeechText, TriggerKind, MAX_SPEECH_DURATION,
};

/// Messages a session actor accepts.
pub(crate) enum SessionCommand {
    RegisterSpeechStart {
        agent_id: AgentId,
        utterance: Utterance,
        reply: oneshot::Sender<CoordinationResult<SpeechRegistration>>,
    },
    NotifyReactiveTrigger {
        agent_id: AgentId,
        reply: oneshot::Sender<CoordinationResult<()>>,
    },
    CanAcceptReactive {
        reply: oneshot::Sender<bool>,
    },
    RequestTurn {
        agent_id: AgentId,
        priority: bool,
        reply: oneshot::Sender<CoordinationResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    ScheduleReactive {
        reaction: Reaction,
        delay: Duration,
        reply: oneshot::Sender<CoordinationResult<PendingTrigger>>,
    },
    ClaimReactive {
        trigger_id: String,
        reply: oneshot::Sender<ClaimOutcome>,
    },
    GenerationFinished {
        agent_id: AgentId,
        seq: u64,
        result: Result<Utterance, GatewayError>,
    },
    ReactionPassFinished {
        seq: u64,
        pass: ReactionPass,
    },
}

/// Collaborators shared by every session of a coordinator.
#[derive(Clone)]
pub(crate) struct SessionServices {
    pub gateway: SharedGateway,
    pub gate: SharedRequestGate,
    pub aggregator: Arc<ReactionAggregator>,
    pub bus: SharedEventBus,
}

/// The session's copy of a pending trigger.
struct PendingSlot {
    agent_id: AgentId,
    fire_at: Instant,
    observed_seq: u64,
    reaction: Reaction,
}

pub(crate) struct SessionActor {
    session: Session,
    config: Arc<TurnConfig>,
    services: SessionServices,
    handle: SessionHandle,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    selector: SpeakerSelector,
    rng: StdRng,
    /// Drawn once per silence gap, cleared when a speech starts.
    silence_target: Option<Duration>,
    reaction_passes: usize,
    pending: HashMap<String, PendingSlot>,
}

impl SessionActor {
    pub(crate) fn new(
        session: Session,
        config: Arc<TurnConfig>,
        services: SessionServices,
        handle: SessionHandle,
        commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            selector: SpeakerSelector::new(config.recent_window),
            session,
            config,
            services,
            handle,
            commands,
            cancel,
            rng,
            silence_target: None,
            reaction_passes: 0,
            pending: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.session.activate(Instant::now()) {
            error!(session_id = %self.session.id, "Session could not start: {}", e);
            self.cancel.cancel();
            return;
        }
        info!(
            session_id = %self.session.id,
            participants = ?self.session.participants,
            topic = %self.session.topic,
            "Session started"
        );
        self.publish(TurnEvent::SessionStarted {
            session_id: self.session.id.clone(),
            participants: self.session.participants.clone(),
            topic: self.session.topic.clone(),
            timestamp: Utc::now(),
        });

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => self.finish(EndReason::Stopped),
                Some(command) = self.commands.recv() => self.handle_command(command, Instant::now()),
                _ = ticker.tick() => self.tick(Instant::now()),
            }
            if self.session.phase().is_terminal() {
                break;
            }
        }
        debug!(session_id = %self.session.id, "Session actor exited");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: SessionCommand, now: Instant) {
        match command {
            SessionCommand::RegisterSpeechStart {
                agent_id,
                utterance,
                reply,
            } => {
                let _ = reply.send(self.register_speech(&agent_id, utterance, now));
            }
            SessionCommand::NotifyReactiveTrigger { agent_id, reply } => {
                let result = if self.session.is_participant(&agent_id) {
                    self.session.notify_reactive_trigger(now);
                    Ok(())
                } else {
                    Err(CoordinationError::InvalidParticipants(format!(
                        "`{agent_id}` is not a participant"
                    )))
                };
                let _ = reply.send(result);
            }
            SessionCommand::CanAcceptReactive { reply } => {
                let _ = reply.send(
                    self.session
                        .can_accept_reactive_trigger(now, self.config.reactive_grace()),
                );
            }
            SessionCommand::RequestTurn {
                agent_id,
                priority,
                reply,
            } => {
                let result = self.session.enqueue_turn(&agent_id, priority);
                if result.is_ok() {
                    debug!(session_id = %self.session.id, agent_id = %agent_id, priority, "Turn requested");
                }
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot(now));
            }
            SessionCommand::ScheduleReactive {
                reaction,
                delay,
                reply,
            } => {
                let _ = reply.send(self.register_trigger(reaction, delay, now));
            }
            SessionCommand::ClaimReactive { trigger_id, reply } => {
                let _ = reply.send(self.claim_reactive(&trigger_id, now));
            }
            SessionCommand::GenerationFinished {
                agent_id,
                seq,
                result,
            } => self.on_generation_finished(&agent_id, seq, result, now),
            SessionCommand::ReactionPassFinished { seq, pass } => {
                self.on_reaction_pass_finished(seq, pass)
            }
        }
    }

    fn register_speech(
        &mut self,
        agent_id: &str,
        utterance: Utterance,
        now: Instant,
    ) -> CoordinationResult<SpeechRegistration> {
        let registration = self
            .session
            .register_speech_start(
                agent_id,
                utterance.text,
                utterance.duration,
                utterance.emotion,
                now,
            )
            .inspect_err(|e| {
                if matches!(e, CoordinationError::InvariantViolation { .. }) {
                    error!(session_id = %self.session.id, agent_id, "Rejected speech start: {}", e);
                }
            })?;

        self.silence_target = None;
        self.announce_utterance(registration.seq());
        self.end_if_limit_reached(now, true);
        Ok(registration)
    }

    // =========================================================================
    // Tick
    // =========================================================================

    fn tick(&mut self, now: Instant) {
        let floor_free = self.session.current_speaker().is_none();
        if self.end_if_limit_reached(now, floor_free) {
            return;
        }

        if let Some(finished) = self.session.settle(now, self.config.settle_buffer()) {
            debug!(session_id = %self.session.id, agent_id = %finished.agent_id, seq = finished.seq, "Speech settled");
            self.publish(TurnEvent::SpeechEnded {
                session_id: self.session.id.clone(),
                agent_id: finished.agent_id.clone(),
                seq: finished.seq,
                timestamp: Utc::now(),
            });
            self.spawn_reaction_pass(finished);
            return;
        }

        // Reactive bids get their chance before the autonomous path moves on.
        if self.session.current_speaker().is_some()
            || self.reaction_passes > 0
            || self.has_pending_trigger(now)
        {
            return;
        }

        if let Some(agent_id) = self.session.pop_queued_turn() {
            if self
                .start_speech(&agent_id, TriggerKind::Requested, None, now)
                .is_none()
            {
                // Keep its place; the gate may just be rate limiting
                let _ = self.session.enqueue_turn(&agent_id, true);
            }
            return;
        }

        if self
            .session
            .in_reactive_cooldown(now, self.config.reactive_cooldown())
        {
            return;
        }

        let target = self.draw_silence_target();
        if self.session.silence_elapsed(now) < target {
            return;
        }

        let next = self.selector.select(
            &self.session.participants,
            self.session.history(),
            &mut self.rng,
        );
        if let Some(agent_id) = next {
            self.start_speech(&agent_id, TriggerKind::Autonomous, None, now);
        }
    }

    fn draw_silence_target(&mut self) -> Duration {
        if let Some(target) = self.silence_target {
            return target;
        }
        let (min, max) = self.config.silence_range_ms();
        let target = Duration::from_millis(self.rng.random_range(min..=max));
        self.silence_target = Some(target);
        target
    }

    /// Drop stale slots whose timer never reported back, then report whether any remain.
    fn has_pending_trigger(&mut self, now: Instant) -> bool {
        let grace = self.config.tick_interval() + self.config.settle_buffer();
        self.pending.retain(|_, slot| now <= slot.fire_at + grace);
        !self.pending.is_empty()
    }

    /// End the session if a limit is hit. While the floor is held only the
    /// duration cap applies, so a claimed speech is not cut off by its own count.
    fn end_if_limit_reached(&mut self, now: Instant, include_counts: bool) -> bool {
        let elapsed = self.session.elapsed(now);
        let reason = if include_counts {
            self.config.limits.check(
                self.session.rounds(),
                self.session.total_speeches(),
                elapsed,
            )
        } else {
            SessionLimits {
                max_rounds: 0,
                max_total_speeches: 0,
                ..self.config.limits
            }
            .check(0, 0, elapsed)
        };
        match reason {
            Some(reason) => {
                self.finish(reason);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Speech
    // =========================================================================

    /// The guarded generation path shared by every trigger.
    ///
    /// Passes the request gate, claims the floor with a placeholder, then
    /// generates in a separate task that reports back as a command.
    fn start_speech(
        &mut self,
        agent_id: &str,
        trigger: TriggerKind,
        reaction: Option<Reaction>,
        now: Instant,
    ) -> Option<u64> {
        let permit = match self.services.gate.try_acquire(&self.session.id, agent_id) {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(session_id = %self.session.id, agent_id, %trigger, "Generation request rejected: {}", rejection);
                self.publish(TurnEvent::RequestRejected {
                    session_id: self.session.id.clone(),
                    agent_id: agent_id.to_string(),
                    trigger,
                    reason: rejection.to_string(),
                    timestamp: Utc::now(),
                });
                return None;
            }
        };

        let seq = match self.session.claim_slot(
            agent_id,
            trigger,
            now,
            self.config.placeholder_duration(),
        ) {
            Ok(seq) => seq,
            Err(e) => {
                error!(session_id = %self.session.id, agent_id, "Dropping floor claim: {}", e);
                return None;
            }
        };

        self.silence_target = None;
        info!(session_id = %self.session.id, agent_id, %trigger, seq, "Floor granted");
        self.publish(TurnEvent::SpeechRequested {
            session_id: self.session.id.clone(),
            agent_id: agent_id.to_string(),
            trigger,
            seq,
            timestamp: Utc::now(),
        });

        let request = GenerationRequest {
            session_id: self.session.id.clone(),
            agent_id: agent_id.to_string(),
            topic: self.session.topic.clone(),
            trigger,
            context: self.session.context_lines(self.config.context_window),
            reaction,
        };
        let gateway = Arc::clone(&self.services.gateway);
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.generation_timeout();
        let span = tracing::info_span!("generation", session_id = %self.session.id, agent_id, seq);

        tokio::spawn(
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio::time::timeout(timeout, gateway.generate(&request)) => {
                        result.unwrap_or(Err(GatewayError::Timeout(timeout)))
                    }
                };
                drop(permit);
                handle
                    .generation_finished(request.agent_id, seq, result)
                    .await;
            }
            .instrument(span),
        );

        Some(seq)
    }

    fn on_generation_finished(
        &mut self,
        agent_id: &str,
        seq: u64,
        result: Result<Utterance, GatewayError>,
        now: Instant,
    ) {
        let result = result.and_then(|utterance| {
            if utterance.text.trim().is_empty() {
                Err(GatewayError::EmptyUtterance)
            } else {
                Ok(utterance)
            }
        });

        match result {
            Ok(utterance) => {
                if utterance.duration > MAX_SPEECH_DURATION {
                    warn!(
                        session_id = %self.session.id,
                        agent_id,
                        seq,
                        "Clamping speech duration {:?} to {:?}",
                        utterance.duration,
                        MAX_SPEECH_DURATION
                    );
                }
                let finalized = self
                    .session
                    .finalize_pending(
                        seq,
                        utterance.text,
                        utterance.duration.min(MAX_SPEECH_DURATION),
                        utterance.emotion,
                        now,
                    )
                    .map(|_| ());
                match finalized {
                    Ok(_) => {
                        self.announce_utterance(seq);
                        self.end_if_limit_reached(now, true);
                    }
                    Err(e) => {
                        debug!(session_id = %self.session.id, agent_id, seq, "Discarding generated utterance: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %self.session.id, agent_id, seq, "Generation failed: {}", e);
                if self.session.abandon_pending(seq, now) {
                    self.publish(TurnEvent::GenerationFailed {
                        session_id: self.session.id.clone(),
                        agent_id: agent_id.to_string(),
                        seq,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    fn announce_utterance(&self, seq: u64) {
        let Some(event) = self.session.history().iter().rev().find(|e| e.seq == seq) else {
            return;
        };
        let SpeechText::Final(text) = &event.text else {
            return;
        };
        info!(
            session_id = %self.session.id,
            agent_id = %event.agent_id,
            seq,
            trigger = %event.trigger,
            "Utterance finalized"
        );
        self.publish(TurnEvent::UtteranceFinalized {
            session_id: self.session.id.clone(),
            agent_id: event.agent_id.clone(),
            trigger: event.trigger,
            seq,
            text: text.clone(),
            emotion: event.emotion.clone(),
            duration_ms: event.duration.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    // =========================================================================
    // Reactions
    // =========================================================================

    fn spawn_reaction_pass(&mut self, finished: SpeechEvent) {
        let SpeechText::Final(text) = finished.text else {
            return;
        };
        let speech = CompletedSpeech {
            session_id: self.session.id.clone(),
            topic: self.session.topic.clone(),
            participants: self.session.participants.clone(),
            speaker_id: finished.agent_id,
            seq: finished.seq,
            text,
            emotion: finished.emotion,
        };

        self.reaction_passes += 1;
        let aggregator = Arc::clone(&self.services.aggregator);
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        let span = tracing::debug_span!("reaction_pass", session_id = %speech.session_id, seq = speech.seq);

        tokio::spawn(
            async move {
                let pass = tokio::select! {
                    _ = cancel.cancelled() => return,
                    pass = aggregator.process_utterance(&handle, &speech) => pass,
                };
                handle.reaction_pass_finished(speech.seq, pass).await;
            }
            .instrument(span),
        );
    }

    fn on_reaction_pass_finished(&mut self, seq: u64, pass: ReactionPass) {
        self.reaction_passes = self.reaction_passes.saturating_sub(1);
        debug!(session_id = %self.session.id, seq, outcome = ?pass.outcome, "Reaction pass finished");
        for reaction in pass.reactions {
            self.publish(TurnEvent::ReactionRecorded {
                session_id: self.session.id.clone(),
                listener_id: reaction.listener_id,
                speaker_id: reaction.speaker_id,
                engagement: reaction.scores.engagement,
                agreement: reaction.scores.agreement,
                should_respond: reaction.should_respond,
                emotional_response: reaction.emotional_response,
                fallback: reaction.fallback,
                timestamp: Utc::now(),
            });
        }
    }

    fn register_trigger(
        &mut self,
        reaction: Reaction,
        delay: Duration,
        now: Instant,
    ) -> CoordinationResult<PendingTrigger> {
        if !self.session.is_participant(&reaction.listener_id) {
            return Err(CoordinationError::InvalidParticipants(format!(
                "`{}` is not a participant",
                reaction.listener_id
            )));
        }

        let trigger = PendingTrigger {
            id: Uuid::new_v4().to_string(),
            session_id: self.session.id.clone(),
            agent_id: reaction.listener_id.clone(),
            scheduled_at: now,
            fire_at: now + delay,
            observed_seq: self.session.speech_seq(),
            reaction: reaction.clone(),
            cancel: self.cancel.child_token(),
        };
        self.pending.insert(
            trigger.id.clone(),
            PendingSlot {
                agent_id: trigger.agent_id.clone(),
                fire_at: trigger.fire_at,
                observed_seq: trigger.observed_seq,
                reaction,
            },
        );
        self.publish(TurnEvent::TriggerScheduled {
            session_id: self.session.id.clone(),
            trigger_id: trigger.id.clone(),
            agent_id: trigger.agent_id.clone(),
            delay_ms: delay.as_millis() as u64,
            timestamp: Utc::now(),
        });
        Ok(trigger)
    }

    /// Re-validate a fired trigger, in order: session active, floor free,
    /// reactive grace elapsed, no speech started since scheduling.
    fn claim_reactive(&mut self, trigger_id: &str, now: Instant) -> ClaimOutcome {
        let Some(slot) = self.pending.remove(trigger_id) else {
            return self.drop_trigger(trigger_id, None, DropReason::UnknownTrigger);
        };

        let verdict = if !self.session.is_active() {
            Some(DropReason::SessionEnded)
        } else if self.session.current_speaker().is_some() {
            Some(DropReason::SpeakerActive)
        } else if !self
            .session
            .can_accept_reactive_trigger(now, self.config.reactive_grace())
        {
            Some(DropReason::NotAcceptable)
        } else if self.session.speech_seq() != slot.observed_seq {
            Some(DropReason::SpeechStartedSince)
        } else {
            None
        };
        if let Some(reason) = verdict {
            return self.drop_trigger(trigger_id, Some(slot.agent_id), reason);
        }

        self.session.notify_reactive_trigger(now);
        match self.start_speech(
            &slot.agent_id,
            TriggerKind::Reactive,
            Some(slot.reaction),
            now,
        ) {
            Some(seq) => {
                self.publish(TurnEvent::TriggerFired {
                    session_id: self.session.id.clone(),
                    trigger_id: trigger_id.to_string(),
                    agent_id: slot.agent_id,
                    timestamp: Utc::now(),
                });
                ClaimOutcome::Granted { seq }
            }
            None => self.drop_trigger(trigger_id, Some(slot.agent_id), DropReason::GateRejected),
        }
    }

    fn drop_trigger(
        &self,
        trigger_id: &str,
        agent_id: Option<AgentId>,
        reason: DropReason,
    ) -> ClaimOutcome {
        debug!(session_id = %self.session.id, trigger_id, agent_id = ?agent_id, %reason, "Reactive trigger dropped");
        self.publish(TurnEvent::TriggerDropped {
            session_id: self.session.id.clone(),
            trigger_id: trigger_id.to_string(),
            agent_id,
            reason,
            timestamp: Utc::now(),
        });
        ClaimOutcome::Dropped(reason)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    fn finish(&mut self, reason: EndReason) {
        if !self.session.end(reason.clone()) {
            return;
        }
        self.cancel.cancel();
        self.pending.clear();
        self.services.aggregator.forget_session(&self.session.id);

        info!(
            session_id = %self.session.id,
            reason = %reason,
            rounds = self.session.rounds(),
            total_speeches = self.session.total_speeches(),
            "Session ended"
        );
        self.publish(TurnEvent::SessionEnded {
            session_id: self.session.id.clone(),
            reason,
            rounds: self.session.rounds(),
            total_speeches: self.session.total_speeches(),
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: TurnEvent) {
        self.services.bus.publish(event);
    }
}
