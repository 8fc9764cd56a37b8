//! Reaction aggregation: from a finished utterance to at most one delayed
//! reactive trigger.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, Instrument};

use super::evaluator::{evaluate_or_neutral, EvaluationRequest, EvaluatorRegistry};
use super::types::Reaction;
use crate::config::TurnConfig;
use crate::scheduler::{ClaimOutcome, PendingTrigger, SessionHandle};
use crate::session::{AgentId, SessionId};

/// A speech that has finished playing, handed to the listeners.
#[derive(Debug, Clone)]
pub struct CompletedSpeech {
    pub session_id: SessionId,
    pub topic: String,
    pub participants: Vec<AgentId>,
    pub speaker_id: AgentId,
    pub seq: u64,
    pub text: String,
    pub emotion: Option<String>,
}

/// What a reaction pass decided.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    /// Nobody wanted the floor badly enough.
    NoResponder,
    /// The winner exists but the session cannot take a reactive trigger now.
    SessionBusy { agent_id: AgentId },
    /// The winner had a reactive trigger scheduled too recently.
    AgentCoolingDown {
        agent_id: AgentId,
        remaining: Duration,
    },
    /// The session stopped while the pass was running.
    SessionGone,
    /// A pending trigger was registered and its timer started.
    Scheduled {
        trigger_id: String,
        agent_id: AgentId,
        delay: Duration,
    },
}

impl AggregationOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// All reactions gathered in one pass plus the decision taken.
#[derive(Debug, Clone)]
pub struct ReactionPass {
    pub reactions: Vec<Reaction>,
    pub outcome: AggregationOutcome,
}

/// Highest-engagement qualifying reaction; the first one wins ties.
pub fn select_responder(reactions: &[Reaction], threshold: f64) -> Option<&Reaction> {
    let mut best: Option<&Reaction> = None;
    for reaction in reactions.iter().filter(|r| r.qualifies(threshold)) {
        if best.map_or(true, |b| reaction.engagement() > b.engagement()) {
            best = Some(reaction);
        }
    }
    best
}

/// Collects listener reactions and schedules reactive triggers.
///
/// Shared by every session of a coordinator. Per-agent cooldowns are keyed by
/// `(session, agent)`.
pub struct ReactionAggregator {
    evaluators: EvaluatorRegistry,
    cooldowns: Mutex<HashMap<(SessionId, AgentId), Instant>>,
    rng: Mutex<StdRng>,
}

impl ReactionAggregator {
    pub fn new(evaluators: EvaluatorRegistry) -> Self {
        Self {
            evaluators,
            cooldowns: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Fix the RNG used for reactive delays.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    /// Evaluate every participant except the speaker, concurrently.
    ///
    /// Reactions come back in participant order. Failed or slow evaluators
    /// contribute the neutral reaction.
    pub async fn evaluate_listeners(
        &self,
        speech: &CompletedSpeech,
        timeout: Duration,
    ) -> Vec<Reaction> {
        let evaluations = speech
            .participants
            .iter()
            .filter(|p| **p != speech.speaker_id)
            .map(|listener| {
                let evaluator = self.evaluators.for_agent(listener);
                let request = EvaluationRequest {
                    session_id: speech.session_id.clone(),
                    listener_id: listener.clone(),
                    speaker_id: speech.speaker_id.clone(),
                    topic: speech.topic.clone(),
                    text: speech.text.clone(),
                    emotion: speech.emotion.clone(),
                };
                async move { evaluate_or_neutral(evaluator.as_ref(), &request, timeout).await }
            });
        join_all(evaluations).await
    }

    /// Run a full reaction pass for `speech` against the session behind `handle`.
    pub async fn process_utterance(
        &self,
        handle: &SessionHandle,
        speech: &CompletedSpeech,
    ) -> ReactionPass {
        let config = handle.config();
        let reactions = self
            .evaluate_listeners(speech, config.evaluation_timeout())
            .await;
        let outcome = self.decide(handle, config, &reactions).await;
        ReactionPass { reactions, outcome }
    }

    async fn decide(
        &self,
        handle: &SessionHandle,
        config: &TurnConfig,
        reactions: &[Reaction],
    ) -> AggregationOutcome {
        let Some(winner) = select_responder(reactions, config.engagement_threshold) else {
            return AggregationOutcome::NoResponder;
        };
        let agent_id = winner.listener_id.clone();

        match handle.can_accept_reactive_trigger().await {
            Ok(true) => {}
            Ok(false) => return AggregationOutcome::SessionBusy { agent_id },
            Err(_) => return AggregationOutcome::SessionGone,
        }

        if let Some(remaining) = self.cooldown_remaining(
            handle.session_id(),
            &agent_id,
            Instant::now(),
            config.agent_cooldown(),
        ) {
            return AggregationOutcome::AgentCoolingDown {
                agent_id,
                remaining,
            };
        }

        let delay = self.draw_delay(config);
        self.schedule(handle, winner.clone(), delay).await
    }

    /// Register a pending trigger for `reaction.listener_id` and start its timer.
    ///
    /// When the timer fires, the session re-validates before granting the floor.
    pub async fn schedule(
        &self,
        handle: &SessionHandle,
        reaction: Reaction,
        delay: Duration,
    ) -> AggregationOutcome {
        let agent_id = reaction.listener_id.clone();
        let trigger = match handle.schedule_reactive(reaction, delay).await {
            Ok(trigger) => trigger,
            Err(_) => return AggregationOutcome::SessionGone,
        };

        self.record_cooldown(handle.session_id(), &agent_id, trigger.scheduled_at);
        info!(
            session_id = %trigger.session_id,
            agent_id = %agent_id,
            trigger_id = %trigger.id,
            delay_ms = delay.as_millis() as u64,
            "Reactive trigger scheduled"
        );

        let trigger_id = trigger.id.clone();
        let span = tracing::debug_span!(
            "reactive_trigger",
            session_id = %trigger.session_id,
            trigger_id = %trigger.id
        );
        tokio::spawn(fire_when_due(handle.clone(), trigger).instrument(span));

        AggregationOutcome::Scheduled {
            trigger_id,
            agent_id,
            delay,
        }
    }

    /// Drop cooldown bookkeeping for a finished session.
    pub fn forget_session(&self, session_id: &str) {
        self.lock_cooldowns().retain(|(sid, _), _| sid != session_id);
    }

    fn cooldown_remaining(
        &self,
        session_id: &str,
        agent_id: &str,
        now: Instant,
        cooldown: Duration,
    ) -> Option<Duration> {
        let cooldowns = self.lock_cooldowns();
        let last = cooldowns.get(&(session_id.to_string(), agent_id.to_string()))?;
        let ready_at = *last + cooldown;
        (now < ready_at).then(|| ready_at - now)
    }

    fn record_cooldown(&self, session_id: &str, agent_id: &str, at: Instant) {
        self.lock_cooldowns()
            .insert((session_id.to_string(), agent_id.to_string()), at);
    }

    fn draw_delay(&self, config: &TurnConfig) -> Duration {
        let (min, max) = config.reactive_delay_range_ms();
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        Duration::from_millis(rng.random_range(min..=max))
    }

    fn lock_cooldowns(&self) -> MutexGuard<'_, HashMap<(SessionId, AgentId), Instant>> {
        self.cooldowns.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Wait out the trigger's delay, then ask the session for the floor.
async fn fire_when_due(handle: SessionHandle, trigger: PendingTrigger) {
    tokio::select! {
        _ = trigger.cancel.cancelled() => {
            debug!(agent_id = %trigger.agent_id, "Reactive trigger cancelled");
            return;
        }
        _ = tokio::time::sleep_until(trigger.fire_at) => {}
    }

    match handle.claim_reactive(&trigger.id).await {
        Ok(ClaimOutcome::Granted { seq }) => {
            debug!(agent_id = %trigger.agent_id, seq, "Reactive trigger took the floor");
        }
        Ok(ClaimOutcome::Dropped(reason)) => {
            debug!(agent_id = %trigger.agent_id, %reason, "Reactive trigger dropped");
        }
        Err(e) => {
            debug!(agent_id = %trigger.agent_id, "Reactive trigger dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::evaluator::{EvaluationError, ReactionEvaluator};
    use crate::reaction::types::ReactionScores;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn reaction(listener: &str, engagement: f64, should_respond: bool) -> Reaction {
        Reaction {
            scores: ReactionScores {
                engagement,
                ..ReactionScores::neutral()
            },
            should_respond,
            fallback: false,
            ..Reaction::neutral(listener, "sage")
        }
    }

    struct Scripted(f64, bool);

    #[async_trait]
    impl ReactionEvaluator for Scripted {
        async fn evaluate(&self, request: &EvaluationRequest) -> Result<Reaction, EvaluationError> {
            Ok(reaction(&request.listener_id, self.0, self.1))
        }
    }

    struct Broken;

    #[async_trait]
    impl ReactionEvaluator for Broken {
        async fn evaluate(&self, _: &EvaluationRequest) -> Result<Reaction, EvaluationError> {
            Err(EvaluationError::Failed("no model".into()))
        }
    }

    fn speech() -> CompletedSpeech {
        CompletedSpeech {
            session_id: "s1".into(),
            topic: "tidal power".into(),
            participants: vec!["sage".into(), "spark".into(), "flint".into()],
            speaker_id: "sage".into(),
            seq: 1,
            text: "Consider the tides.".into(),
            emotion: None,
        }
    }

    #[test]
    fn test_select_responder_filters_and_ranks() {
        let reactions = vec![
            reaction("spark", 0.95, false),
            reaction("flint", 0.7, true),
            reaction("echo", 0.9, true),
            reaction("mote", 0.6, true),
        ];
        let winner = select_responder(&reactions, 0.6).unwrap();
        assert_eq!(winner.listener_id, "echo");
    }

    #[test]
    fn test_select_responder_first_wins_ties() {
        let reactions = vec![
            reaction("spark", 0.8, true),
            reaction("flint", 0.8, true),
        ];
        assert_eq!(select_responder(&reactions, 0.6).unwrap().listener_id, "spark");
        assert!(select_responder(&[], 0.6).is_none());
    }

    #[tokio::test]
    async fn test_evaluates_every_listener_but_speaker() {
        let registry = EvaluatorRegistry::new(Arc::new(Scripted(0.4, false)))
            .with_agent("flint", Arc::new(Scripted(0.9, true)));
        let aggregator = ReactionAggregator::new(registry);

        let reactions = aggregator
            .evaluate_listeners(&speech(), Duration::from_secs(5))
            .await;

        let listeners: Vec<&str> = reactions.iter().map(|r| r.listener_id.as_str()).collect();
        assert_eq!(listeners, vec!["spark", "flint"]);
        assert_eq!(
            select_responder(&reactions, 0.6).unwrap().listener_id,
            "flint"
        );
    }

    #[tokio::test]
    async fn test_failing_evaluators_yield_no_responder() {
        let aggregator = ReactionAggregator::new(EvaluatorRegistry::new(Arc::new(Broken)));
        let reactions = aggregator
            .evaluate_listeners(&speech(), Duration::from_secs(5))
            .await;
        assert_eq!(reactions.len(), 2);
        assert!(reactions.iter().all(|r| r.fallback && !r.should_respond));
        assert!(select_responder(&reactions, 0.6).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_window() {
        let aggregator =
            ReactionAggregator::new(EvaluatorRegistry::new(Arc::new(Broken))).with_seed(9);
        let now = Instant::now();
        let cooldown = Duration::from_secs(12);

        assert!(aggregator
            .cooldown_remaining("s1", "spark", now, cooldown)
            .is_none());

        aggregator.record_cooldown("s1", "spark", now);
        assert_eq!(
            aggregator.cooldown_remaining("s1", "spark", now + Duration::from_secs(5), cooldown),
            Some(Duration::from_secs(7))
        );
        assert!(aggregator
            .cooldown_remaining("s2", "spark", now, cooldown)
            .is_none());
        assert!(aggregator
            .cooldown_remaining("s1", "spark", now + cooldown, cooldown)
            .is_none());

        aggregator.forget_session("s1");
        assert!(aggregator
            .cooldown_remaining("s1", "spark", now, cooldown)
            .is_none());
    }

    #[test]
    fn test_delay_within_bounds() {
        let aggregator =
            ReactionAggregator::new(EvaluatorRegistry::new(Arc::new(Broken))).with_seed(3);
        let config = TurnConfig::default();
        for _ in 0..200 {
            let delay = aggregator.draw_delay(&config);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(15));
        }
    }
}
