//! Cloneable handle to a running session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::actor::SessionCommand;
use super::trigger::{ClaimOutcome, PendingTrigger};
use crate::config::TurnConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::gateway::{GatewayError, Utterance};
use crate::reaction::{Reaction, ReactionPass};
use crate::session::{SessionId, SessionSnapshot, SpeechRegistration};

/// Talks to one session's actor.
///
/// Every method is a message to the actor, so calls from different tasks are
/// serialized against the tick loop. Once the session has ended every call
/// returns `SessionNotFound`.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    config: Arc<TurnConfig>,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        config: Arc<TurnConfig>,
        commands: mpsc::Sender<SessionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            config,
            commands,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Whether stop was requested or the session ended on its own.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Stop the session. Idempotent; cancels the tick loop and every pending trigger.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the session has stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Report that `agent_id` started speaking `text` for `duration`.
    pub async fn register_speech_start(
        &self,
        agent_id: &str,
        text: impl Into<String>,
        duration: Duration,
    ) -> CoordinationResult<SpeechRegistration> {
        self.register_utterance(agent_id, Utterance::new(text, duration))
            .await
    }

    /// Like [`register_speech_start`](Self::register_speech_start), keeping the emotion tag.
    pub async fn register_utterance(
        &self,
        agent_id: &str,
        utterance: Utterance,
    ) -> CoordinationResult<SpeechRegistration> {
        self.request(|reply| SessionCommand::RegisterSpeechStart {
            agent_id: agent_id.to_string(),
            utterance,
            reply,
        })
        .await?
    }

    /// Record that a reactive trigger for `agent_id` fired.
    pub async fn notify_reactive_trigger(&self, agent_id: &str) -> CoordinationResult<()> {
        self.request(|reply| SessionCommand::NotifyReactiveTrigger {
            agent_id: agent_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn can_accept_reactive_trigger(&self) -> CoordinationResult<bool> {
        self.request(|reply| SessionCommand::CanAcceptReactive { reply })
            .await
    }

    /// Queue a turn for `agent_id`; served before heuristic selection.
    pub async fn request_turn(&self, agent_id: &str, priority: bool) -> CoordinationResult<()> {
        self.request(|reply| SessionCommand::RequestTurn {
            agent_id: agent_id.to_string(),
            priority,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> CoordinationResult<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub(crate) async fn schedule_reactive(
        &self,
        reaction: Reaction,
        delay: Duration,
    ) -> CoordinationResult<PendingTrigger> {
        self.request(|reply| SessionCommand::ScheduleReactive {
            reaction,
            delay,
            reply,
        })
        .await?
    }

    pub(crate) async fn claim_reactive(&self, trigger_id: &str) -> CoordinationResult<ClaimOutcome> {
        self.request(|reply| SessionCommand::ClaimReactive {
            trigger_id: trigger_id.to_string(),
            reply,
        })
        .await
    }

    pub(crate) async fn generation_finished(
        &self,
        agent_id: String,
        seq: u64,
        result: Result<Utterance, GatewayError>,
    ) {
        self.notify(SessionCommand::GenerationFinished {
            agent_id,
            seq,
            result,
        })
        .await;
    }

    pub(crate) async fn reaction_pass_finished(&self, seq: u64, pass: ReactionPass) {
        self.notify(SessionCommand::ReactionPassFinished { seq, pass })
            .await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> CoordinationResult<T> {
        if self.cancel.is_cancelled() {
            return Err(self.not_found());
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| self.not_found())?;
        response.await.map_err(|_| self.not_found())
    }

    /// Fire-and-forget; a stopped session simply never sees the message.
    async fn notify(&self, command: SessionCommand) {
        let _ = self.commands.send(command).await;
    }

    fn not_found(&self) -> CoordinationError {
        CoordinationError::SessionNotFound(self.session_id.clone())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
