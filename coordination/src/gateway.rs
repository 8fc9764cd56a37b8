//! Generation gateway seam.
//!
//! The coordinator never produces text itself. It hands a
//! [`GenerationRequest`] to a [`GenerationGateway`] and gets back an
//! [`Utterance`] with the text, an emotion tag and an estimated speaking time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reaction::Reaction;
use crate::session::{AgentId, SessionId, TriggerKind};

/// Input to one generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub topic: String,
    pub trigger: TriggerKind,
    /// Recent finalized utterances, oldest first, as `agent: text`.
    pub context: Vec<String>,
    /// The reaction that won the floor, for reactive turns.
    pub reaction: Option<Reaction>,
}

/// A produced utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub emotion: Option<String>,
    /// How long speaking it is expected to take.
    pub duration: Duration,
}

impl Utterance {
    pub fn new(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            text: text.into(),
            emotion: None,
            duration,
        }
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Generation request failed: {0}")]
    RequestFailed(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation returned an empty utterance")]
    EmptyUtterance,
}

/// Produces utterances for agents.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Utterance, GatewayError>;
}

/// Shared reference to a generation gateway
pub type SharedGateway = Arc<dyn GenerationGateway>;
