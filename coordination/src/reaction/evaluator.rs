//! Reaction evaluator seam and the neutral fallback wrapper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::types::Reaction;
use crate::session::{AgentId, SessionId};

/// One listener's view of one utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub session_id: SessionId,
    pub listener_id: AgentId,
    pub speaker_id: AgentId,
    pub topic: String,
    pub text: String,
    pub emotion: Option<String>,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Evaluation failed: {0}")]
    Failed(String),

    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),
}

/// Scores an utterance from a listener's perspective.
///
/// Implementations are stateless per call. They own the `should_respond`
/// decision; the aggregator only applies the engagement threshold on top.
#[async_trait]
pub trait ReactionEvaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Reaction, EvaluationError>;
}

/// Shared reference to an evaluator
pub type SharedEvaluator = Arc<dyn ReactionEvaluator>;

/// Run `evaluator` under `timeout`, substituting the neutral reaction on any failure.
///
/// The returned reaction always names the request's listener and speaker and
/// carries scores clamped into [0, 1].
pub async fn evaluate_or_neutral(
    evaluator: &dyn ReactionEvaluator,
    request: &EvaluationRequest,
    timeout: Duration,
) -> Reaction {
    let outcome = match tokio::time::timeout(timeout, evaluator.evaluate(request)).await {
        Ok(result) => result,
        Err(_) => Err(EvaluationError::Timeout(timeout)),
    };

    match outcome {
        Ok(mut reaction) => {
            reaction.listener_id = request.listener_id.clone();
            reaction.speaker_id = request.speaker_id.clone();
            reaction.scores = reaction.scores.clamped();
            reaction
        }
        Err(e) => {
            warn!(
                session_id = %request.session_id,
                listener_id = %request.listener_id,
                speaker_id = %request.speaker_id,
                "Reaction evaluation fell back to neutral: {}",
                e
            );
            Reaction::neutral(request.listener_id.clone(), request.speaker_id.clone())
        }
    }
}

/// Evaluators by agent, with a default for agents without their own.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    default: SharedEvaluator,
    per_agent: HashMap<AgentId, SharedEvaluator>,
}

impl EvaluatorRegistry {
    pub fn new(default: SharedEvaluator) -> Self {
        Self {
            default,
            per_agent: HashMap::new(),
        }
    }

    /// Register an evaluator for one agent.
    pub fn with_agent(mut self, agent_id: impl Into<AgentId>, evaluator: SharedEvaluator) -> Self {
        self.per_agent.insert(agent_id.into(), evaluator);
        self
    }

    pub fn insert(&mut self, agent_id: impl Into<AgentId>, evaluator: SharedEvaluator) {
        self.per_agent.insert(agent_id.into(), evaluator);
    }

    pub fn for_agent(&self, agent_id: &str) -> SharedEvaluator {
        self.per_agent
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.per_agent.contains_key(agent_id)
    }
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<&AgentId> = self.per_agent.keys().collect();
        agents.sort();
        f.debug_struct("EvaluatorRegistry")
            .field("agents", &agents)
            .finish_non_exhaustive()
    }
}
