//! Turn coordination for multi-agent conversations
//!
//! Several conversational agents share one "floor". This library decides who
//! speaks next and when:
//!
//! - a periodic scheduler picks autonomous speakers after a randomized silence
//! - after every utterance each listener scores it, and the most engaged
//!   listener that wants to answer gets a delayed, re-validated reactive turn
//! - a request gate keeps one generation in flight per agent and rate-limits
//!   generation per agent
//! - lifetime limits end a session after enough rounds, speeches or time
//!
//! Utterance text comes from a [`GenerationGateway`]; listener scores come
//! from [`ReactionEvaluator`]s. Everything a session does is published on the
//! [`EventBus`](events::EventBus).
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = TurnCoordinator::new(gateway, evaluators, TurnConfig::default());
//! let handle = coordinator.start_session(
//!     SessionRequest::new(vec!["sage".into(), "spark".into()], "tidal power")
//!         .opening_speaker("sage"),
//! )?;
//!
//! let mut utterances = coordinator.utterances(Some(handle.session_id()));
//! while let Ok(event) = utterances.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod gateway;
pub mod reaction;
pub mod scheduler;
pub mod session;

pub use config::TurnConfig;
pub use error::{CoordinationError, CoordinationResult};
pub use events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, TurnEvent};
pub use gate::{GateRejection, GenerationPermit, RequestGate, SharedRequestGate};
pub use gateway::{GatewayError, GenerationGateway, GenerationRequest, SharedGateway, Utterance};
pub use reaction::{
    AggregationOutcome, EvaluationError, EvaluationRequest, EvaluatorRegistry, PersonaEvaluator,
    PersonaProfile, Reaction, ReactionAggregator, ReactionEvaluator, ReactionScores,
    SharedEvaluator,
};
pub use scheduler::{
    ClaimOutcome, DropReason, PendingTrigger, SessionHandle, SessionRequest,
    SharedTurnCoordinator, TurnCoordinator,
};
pub use session::{
    AgentId, EndReason, Session, SessionId, SessionLimits, SessionPhase, SessionSnapshot,
    TriggerKind, MAX_SPEECH_DURATION,
};
