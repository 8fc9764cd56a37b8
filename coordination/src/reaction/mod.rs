//! Peer reactions: scoring a finished utterance from every listener's point
//! of view and turning the most engaged "I want to respond" into a delayed,
//! re-validated bid for the floor.
//!
//! # Flow
//!
//! ```text
//! finished utterance
//!        │
//!        ▼
//! ┌──────────────┐  one per listener, in parallel   ┌──────────────────┐
//! │  Aggregator  │─────────────────────────────────▶│ ReactionEvaluator│
//! └──────┬───────┘◀──── Reaction (or neutral) ──────└──────────────────┘
//!        │ winner passes threshold, floor free, agent not cooling down
//!        ▼
//! PendingTrigger ── sleep 8–15s ──▶ session re-validates ──▶ speech
//! ```

pub mod aggregator;
pub mod evaluator;
pub mod persona;
pub mod types;

pub use aggregator::{
    select_responder, AggregationOutcome, CompletedSpeech, ReactionAggregator, ReactionPass,
};
pub use evaluator::{
    evaluate_or_neutral, EvaluationError, EvaluationRequest, EvaluatorRegistry,
    ReactionEvaluator, SharedEvaluator,
};
pub use persona::{MoodTable, PersonaEvaluator, PersonaProfile};
pub use types::{Reaction, ReactionScores};
