//! Reaction record produced by one listener about one utterance.

use serde::{Deserialize, Serialize};

use crate::session::AgentId;

/// Four scores in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactionScores {
    pub engagement: f64,
    pub agreement: f64,
    pub intellectual_value: f64,
    pub originality: f64,
}

impl ReactionScores {
    pub fn neutral() -> Self {
        Self {
            engagement: 0.5,
            agreement: 0.5,
            intellectual_value: 0.5,
            originality: 0.5,
        }
    }

    /// Clamp every score into [0, 1]; NaN becomes 0.5.
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) };
        Self {
            engagement: clamp(self.engagement),
            agreement: clamp(self.agreement),
            intellectual_value: clamp(self.intellectual_value),
            originality: clamp(self.originality),
        }
    }
}

impl Default for ReactionScores {
    fn default() -> Self {
        Self::neutral()
    }
}

/// How `listener_id` reacted to `speaker_id`'s utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub listener_id: AgentId,
    pub speaker_id: AgentId,
    pub scores: ReactionScores,
    /// Whether the listener wants the floor.
    pub should_respond: bool,
    pub emotional_response: String,
    pub topic_shift: bool,
    pub style_shift: bool,
    pub justification: Option<String>,
    /// Produced by the timeout/error fallback rather than an evaluator.
    pub fallback: bool,
}

impl Reaction {
    /// The reaction substituted when an evaluator fails or times out.
    pub fn neutral(listener_id: impl Into<AgentId>, speaker_id: impl Into<AgentId>) -> Self {
        Self {
            listener_id: listener_id.into(),
            speaker_id: speaker_id.into(),
            scores: ReactionScores::neutral(),
            should_respond: false,
            emotional_response: "neutral".to_string(),
            topic_shift: false,
            style_shift: false,
            justification: None,
            fallback: true,
        }
    }

    pub fn engagement(&self) -> f64 {
        self.scores.engagement
    }

    /// Weighted overall quality of the utterance from this listener's view.
    pub fn quality_score(&self) -> f64 {
        let respond = if self.should_respond { 1.0 } else { 0.0 };
        self.scores.engagement * 0.3
            + self.scores.intellectual_value * 0.3
            + self.scores.originality * 0.2
            + respond * 0.2
    }

    /// Whether this reaction bids for the floor at `threshold` engagement.
    pub fn qualifies(&self, threshold: f64) -> bool {
        self.should_respond && self.scores.engagement > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(engagement: f64, should_respond: bool) -> Reaction {
        Reaction {
            scores: ReactionScores {
                engagement,
                ..ReactionScores::neutral()
            },
            should_respond,
            fallback: false,
            ..Reaction::neutral("spark", "sage")
        }
    }

    #[test]
    fn test_neutral_never_qualifies() {
        let neutral = Reaction::neutral("spark", "sage");
        assert!(neutral.fallback);
        assert!(!neutral.should_respond);
        assert_eq!(neutral.scores, ReactionScores::neutral());
        assert!(!neutral.qualifies(0.0));
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(reaction(0.61, true).qualifies(0.6));
        assert!(!reaction(0.6, true).qualifies(0.6));
        assert!(!reaction(0.9, false).qualifies(0.6));
    }

    #[test]
    fn test_quality_score_weights() {
        let r = Reaction {
            scores: ReactionScores {
                engagement: 1.0,
                agreement: 0.0,
                intellectual_value: 0.5,
                originality: 0.0,
            },
            ..reaction(1.0, true)
        };
        assert!((r.quality_score() - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_clamped() {
        let scores = ReactionScores {
            engagement: 1.7,
            agreement: -0.2,
            intellectual_value: f64::NAN,
            originality: 0.3,
        }
        .clamped();
        assert_eq!(scores.engagement, 1.0);
        assert_eq!(scores.agreement, 0.0);
        assert_eq!(scores.intellectual_value, 0.5);
        assert_eq!(scores.originality, 0.3);
    }
}
