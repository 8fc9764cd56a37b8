//! Rule-based reaction evaluator driven by persona keyword profiles.
//!
//! Each profile describes what a character finds engaging, what it agrees or
//! bristles at, and which phrases make it want to jump in. Scores start at
//! 0.5 and move by keyword hits. The evaluator is deterministic so a stage
//! built on it replays identically under a fixed seed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::evaluator::{EvaluationError, EvaluationRequest, ReactionEvaluator};
use super::types::{Reaction, ReactionScores};

/// Utterances longer than this read as substantive.
const LONG_FORM_CHARS: usize = 200;

/// Emotional tags a persona reports, picked by what the utterance did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodTable {
    pub calm: String,
    pub triggered: String,
    pub questioned: String,
    pub opposed: String,
}

/// Keyword profile for one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    /// +0.1 engagement per hit.
    pub interest_keywords: Vec<String>,
    /// +0.15 engagement if any hits; also marks a topic shift.
    pub focus_keywords: Vec<String>,
    /// Any hit makes the persona want the floor.
    pub trigger_keywords: Vec<String>,
    /// +0.1 agreement per hit.
    pub affirming_keywords: Vec<String>,
    /// -0.1 agreement per hit.
    pub opposing_keywords: Vec<String>,
    /// +0.05 intellectual value per hit.
    pub insight_keywords: Vec<String>,
    /// +0.1 originality per hit.
    pub novelty_keywords: Vec<String>,
    /// Speaker emotions this persona notices as a change of register.
    pub striking_emotions: Vec<String>,
    /// Questions raise engagement.
    pub drawn_to_questions: bool,
    pub moods: MoodTable,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl PersonaProfile {
    /// Careful, depth-seeking voice that weighs consequences.
    pub fn ethicist() -> Self {
        Self {
            name: "ethicist".into(),
            interest_keywords: words(&[
                "implications",
                "complex",
                "nuanced",
                "consider",
                "examine",
                "philosophical",
            ]),
            focus_keywords: words(&["ethical", "moral"]),
            trigger_keywords: words(&["ethical", "implications", "complex", "consider"]),
            affirming_keywords: words(&["careful", "consider", "balance", "responsib"]),
            opposing_keywords: words(&["impossible", "never work", "reckless"]),
            insight_keywords: words(&[
                "framework",
                "perspective",
                "fundamental",
                "inherent",
                "paradigm",
            ]),
            novelty_keywords: words(&["what if", "alternatively", "reframe"]),
            striking_emotions: words(&["mischievous", "excited"]),
            drawn_to_questions: true,
            moods: MoodTable {
                calm: "thoughtful".into(),
                triggered: "intrigued".into(),
                questioned: "curious".into(),
                opposed: "concerned".into(),
            },
        }
    }

    /// Enthusiastic voice chasing possibilities.
    pub fn visionary() -> Self {
        Self {
            name: "visionary".into(),
            interest_keywords: words(&[
                "imagine",
                "possibilities",
                "revolutionary",
                "incredible",
                "amazing",
            ]),
            focus_keywords: words(&["creative", "innovative"]),
            trigger_keywords: words(&["creative", "imagine", "possibilities"]),
            affirming_keywords: words(&["expand", "build", "combine", "opportunit"]),
            opposing_keywords: words(&["problem", "risk", "impossible", "unrealistic"]),
            insight_keywords: words(&["synthesis", "combine", "transform"]),
            novelty_keywords: words(&["innovative", "revolutionary", "breakthrough"]),
            striking_emotions: words(&["thinking", "skeptical"]),
            drawn_to_questions: true,
            moods: MoodTable {
                calm: "excited".into(),
                triggered: "inspired".into(),
                questioned: "curious".into(),
                opposed: "determined".into(),
            },
        }
    }

    /// Dry realist who pokes at claims.
    pub fn skeptic() -> Self {
        Self {
            name: "skeptic".into(),
            interest_keywords: words(&["realistic", "practical", "problem", "challenge", "difficult"]),
            focus_keywords: words(&["problem", "issue", "risk"]),
            trigger_keywords: words(&[
                "amazing",
                "incredible",
                "revolutionary",
                "unlimited",
                "solve everything",
            ]),
            affirming_keywords: words(&["careful", "practical", "realistic", "evidence"]),
            opposing_keywords: words(&["amazing", "incredible", "revolutionary", "unlimited"]),
            insight_keywords: words(&["evidence", "data", "cost", "tradeoff"]),
            novelty_keywords: words(&["nobody talks about", "obvious problem", "actually"]),
            striking_emotions: words(&["happy", "excited"]),
            drawn_to_questions: false,
            moods: MoodTable {
                calm: "unimpressed".into(),
                triggered: "skeptical".into(),
                questioned: "amused".into(),
                opposed: "skeptical".into(),
            },
        }
    }

    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ethicist" => Some(Self::ethicist()),
            "visionary" => Some(Self::visionary()),
            "skeptic" => Some(Self::skeptic()),
            _ => None,
        }
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["ethicist", "visionary", "skeptic"]
    }
}

fn hits(text: &str, keywords: &[String]) -> usize {
    keywords.iter().filter(|k| text.contains(k.as_str())).count()
}

/// Deterministic evaluator for one persona.
#[derive(Debug, Clone)]
pub struct PersonaEvaluator {
    profile: PersonaProfile,
}

impl PersonaEvaluator {
    pub fn new(profile: PersonaProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &PersonaProfile {
        &self.profile
    }

    /// Score an utterance synchronously.
    pub fn react(&self, request: &EvaluationRequest) -> Reaction {
        let p = &self.profile;
        let text = request.text.to_lowercase();
        let asks = text.contains('?');

        let interest = hits(&text, &p.interest_keywords);
        let focus = hits(&text, &p.focus_keywords);
        let triggers = hits(&text, &p.trigger_keywords);
        let affirms = hits(&text, &p.affirming_keywords);
        let opposes = hits(&text, &p.opposing_keywords);

        let mut engagement = 0.5 + 0.1 * interest as f64;
        if focus > 0 {
            engagement += 0.15;
        }
        if asks && p.drawn_to_questions {
            engagement += 0.1;
        }

        let agreement = 0.5 + 0.1 * affirms as f64 - 0.1 * opposes as f64;

        let mut intellectual_value = 0.5 + 0.05 * hits(&text, &p.insight_keywords) as f64;
        if text.chars().count() > LONG_FORM_CHARS {
            intellectual_value += 0.15;
        }

        let mut originality = 0.5 + 0.1 * hits(&text, &p.novelty_keywords) as f64;
        if text.contains("what if") {
            originality += 0.1;
        }

        let scores = ReactionScores {
            engagement,
            agreement,
            intellectual_value,
            originality,
        }
        .clamped();

        let should_respond = triggers > 0
            || (scores.engagement > 0.6 && (scores.agreement < 0.4 || scores.engagement > 0.8));

        let emotional_response = if opposes > 0 {
            &p.moods.opposed
        } else if triggers > 0 {
            &p.moods.triggered
        } else if asks {
            &p.moods.questioned
        } else {
            &p.moods.calm
        };

        let style_shift = request
            .emotion
            .as_deref()
            .is_some_and(|e| p.striking_emotions.iter().any(|s| s == e));

        let justification = should_respond.then(|| {
            format!(
                "{} engaged by {} keyword(s), {} trigger(s)",
                p.name,
                interest + focus,
                triggers
            )
        });

        Reaction {
            listener_id: request.listener_id.clone(),
            speaker_id: request.speaker_id.clone(),
            scores,
            should_respond,
            emotional_response: emotional_response.clone(),
            topic_shift: focus > 0,
            style_shift,
            justification,
            fallback: false,
        }
    }
}

#[async_trait]
impl ReactionEvaluator for PersonaEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Reaction, EvaluationError> {
        if request.text.trim().is_empty() {
            return Err(EvaluationError::Failed("empty utterance".into()));
        }
        Ok(self.react(request))
    }
}
