//! Autonomous speaker selection.
//!
//! A heuristic, not a fairness guarantee: never the agent who spoke last,
//! prefer whoever spoke least in the recent window, break ties at random.

use std::collections::HashMap;

use rand::Rng;

use super::state::{AgentId, SpeechEvent};

#[derive(Debug, Clone, Copy)]
pub struct SpeakerSelector {
    recent_window: usize,
}

impl SpeakerSelector {
    pub fn new(recent_window: usize) -> Self {
        Self {
            recent_window: recent_window.max(1),
        }
    }

    /// Pick the next autonomous speaker. `None` only when there are no participants.
    pub fn select<R: Rng>(
        &self,
        participants: &[AgentId],
        history: &[SpeechEvent],
        rng: &mut R,
    ) -> Option<AgentId> {
        let last = history.last().map(|e| e.agent_id.as_str());
        let mut candidates: Vec<&AgentId> = participants
            .iter()
            .filter(|p| Some(p.as_str()) != last)
            .collect();
        if candidates.is_empty() {
            candidates = participants.iter().collect();
        }
        if candidates.is_empty() {
            return None;
        }

        let start = history.len().saturating_sub(self.recent_window);
        let mut recent: HashMap<&str, usize> = HashMap::new();
        for event in &history[start..] {
            *recent.entry(event.agent_id.as_str()).or_default() += 1;
        }

        let count = |agent: &str| recent.get(agent).copied().unwrap_or(0);
        let fewest = candidates
            .iter()
            .map(|a| count(a.as_str()))
            .min()
            .unwrap_or(0);
        let tied: Vec<&AgentId> = candidates
            .into_iter()
            .filter(|a| count(a.as_str()) == fewest)
            .collect();

        let pick = rng.random_range(0..tied.len());
        Some(tied[pick].clone())
    }
}

impl Default for SpeakerSelector {
    fn default() -> Self {
        Self::new(3)
    }
}
