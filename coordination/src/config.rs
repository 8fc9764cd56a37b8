//! Turn-taking configuration.
//!
//! Every timing constant the scheduler, aggregator and gate use lives here so a
//! deployment can tune pacing without touching code. Values load from TOML
//! (all fields optional) and can be overridden from `ROUNDTABLE_*` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};
use crate::session::SessionLimits;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ROUNDTABLE_";

/// Pacing and threshold settings for one conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Period of the scheduler tick.
    pub tick_interval_ms: u64,
    /// How long a finished speech keeps the floor after its end time.
    pub settle_buffer_ms: u64,
    /// Lower bound of the silence gap before an autonomous turn.
    pub min_silence_ms: u64,
    /// Upper bound of the silence gap before an autonomous turn.
    pub max_silence_ms: u64,
    /// Autonomous turns back off this long after a reactive trigger fires.
    pub reactive_cooldown_ms: u64,
    /// Minimum quiet time after a speech before a reactive trigger is accepted.
    pub reactive_grace_ms: u64,
    pub reactive_delay_min_ms: u64,
    pub reactive_delay_max_ms: u64,
    /// Per-agent gap between reactive triggers scheduled for the same agent.
    pub agent_cooldown_ms: u64,
    /// Engagement a reaction must exceed to qualify as a responder.
    pub engagement_threshold: f64,
    pub evaluation_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    /// Provisional speaking window held while an utterance is generated.
    pub placeholder_duration_ms: u64,
    /// Number of recent speeches the speaker selector balances over.
    pub recent_window: usize,
    /// Number of finalized utterances passed to the generation gateway.
    pub context_window: usize,
    pub limits: SessionLimits,
    /// Fixed RNG seed for reproducible speaker selection and delays.
    pub seed: Option<u64>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            settle_buffer_ms: 2_000,
            min_silence_ms: 10_000,
            max_silence_ms: 20_000,
            reactive_cooldown_ms: 30_000,
            reactive_grace_ms: 1_000,
            reactive_delay_min_ms: 8_000,
            reactive_delay_max_ms: 15_000,
            agent_cooldown_ms: 12_000,
            engagement_threshold: 0.6,
            evaluation_timeout_ms: 5_000,
            generation_timeout_ms: 60_000,
            placeholder_duration_ms: 5_000,
            recent_window: 3,
            context_window: 6,
            limits: SessionLimits::default(),
            seed: None,
        }
    }
}

impl TurnConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(raw: &str) -> CoordinationResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> CoordinationResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overlaid with `ROUNDTABLE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay values from an arbitrary lookup (environment, test map).
    ///
    /// Unparseable values are ignored and keep the current setting.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Option<u64> {
            lookup(&format!("{ENV_PREFIX}{key}")).and_then(|v| v.trim().parse::<u64>().ok())
        };

        if let Some(v) = read("TICK_INTERVAL_MS") {
            self.tick_interval_ms = v;
        }
        if let Some(v) = read("SETTLE_BUFFER_MS") {
            self.settle_buffer_ms = v;
        }
        if let Some(v) = read("MIN_SILENCE_MS") {
            self.min_silence_ms = v;
        }
        if let Some(v) = read("MAX_SILENCE_MS") {
            self.max_silence_ms = v;
        }
        if let Some(v) = read("REACTIVE_COOLDOWN_MS") {
            self.reactive_cooldown_ms = v;
        }
        if let Some(v) = read("REACTIVE_DELAY_MIN_MS") {
            self.reactive_delay_min_ms = v;
        }
        if let Some(v) = read("REACTIVE_DELAY_MAX_MS") {
            self.reactive_delay_max_ms = v;
        }
        if let Some(v) = read("AGENT_COOLDOWN_MS") {
            self.agent_cooldown_ms = v;
        }
        if let Some(v) = read("MAX_ROUNDS") {
            self.limits.max_rounds = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = read("MAX_TOTAL_SPEECHES") {
            self.limits.max_total_speeches = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = read("MAX_DURATION_SECS") {
            self.limits.max_duration_secs = v;
        }
        if let Some(v) = read("SEED") {
            self.seed = Some(v);
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> CoordinationResult<()> {
        let invalid = |msg: String| Err(CoordinationError::InvalidConfig(msg));

        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be greater than zero".into());
        }
        if self.min_silence_ms > self.max_silence_ms {
            return invalid(format!(
                "min_silence_ms ({}) exceeds max_silence_ms ({})",
                self.min_silence_ms, self.max_silence_ms
            ));
        }
        if self.reactive_delay_min_ms > self.reactive_delay_max_ms {
            return invalid(format!(
                "reactive_delay_min_ms ({}) exceeds reactive_delay_max_ms ({})",
                self.reactive_delay_min_ms, self.reactive_delay_max_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.engagement_threshold) {
            return invalid(format!(
                "engagement_threshold must be within [0, 1], got {}",
                self.engagement_threshold
            ));
        }
        if self.recent_window == 0 {
            return invalid("recent_window must be at least 1".into());
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn settle_buffer(&self) -> Duration {
        Duration::from_millis(self.settle_buffer_ms)
    }

    pub fn reactive_cooldown(&self) -> Duration {
        Duration::from_millis(self.reactive_cooldown_ms)
    }

    pub fn reactive_grace(&self) -> Duration {
        Duration::from_millis(self.reactive_grace_ms)
    }

    pub fn agent_cooldown(&self) -> Duration {
        Duration::from_millis(self.agent_cooldown_ms)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn placeholder_duration(&self) -> Duration {
        Duration::from_millis(self.placeholder_duration_ms)
    }

    /// Inclusive silence bounds in milliseconds.
    pub fn silence_range_ms(&self) -> (u64, u64) {
        (self.min_silence_ms, self.max_silence_ms)
    }

    /// Inclusive reactive delay bounds in milliseconds.
    pub fn reactive_delay_range_ms(&self) -> (u64, u64) {
        (self.reactive_delay_min_ms, self.reactive_delay_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_pacing() {
        let config = TurnConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.settle_buffer(), Duration::from_secs(2));
        assert_eq!(config.silence_range_ms(), (10_000, 20_000));
        assert_eq!(config.reactive_cooldown(), Duration::from_secs(30));
        assert_eq!(config.reactive_delay_range_ms(), (8_000, 15_000));
        assert_eq!(config.agent_cooldown(), Duration::from_secs(12));
        assert_eq!(config.evaluation_timeout(), Duration::from_secs(5));
        assert_eq!(config.limits.max_rounds, 20);
        assert_eq!(config.limits.max_total_speeches, 50);
        assert_eq!(config.limits.max_duration_secs, 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TurnConfig::from_toml_str(
            r#"
            min_silence_ms = 1000
            max_silence_ms = 2000
            seed = 7

            [limits]
            max_rounds = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.silence_range_ms(), (1000, 2000));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.limits.max_rounds, 3);
        assert_eq!(config.limits.max_total_speeches, 50);
        assert_eq!(config.tick_interval_ms, 2_000);
    }

    #[test]
    fn test_inverted_ranges_rejected() {
        let err = TurnConfig::from_toml_str("min_silence_ms = 30000").unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidConfig(_)));

        let config = TurnConfig {
            reactive_delay_min_ms: 20_000,
            ..TurnConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TurnConfig {
            engagement_threshold: 1.5,
            ..TurnConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = TurnConfig::from_toml_str("tick_interval_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, CoordinationError::ConfigParse(_)));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<String, String> = [
            ("ROUNDTABLE_MAX_ROUNDS", "5"),
            ("ROUNDTABLE_MIN_SILENCE_MS", "500"),
            ("ROUNDTABLE_SEED", "42"),
            ("ROUNDTABLE_AGENT_COOLDOWN_MS", "not-a-number"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = TurnConfig::default();
        config.apply_overrides(|name| vars.get(name).cloned());

        assert_eq!(config.limits.max_rounds, 5);
        assert_eq!(config.min_silence_ms, 500);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.agent_cooldown_ms, 12_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tick_interval_ms = 500").unwrap();

        let config = TurnConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(500));

        let missing = TurnConfig::from_file("/nonexistent/turns.toml").unwrap_err();
        assert!(matches!(missing, CoordinationError::Io(_)));
    }
}
