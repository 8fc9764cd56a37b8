//! Stage configuration: who is on stage, what they talk about, how they
//! generate text. Loaded from TOML; turn timings reuse [`TurnConfig`].

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use turn_coordination::{CoordinationError, PersonaProfile, TurnConfig};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to read stage config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse stage config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid stage config: {0}")]
    Invalid(String),

    #[error("Gateway setup failed: {0}")]
    Gateway(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Top-level stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub session: SessionSection,
    pub turns: TurnConfig,
    pub personas: Vec<PersonaConfig>,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Generated when absent.
    pub id: Option<String>,
    pub topic: String,
    /// Defaults to every persona, in declaration order.
    pub participants: Vec<String>,
    pub opening_speaker: Option<String>,
}

/// One character on stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    /// Built-in persona profile name (`ethicist`, `visionary`, `skeptic`).
    pub profile: String,
    /// Scripted lines; `{topic}` is replaced with the session topic.
    #[serde(default)]
    pub lines: Vec<String>,
}

impl PersonaConfig {
    pub fn new(id: &str, profile: &str) -> Self {
        Self {
            id: id.to_string(),
            profile: profile.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn resolve_profile(&self) -> Result<PersonaProfile, StageError> {
        PersonaProfile::builtin(&self.profile).ok_or_else(|| {
            StageError::Invalid(format!(
                "persona `{}` uses unknown profile `{}` (known: {})",
                self.id,
                self.profile,
                PersonaProfile::builtin_names().join(", ")
            ))
        })
    }
}

/// Where utterance text comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayConfig {
    /// Canned lines with simulated think time. Needs no network.
    Scripted {
        #[serde(default = "default_think_min_ms")]
        think_time_min_ms: u64,
        #[serde(default = "default_think_max_ms")]
        think_time_max_ms: u64,
    },
    /// An OpenAI-compatible chat completions endpoint.
    Http {
        /// Base URL, e.g. `http://localhost:8000/v1`.
        url: String,
        model: String,
        /// Name of the environment variable holding the API key.
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
}

fn default_think_min_ms() -> u64 {
    500
}

fn default_think_max_ms() -> u64 {
    2_000
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    200
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::Scripted {
            think_time_min_ms: default_think_min_ms(),
            think_time_max_ms: default_think_max_ms(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            session: SessionSection {
                topic: "whether cities should be rebuilt around walking".to_string(),
                ..SessionSection::default()
            },
            turns: TurnConfig::default(),
            personas: vec![
                PersonaConfig::new("sage", "ethicist"),
                PersonaConfig::new("spark", "visionary"),
                PersonaConfig::new("flint", "skeptic"),
            ],
            gateway: GatewayConfig::default(),
        }
    }
}

impl StageConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, StageError> {
        let config: Self = toml::from_str(raw)?;
        Ok(config)
    }

    /// Load from a file, then overlay `ROUNDTABLE_*` turn overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StageError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.turns.apply_env();
        Ok(config)
    }

    /// Defaults plus `ROUNDTABLE_*` turn overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.turns.apply_env();
        config
    }

    /// Session participants: the explicit list, or every persona.
    pub fn participants(&self) -> Vec<String> {
        if self.session.participants.is_empty() {
            self.personas.iter().map(|p| p.id.clone()).collect()
        } else {
            self.session.participants.clone()
        }
    }

    pub fn persona(&self, id: &str) -> Option<&PersonaConfig> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn validate(&self) -> Result<(), StageError> {
        self.turns.validate()?;

        if self.session.topic.trim().is_empty() {
            return Err(StageError::Invalid("session topic is empty".into()));
        }

        let mut ids = HashSet::new();
        for persona in &self.personas {
            if !ids.insert(persona.id.as_str()) {
                return Err(StageError::Invalid(format!(
                    "persona `{}` is declared twice",
                    persona.id
                )));
            }
            persona.resolve_profile()?;
        }

        let participants = self.participants();
        if participants.len() < 2 {
            return Err(StageError::Invalid(
                "a stage needs at least two participants".into(),
            ));
        }
        if let Some(missing) = participants.iter().find(|p| self.persona(p).is_none()) {
            return Err(StageError::Invalid(format!(
                "participant `{missing}` has no persona"
            )));
        }
        if let Some(opening) = &self.session.opening_speaker {
            if !participants.contains(opening) {
                return Err(StageError::Invalid(format!(
                    "opening speaker `{opening}` is not a participant"
                )));
            }
        }

        if let GatewayConfig::Scripted {
            think_time_min_ms,
            think_time_max_ms,
        } = &self.gateway
        {
            if think_time_min_ms > think_time_max_ms {
                return Err(StageError::Invalid(format!(
                    "think_time_min_ms ({think_time_min_ms}) exceeds think_time_max_ms ({think_time_max_ms})"
                )));
            }
        }
        Ok(())
    }
}
