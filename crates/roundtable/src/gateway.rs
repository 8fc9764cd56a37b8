//! Generation gateways for the stage.
//!
//! [`ScriptedGateway`] needs nothing but the config and is what the binary
//! runs by default. [`HttpGateway`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;
use turn_coordination::{
    AgentId, GatewayError, GenerationGateway, GenerationRequest, TriggerKind, Utterance,
};

use crate::config::{GatewayConfig, StageConfig, StageError};

const EMOTIONS: &[&str] = &["neutral", "happy", "thinking", "surprised", "mischievous"];

/// Speaking time estimate: 50 ms per character plus one to two seconds.
pub fn estimate_duration<R: Rng>(text: &str, rng: &mut R) -> Duration {
    let chars = text.chars().count() as f64;
    Duration::from_secs_f64(chars * 0.05 + rng.random_range(1.0..=2.0))
}

fn opening_phrases(profile: &str) -> &'static [&'static str] {
    match profile.to_ascii_lowercase().as_str() {
        "ethicist" => &[
            "Let me weigh this carefully.",
            "From a logical perspective,",
            "If we break this down systematically,",
        ],
        "visionary" => &[
            "Imagine if we could start over.",
            "What if we approached this differently?",
            "This opens up so many possibilities.",
        ],
        "skeptic" => &[
            "I'm not entirely convinced.",
            "Let's be realistic here.",
            "Have we considered the downsides?",
        ],
        _ => &[],
    }
}

fn default_lines(profile: &str) -> Vec<String> {
    let lines: &[&str] = match profile.to_ascii_lowercase().as_str() {
        "ethicist" => &[
            "Whoever pays the cost of {topic} deserves a say in it.",
            "The fair question about {topic} is who gets left behind.",
            "I think {topic} is only worth it if the benefits are shared.",
        ],
        "visionary" => &[
            "Picture {topic} ten years from now, it changes everything.",
            "The exciting part of {topic} is what it makes possible next.",
            "What if {topic} is the seed of something much bigger?",
        ],
        "skeptic" => &[
            "I want evidence before I believe the hype about {topic}.",
            "Most promises about {topic} quietly ignore the maintenance bill.",
            "Who actually measured whether {topic} works?",
        ],
        _ => &["I have a few thoughts on {topic}."],
    };
    lines.iter().map(|l| l.to_string()).collect()
}

struct ScriptedPersona {
    profile: String,
    lines: Vec<String>,
}

/// Produces canned lines with simulated think time.
pub struct ScriptedGateway {
    personas: HashMap<AgentId, ScriptedPersona>,
    think_time_ms: (u64, u64),
    rng: Mutex<StdRng>,
}

impl ScriptedGateway {
    pub fn from_config(config: &StageConfig) -> Self {
        let think_time_ms = match config.gateway {
            GatewayConfig::Scripted {
                think_time_min_ms,
                think_time_max_ms,
            } => (think_time_min_ms, think_time_max_ms),
            GatewayConfig::Http { .. } => (500, 2_000),
        };
        let personas = config
            .personas
            .iter()
            .map(|p| {
                let lines = if p.lines.is_empty() {
                    default_lines(&p.profile)
                } else {
                    p.lines.clone()
                };
                (
                    p.id.clone(),
                    ScriptedPersona {
                        profile: p.profile.clone(),
                        lines,
                    },
                )
            })
            .collect();
        let rng = match config.turns.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            personas,
            think_time_ms,
            rng: Mutex::new(rng),
        }
    }

    /// Compose the utterance and pick the think time. Holds the RNG lock only here.
    fn compose(&self, request: &GenerationRequest) -> Result<(Utterance, Duration), GatewayError> {
        let persona = self.personas.get(&request.agent_id).ok_or_else(|| {
            GatewayError::RequestFailed(format!("no script for `{}`", request.agent_id))
        })?;
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());

        let line = &persona.lines[rng.random_range(0..persona.lines.len())];
        let mut text = line.replace("{topic}", &request.topic);

        let openers = opening_phrases(&persona.profile);
        if !openers.is_empty() {
            let opener = openers[rng.random_range(0..openers.len())];
            text = format!("{opener} {text}");
        }
        if let (TriggerKind::Reactive, Some(reaction)) = (request.trigger, &request.reaction) {
            text = format!("{}, {}", reaction.speaker_id, lowercase_first(&text));
        }

        let emotion = EMOTIONS[rng.random_range(0..EMOTIONS.len())];
        let duration = estimate_duration(&text, &mut *rng);
        let (min, max) = self.think_time_ms;
        let think = Duration::from_millis(rng.random_range(min..=max));

        Ok((Utterance::new(text, duration).with_emotion(emotion), think))
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl GenerationGateway for ScriptedGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<Utterance, GatewayError> {
        let (utterance, think) = self.compose(request)?;
        tokio::time::sleep(think).await;
        Ok(utterance)
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Generates utterances through an OpenAI-compatible chat endpoint.
pub struct HttpGateway {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    /// Persona profile per agent, used for the system prompt.
    profiles: HashMap<AgentId, String>,
}

impl HttpGateway {
    pub fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        let GatewayConfig::Http {
            url,
            model,
            api_key_env,
            temperature,
            max_tokens,
        } = &config.gateway
        else {
            return Err(StageError::Gateway(
                "gateway kind is not `http`".to_string(),
            ));
        };

        let api_key = match api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                StageError::Gateway(format!("environment variable `{var}` is not set"))
            })?),
            None => None,
        };
        let http = reqwest::Client::builder()
            .timeout(config.turns.generation_timeout())
            .build()
            .map_err(|e| StageError::Gateway(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", url.trim_end_matches('/')),
            model: model.clone(),
            api_key,
            temperature: *temperature,
            max_tokens: *max_tokens,
            profiles: config
                .personas
                .iter()
                .map(|p| (p.id.clone(), p.profile.clone()))
                .collect(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// System prompt, then the recent conversation, then the instruction.
    pub fn build_messages(&self, request: &GenerationRequest) -> Vec<ChatMessage> {
        let profile = self
            .profiles
            .get(&request.agent_id)
            .map(String::as_str)
            .unwrap_or("thoughtful guest");
        let mut messages = vec![ChatMessage::new(
            "system",
            format!(
                "You are {}, a {} on a live panel discussing \"{}\". \
                 Speak in character, in two or three sentences, with no stage directions.",
                request.agent_id, profile, request.topic
            ),
        )];

        for line in &request.context {
            messages.push(ChatMessage::new("user", line.clone()));
        }

        let instruction = match (&request.trigger, &request.reaction) {
            (TriggerKind::Reactive, Some(reaction)) => format!(
                "{} just made a point that left you {}. Respond to it directly.",
                reaction.speaker_id, reaction.emotional_response
            ),
            _ if request.context.is_empty() => "Open the discussion.".to_string(),
            _ => "Continue the discussion with a fresh angle.".to_string(),
        };
        messages.push(ChatMessage::new("user", instruction));
        messages
    }
}

/// Roughly 2.5 spoken words per second, plus a breath.
pub fn estimate_spoken_duration(text: &str) -> Duration {
    let words = text.split_whitespace().count() as f64;
    Duration::from_secs_f64(words / 2.5 + 0.5)
}

fn parse_content(response: ChatResponse) -> Result<String, GatewayError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    let content = content.trim();
    if content.is_empty() {
        return Err(GatewayError::EmptyUtterance);
    }
    Ok(content.to_string())
}

#[async_trait]
impl GenerationGateway for HttpGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<Utterance, GatewayError> {
        let body = ChatRequest {
            model: &self.model,
            messages: self.build_messages(request),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::RequestFailed(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::RequestFailed(format!(
                "LLM API error ({}): {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::RequestFailed(format!("Failed to parse response: {}", e)))?;
        let text = parse_content(chat_response)?;
        debug!(agent_id = %request.agent_id, chars = text.len(), "Generated utterance");

        let duration = estimate_spoken_duration(&text);
        Ok(Utterance::new(text, duration))
    }
}
