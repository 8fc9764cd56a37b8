//! Roundtable: a runnable conversation stage on top of `turn-coordination`.
//!
//! A stage is a TOML file naming the personas, the topic and the generation
//! backend. [`Stage`] turns it into a running session; [`transcript::follow`]
//! prints what happens.

pub mod config;
pub mod gateway;
pub mod stage;
pub mod transcript;

pub use config::{GatewayConfig, PersonaConfig, SessionSection, StageConfig, StageError};
pub use gateway::{HttpGateway, ScriptedGateway};
pub use stage::Stage;
pub use transcript::{follow, format_event, TranscriptSummary};
