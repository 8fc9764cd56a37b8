//! Wires a [`StageConfig`] into a running coordinator.

use std::sync::Arc;

use tracing::info;
use turn_coordination::{
    EvaluatorRegistry, PersonaEvaluator, PersonaProfile, SessionHandle, SessionRequest,
    SharedGateway, SharedTurnCoordinator, TurnCoordinator,
};

use crate::config::{GatewayConfig, StageConfig, StageError};
use crate::gateway::{HttpGateway, ScriptedGateway};

/// A configured coordinator plus the session it will run.
pub struct Stage {
    coordinator: SharedTurnCoordinator,
    request: SessionRequest,
}

impl Stage {
    pub fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        config.validate()?;
        Self::with_gateway(config, build_gateway(config)?)
    }

    /// Use `gateway` instead of the one the config names.
    pub fn with_gateway(config: &StageConfig, gateway: SharedGateway) -> Result<Self, StageError> {
        config.validate()?;

        // Every participant has a persona, so the default only covers strays
        let mut evaluators =
            EvaluatorRegistry::new(Arc::new(PersonaEvaluator::new(PersonaProfile::ethicist())));
        for persona in &config.personas {
            let profile = persona.resolve_profile()?;
            evaluators.insert(persona.id.clone(), Arc::new(PersonaEvaluator::new(profile)));
        }

        let coordinator =
            TurnCoordinator::new(gateway, evaluators, config.turns.clone()).shared();

        let mut request = SessionRequest::new(config.participants(), config.session.topic.clone());
        if let Some(id) = &config.session.id {
            request = request.with_id(id.clone());
        }
        if let Some(opening) = &config.session.opening_speaker {
            request = request.opening_speaker(opening.clone());
        }

        Ok(Self {
            coordinator,
            request,
        })
    }

    pub fn coordinator(&self) -> &SharedTurnCoordinator {
        &self.coordinator
    }

    pub fn request(&self) -> &SessionRequest {
        &self.request
    }

    pub fn start(&self) -> Result<SessionHandle, StageError> {
        let handle = self.coordinator.start_session(self.request.clone())?;
        info!(
            session_id = %handle.session_id(),
            participants = ?self.request.participants,
            "Stage is live"
        );
        Ok(handle)
    }
}

fn build_gateway(config: &StageConfig) -> Result<SharedGateway, StageError> {
    match &config.gateway {
        GatewayConfig::Scripted { .. } => Ok(Arc::new(ScriptedGateway::from_config(config))),
        GatewayConfig::Http { url, model, .. } => {
            info!(url = %url, model = %model, "Using HTTP generation gateway");
            Ok(Arc::new(HttpGateway::from_config(config)?))
        }
    }
}
