//! Turn coordinator: starts, tracks and stops sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::actor::{SessionActor, SessionServices};
use super::handle::SessionHandle;
use crate::config::TurnConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, TurnEvent};
use crate::gate::{RequestGate, SharedRequestGate};
use crate::gateway::SharedGateway;
use crate::reaction::{EvaluatorRegistry, ReactionAggregator};
use crate::session::{AgentId, Session, SessionId};

/// Command channel depth per session
const COMMAND_CAPACITY: usize = 64;

/// Everything needed to start one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: Option<SessionId>,
    pub participants: Vec<AgentId>,
    pub topic: String,
    /// Overrides the coordinator default.
    pub config: Option<TurnConfig>,
    /// Queued ahead of heuristic selection so it speaks first.
    pub opening_speaker: Option<AgentId>,
}

impl SessionRequest {
    pub fn new(participants: Vec<AgentId>, topic: impl Into<String>) -> Self {
        Self {
            session_id: None,
            participants,
            topic: topic.into(),
            config: None,
            opening_speaker: None,
        }
    }

    pub fn with_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_config(mut self, config: TurnConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn opening_speaker(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.opening_speaker = Some(agent_id.into());
        self
    }
}

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Owns the shared collaborators and the running sessions.
///
/// One gateway, one request gate, one reaction aggregator and one event bus
/// serve every session; each session gets its own actor task.
pub struct TurnCoordinator {
    services: SessionServices,
    default_config: TurnConfig,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

/// Shared reference to a coordinator
pub type SharedTurnCoordinator = Arc<TurnCoordinator>;

impl TurnCoordinator {
    pub fn new(
        gateway: SharedGateway,
        evaluators: EvaluatorRegistry,
        default_config: TurnConfig,
    ) -> Self {
        let aggregator = match default_config.seed {
            Some(seed) => ReactionAggregator::new(evaluators).with_seed(seed),
            None => ReactionAggregator::new(evaluators),
        };
        Self {
            services: SessionServices {
                gateway,
                gate: RequestGate::default().shared(),
                aggregator: Arc::new(aggregator),
                bus: EventBus::new().shared(),
            },
            default_config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Share a request gate with other coordinators.
    pub fn with_gate(mut self, gate: SharedRequestGate) -> Self {
        self.services.gate = gate;
        self
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.services.bus = bus;
        self
    }

    pub fn shared(self) -> SharedTurnCoordinator {
        Arc::new(self)
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.services.bus
    }

    pub fn aggregator(&self) -> &Arc<ReactionAggregator> {
        &self.services.aggregator
    }

    pub fn gate(&self) -> &SharedRequestGate {
        &self.services.gate
    }

    pub fn default_config(&self) -> &TurnConfig {
        &self.default_config
    }

    /// Validate, activate and start ticking a new session.
    pub fn start_session(&self, request: SessionRequest) -> CoordinationResult<SessionHandle> {
        let config = request
            .config
            .unwrap_or_else(|| self.default_config.clone());
        config.validate()?;

        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut session = Session::new(session_id.clone(), request.participants, request.topic)?;
        if let Some(opening) = &request.opening_speaker {
            session.enqueue_turn(opening, true)?;
        }

        let mut sessions = self.lock_sessions();
        sessions.retain(|_, entry| !entry.task.is_finished());
        if sessions.contains_key(&session_id) {
            return Err(CoordinationError::SessionAlreadyActive(session_id));
        }

        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SessionHandle::new(
            session_id.clone(),
            Arc::clone(&config),
            commands_tx,
            cancel.clone(),
        );
        let actor = SessionActor::new(
            session,
            config,
            self.services.clone(),
            handle.clone(),
            commands_rx,
            cancel,
        );

        let span = tracing::info_span!("session", session_id = %session_id);
        let task = tokio::spawn(actor.run().instrument(span));
        info!(session_id = %session_id, "Session spawned");

        sessions.insert(
            session_id,
            SessionEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Stop a session and wait for its actor to exit.
    pub async fn stop_session(&self, session_id: &str) -> CoordinationResult<()> {
        let entry = self
            .lock_sessions()
            .remove(session_id)
            .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;

        entry.handle.stop();
        if let Err(e) = entry.task.await {
            warn!(session_id, "Session task did not exit cleanly: {}", e);
        }
        Ok(())
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let entries: Vec<SessionEntry> = self.lock_sessions().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.handle.stop();
        }
        for entry in entries {
            let _ = entry.task.await;
        }
    }

    /// Handle to a running session.
    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.lock_sessions()
            .get(session_id)
            .filter(|entry| !entry.task.is_finished())
            .map(|entry| entry.handle.clone())
    }

    pub fn active_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .lock_sessions()
            .iter()
            .filter(|(_, entry)| !entry.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.services.bus.subscribe()
    }

    /// Finalized utterances, optionally for one session only.
    pub fn utterances(&self, session_id: Option<&str>) -> FilteredReceiver {
        let mut filter = EventFilter::new().types(vec!["utterance_finalized"]);
        if let Some(session_id) = session_id {
            filter = filter.session(session_id);
        }
        self.services.bus.subscribe_filtered(filter)
    }

    pub fn session_endings(&self) -> FilteredReceiver {
        self.services
            .bus
            .subscribe_filtered(EventFilter::new().types(vec!["session_ended"]))
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}
