//! Broadcast bus carrying [`TurnEvent`]s out of the session actors.
//!
//! Publishing never blocks a session: with no subscribers the event is
//! dropped, and a subscriber that falls behind by more than the channel
//! capacity sees `RecvError::Lagged` and skips ahead.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

use super::types::TurnEvent;

const DEFAULT_CAPACITY: usize = 256;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<TurnEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: TurnEvent) -> usize {
        let event_type = event.event_type();
        let reached = self.sender.send(event).unwrap_or(0);
        trace!(event_type, reached, "Turn event published");
        reached
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events `filter` lets through.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrows a subscription. Unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<String>,
    /// Events that carry no agent never match an agent filter.
    pub agent_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(self, session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..self
        }
    }

    pub fn agent(self, agent_id: &str) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            ..self
        }
    }

    /// Only these event types (as reported by [`TurnEvent::event_type`]).
    pub fn types(self, event_types: Vec<&str>) -> Self {
        Self {
            event_types: Some(event_types.iter().map(|t| t.to_string()).collect()),
            ..self
        }
    }

    pub fn matches(&self, event: &TurnEvent) -> bool {
        let session_ok = self
            .session_id
            .as_deref()
            .map_or(true, |sid| event.session_id() == sid);
        let agent_ok = self
            .agent_id
            .as_deref()
            .map_or(true, |aid| event.agent_id() == Some(aid));
        let type_ok = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == event.event_type()));
        session_ok && agent_ok && type_ok
    }
}

/// A subscription that skips events its filter rejects.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<TurnEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub async fn recv(&mut self) -> Result<TurnEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
