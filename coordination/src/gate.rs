//! Request deduplication and per-agent rate limiting.
//!
//! Every generation, whichever path triggered it, passes through a
//! [`RequestGate`] before the gateway is called. The gate tracks two things:
//!
//! - the set of `(session, agent)` pairs with a generation in flight, so the
//!   same agent never has two concurrent generations in one session;
//! - the last accepted request time per agent, across all sessions, so one
//!   agent is never asked for more than one utterance per `min_gap`.
//!
//! Rejections are returned immediately and never queued. Acquisition hands
//! out a [`GenerationPermit`] that releases the in-flight slot on drop, so a
//! failed or cancelled generation cannot leak it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::session::{AgentId, SessionId};

/// Minimum gap between two requests for the same agent.
pub const DEFAULT_MIN_REQUEST_GAP: Duration = Duration::from_secs(1);

/// Shared reference to a RequestGate
pub type SharedRequestGate = Arc<RequestGate>;

/// Why the gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("generation already in flight for {agent_id} in session {session_id}")]
    InFlight {
        session_id: SessionId,
        agent_id: AgentId,
    },

    #[error("{agent_id} rate limited, retry after {retry_after:?}")]
    RateLimited {
        agent_id: AgentId,
        retry_after: Duration,
    },
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: HashSet<(SessionId, AgentId)>,
    last_request: HashMap<AgentId, Instant>,
}

/// Single choke point in front of the generation gateway.
#[derive(Debug)]
pub struct RequestGate {
    min_gap: Duration,
    state: Mutex<GateState>,
}

impl RequestGate {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Create a shared reference to this gate
    pub fn shared(self) -> SharedRequestGate {
        Arc::new(self)
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Atomically check both rules and, if they pass, mark the pair in flight.
    ///
    /// The rate-limit timestamp is only recorded for accepted requests.
    pub fn try_acquire(
        self: &Arc<Self>,
        session_id: &str,
        agent_id: &str,
    ) -> Result<GenerationPermit, GateRejection> {
        let now = Instant::now();
        let mut state = self.lock();

        let key = (session_id.to_string(), agent_id.to_string());
        if state.in_flight.contains(&key) {
            return Err(GateRejection::InFlight {
                session_id: key.0,
                agent_id: key.1,
            });
        }

        if let Some(last) = state.last_request.get(agent_id) {
            let since = now.saturating_duration_since(*last);
            if since < self.min_gap {
                return Err(GateRejection::RateLimited {
                    agent_id: key.1,
                    retry_after: self.min_gap - since,
                });
            }
        }

        state.last_request.insert(agent_id.to_string(), now);
        state.in_flight.insert(key);

        Ok(GenerationPermit {
            gate: Arc::clone(self),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            released: false,
        })
    }

    /// Remove the in-flight mark unconditionally. Returns whether it was set.
    pub fn release(&self, session_id: &str, agent_id: &str) -> bool {
        self.lock()
            .in_flight
            .remove(&(session_id.to_string(), agent_id.to_string()))
    }

    pub fn is_in_flight(&self, session_id: &str, agent_id: &str) -> bool {
        self.lock()
            .in_flight
            .contains(&(session_id.to_string(), agent_id.to_string()))
    }

    /// Number of generations currently in flight across all sessions.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_REQUEST_GAP)
    }
}

/// Proof of an accepted request. Releases the in-flight mark when dropped.
#[derive(Debug)]
pub struct GenerationPermit {
    gate: SharedRequestGate,
    session_id: SessionId,
    agent_id: AgentId,
    released: bool,
}

impl GenerationPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Release explicitly. Equivalent to dropping the permit.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.gate.release(&self.session_id, &self.agent_id);
            self.released = true;
        }
    }
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SharedRequestGate {
        RequestGate::default().shared()
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_is_in_flight() {
        let gate = gate();
        let permit = gate.try_acquire("s1", "sage").unwrap();
        assert!(gate.is_in_flight("s1", "sage"));

        tokio::time::advance(Duration::from_secs(5)).await;
        let err = gate.try_acquire("s1", "sage").unwrap_err();
        assert!(matches!(err, GateRejection::InFlight { .. }));

        drop(permit);
        assert!(!gate.is_in_flight("s1", "sage"));
        assert!(gate.try_acquire("s1", "sage").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spans_sessions() {
        let gate = gate();
        gate.try_acquire("s1", "sage").unwrap().release();

        tokio::time::advance(Duration::from_millis(400)).await;
        match gate.try_acquire("s2", "sage") {
            Err(GateRejection::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        // Other agents are unaffected
        assert!(gate.try_acquire("s2", "flint").is_ok());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(gate.try_acquire("s2", "sage").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_reset_window() {
        let gate = gate();
        let _permit = gate.try_acquire("s1", "sage").unwrap();

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(gate.try_acquire("s2", "sage").is_err());

        // Window still measured from the first accepted request
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(gate.try_acquire("s2", "sage").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_unconditional() {
        let gate = gate();
        assert!(!gate.release("s1", "sage"));

        let permit = gate.try_acquire("s1", "sage").unwrap();
        assert!(gate.release("s1", "sage"));
        assert_eq!(gate.in_flight_count(), 0);

        // Dropping after a manual release is harmless
        drop(permit);
        assert_eq!(gate.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_released_when_task_panics() {
        let gate = gate();
        let task_gate = Arc::clone(&gate);
        let result = tokio::spawn(async move {
            let _permit = task_gate.try_acquire("s1", "spark").unwrap();
            panic!("generation blew up");
        })
        .await;

        assert!(result.is_err());
        assert!(!gate.is_in_flight("s1", "spark"));
    }
}
