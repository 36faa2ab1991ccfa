//! Agent instances, the reasoning loop, and the orchestrating pool.
//!
//! An [`AgentInstance`] is one logical worker's live state: conversation
//! history plus running/paused flags. The [`AgentPool`] caches instances,
//! enforces one run at a time per agent, and guarantees cleanup (running flag,
//! lock release, history persistence) on every exit path. The
//! [`ReasoningLoop`] drives the bounded think/act cycle, and
//! [`CoordinatorDispatch`] layers the delegation protocol on top of ordinary
//! tool dispatch for agents with the coordinator role.

mod coordinator;
mod executor;
mod instance;
mod pool;

pub use coordinator::CoordinatorDispatch;
pub use executor::{ActionDispatcher, ActionLogEntry, ReasoningLoop, RunOutcome, ToolDispatcher};
pub use instance::AgentInstance;
pub use pool::{AgentPool, AgentStatusSnapshot};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;
use crate::task::TaskError;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new unique agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur in agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A second execute was issued while a run is in flight.
    #[error("Agent {0} is already running")]
    AlreadyRunning(AgentId),

    /// Release was requested for an agent mid-run.
    #[error("Agent {0} cannot be released while running")]
    ReleaseWhileRunning(AgentId),

    /// No persisted record exists for the requested agent.
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// The iteration cap was exhausted without a terminal response.
    /// Fatal; the caller must not retry automatically.
    #[error("Reasoning loop exhausted after {0} iterations")]
    LoopExhausted(usize),

    /// Transport/service failure talking to the reasoning service.
    #[error("Reasoning service error: {0}")]
    Llm(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),
}
