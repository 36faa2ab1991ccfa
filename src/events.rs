//! Fan-out notification events for observers (dashboards, transports).
//!
//! The core publishes an event after a state change has committed and never
//! depends on delivery: a publish that nobody hears is fine, and a failing
//! broadcaster must not affect the committed state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentId;
use crate::task::TaskStatus;

/// Orchestration events, tagged for the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// An agent began executing a prompt.
    RunStarted {
        agent_id: AgentId,
        task_id: Option<Uuid>,
    },
    /// An agent finished a run successfully.
    RunCompleted {
        agent_id: AgentId,
        task_id: Option<Uuid>,
    },
    /// An agent's run failed.
    RunFailed {
        agent_id: AgentId,
        task_id: Option<Uuid>,
        error: String,
    },
    /// A task record was created.
    TaskCreated { task_id: Uuid, title: String },
    /// A task was assigned (or reassigned) to an agent.
    TaskAssigned { task_id: Uuid, agent_id: AgentId },
    /// A task moved to a new status.
    TaskStatusChanged { task_id: Uuid, status: TaskStatus },
    /// A file lock was granted.
    LockAcquired {
        path: String,
        holder: AgentId,
        kind: String,
    },
    /// A file lock was released or expired.
    LockReleased { path: String, holder: AgentId },
    /// A directed message was recorded between agents.
    MessageSent {
        from_agent: AgentId,
        to_agent: AgentId,
        message_type: String,
    },
}

/// Fire-and-forget event sink.
pub trait EventBroadcaster: Send + Sync {
    /// Publish an event scoped to a project. Must never block on delivery.
    fn publish(&self, project_id: Uuid, event: AgentEvent);
}

/// Broadcaster backed by a tokio broadcast channel.
///
/// Send errors (no live receivers) are ignored by design.
pub struct BroadcastHub {
    sender: tokio::sync::broadcast::Sender<(Uuid, AgentEvent)>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(Uuid, AgentEvent)> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster for BroadcastHub {
    fn publish(&self, project_id: Uuid, event: AgentEvent) {
        let _ = self.sender.send((project_id, event));
    }
}

/// Broadcaster that drops everything (tests, embedders without observers).
pub struct NullBroadcaster;

impl EventBroadcaster for NullBroadcaster {
    fn publish(&self, _project_id: Uuid, _event: AgentEvent) {}
}
