//! Persistence with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! One trait covers the three persisted domains the orchestrator needs:
//! agent records (role, custom prompt, conversation history), task records,
//! and directed agent messages. History saves are full replacements with
//! last-writer-wins semantics; the pool is the only writer for a given agent
//! because a second concurrent run is rejected up front.
//!
//! Task status transitions are validated by `TaskRecord` itself; both
//! backends route every mutation through those methods so the state machine
//! has a single source of truth.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agents::AgentId;
use crate::llm::ChatMessage;
use crate::task::{AgentMessage, TaskError, TaskRecord, TaskStatus};

/// Persisted identity of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub project_id: Uuid,
    /// Logical role, e.g. "coordinator" or "backend"
    pub role: String,
    /// Per-agent system prompt override (role default applies when absent)
    pub custom_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(project_id: Uuid, role: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            project_id,
            role: role.into(),
            custom_prompt: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }
}

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Persistence collaborator for agents, tasks, and messages.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // === Agents ===

    /// Insert or replace an agent record.
    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError>;

    /// Get a single agent record by ID.
    async fn get_agent(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError>;

    /// List agents in a project, oldest first.
    async fn list_agents(&self, project_id: Uuid) -> Result<Vec<AgentRecord>, StoreError>;

    /// Load an agent's conversation history (empty if never saved).
    async fn load_history(&self, id: AgentId) -> Result<Vec<ChatMessage>, StoreError>;

    /// Replace an agent's conversation history wholesale.
    async fn save_history(&self, id: AgentId, history: &[ChatMessage]) -> Result<(), StoreError>;

    // === Tasks ===

    /// Insert a new task record.
    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    /// Get a single task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    /// List tasks in a project, newest first.
    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<TaskRecord>, StoreError>;

    /// Assign a task to an agent (legal from Pending or Assigned only).
    async fn assign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError>;

    /// Force a task back to Assigned with a new agent, from any status.
    async fn reassign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError>;

    /// Transition a task's status, optionally attaching result/error text.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError>;

    /// Delete a task. Refused while the task is InProgress.
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Next ready task in a project: highest priority first, then creation
    /// order. Advisory; the core never drains this queue automatically.
    async fn next_ready_task(&self, project_id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    /// How many tasks an agent has completed.
    async fn completed_task_count(&self, agent_id: AgentId) -> Result<u64, StoreError>;

    // === Messages ===

    /// Record a directed agent-to-agent message.
    async fn insert_message(&self, message: &AgentMessage) -> Result<(), StoreError>;

    /// List messages addressed to an agent, oldest first.
    async fn list_messages_for(&self, agent_id: AgentId) -> Result<Vec<AgentMessage>, StoreError>;
}

#[cfg(test)]
pub(crate) mod behavior_tests {
    //! Behavior checks shared by both backends.

    use super::*;

    pub async fn run_all(store: &dyn StateStore) {
        agent_roundtrip(store).await;
        history_requires_agent_record(store).await;
        task_lifecycle(store).await;
        delete_refused_in_progress(store).await;
        ready_ordering(store).await;
        messages_roundtrip(store).await;
    }

    async fn agent_roundtrip(store: &dyn StateStore) {
        let project = Uuid::new_v4();
        let record = AgentRecord::new(project, "backend").with_custom_prompt("be terse");
        store.upsert_agent(&record).await.expect("upsert agent");

        let loaded = store
            .get_agent(record.id)
            .await
            .expect("get agent")
            .expect("agent exists");
        assert_eq!(loaded.role, "backend");
        assert_eq!(loaded.custom_prompt.as_deref(), Some("be terse"));

        assert!(store.load_history(record.id).await.unwrap().is_empty());
        let history = vec![
            ChatMessage::new(crate::llm::Role::User, "hi"),
            ChatMessage::new(crate::llm::Role::Assistant, "hello"),
        ];
        store.save_history(record.id, &history).await.unwrap();
        let loaded = store.load_history(record.id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content.as_deref(), Some("hello"));

        assert_eq!(store.list_agents(project).await.unwrap().len(), 1);
    }

    async fn history_requires_agent_record(store: &dyn StateStore) {
        let orphan = AgentId::new();
        let history = vec![ChatMessage::new(crate::llm::Role::User, "lost")];
        let err = store
            .save_history(orphan, &history)
            .await
            .expect_err("no record to attach history to");
        assert!(matches!(err, StoreError::AgentNotFound(id) if id == orphan));
        assert!(store.load_history(orphan).await.unwrap().is_empty());
    }

    async fn task_lifecycle(store: &dyn StateStore) {
        let project = Uuid::new_v4();
        let agent = AgentId::new();
        let task = TaskRecord::new(project, "t", "d", 3, None);
        store.create_task(&task).await.unwrap();

        let assigned = store.assign_task(task.id, agent).await.unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);

        let started = store
            .update_task_status(task.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();
        let started_at = started.started_at.expect("started stamped");

        // Assignment after work starts is rejected with no state change.
        assert!(store.assign_task(task.id, AgentId::new()).await.is_err());

        let done = store
            .update_task_status(
                task.id,
                TaskStatus::Completed,
                Some("all good".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(done.result.as_deref(), Some("all good"));
        assert_eq!(done.started_at, Some(started_at));
        assert!(done.completed_at.is_some());

        assert_eq!(store.completed_task_count(agent).await.unwrap(), 1);

        // Reassign is legal even from a terminal status.
        let handed_off = store.reassign_task(task.id, AgentId::new()).await.unwrap();
        assert_eq!(handed_off.status, TaskStatus::Assigned);
    }

    async fn delete_refused_in_progress(store: &dyn StateStore) {
        let project = Uuid::new_v4();
        let task = TaskRecord::new(project, "t", "d", 0, None);
        store.create_task(&task).await.unwrap();
        store.assign_task(task.id, AgentId::new()).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();

        assert!(store.delete_task(task.id).await.is_err());

        store
            .update_task_status(task.id, TaskStatus::Failed, None, Some("x".to_string()))
            .await
            .unwrap();
        assert!(store.delete_task(task.id).await.unwrap());
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }

    async fn ready_ordering(store: &dyn StateStore) {
        let project = Uuid::new_v4();
        let low = TaskRecord::new(project, "low", "d", 1, None);
        store.create_task(&low).await.unwrap();
        let mut high_old = TaskRecord::new(project, "high-old", "d", 5, None);
        high_old.created_at = Utc::now() - chrono::Duration::seconds(10);
        store.create_task(&high_old).await.unwrap();
        let high_new = TaskRecord::new(project, "high-new", "d", 5, None);
        store.create_task(&high_new).await.unwrap();

        let next = store
            .next_ready_task(project)
            .await
            .unwrap()
            .expect("ready task");
        assert_eq!(next.title, "high-old");
    }

    async fn messages_roundtrip(store: &dyn StateStore) {
        let project = Uuid::new_v4();
        let from = AgentId::new();
        let to = AgentId::new();
        let message = AgentMessage::new(project, from, to, "ping", crate::task::MessageType::Question);
        store.insert_message(&message).await.unwrap();

        let inbox = store.list_messages_for(to).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].content, "ping");
        assert!(store.list_messages_for(from).await.unwrap().is_empty());
    }
}
