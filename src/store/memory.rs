//! In-memory state store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AgentRecord, StateStore, StoreError};
use crate::agents::AgentId;
use crate::llm::ChatMessage;
use crate::task::{AgentMessage, TaskError, TaskRecord, TaskStatus};

#[derive(Clone, Default)]
pub struct MemoryStore {
    agents: Arc<RwLock<HashMap<AgentId, AgentRecord>>>,
    histories: Arc<RwLock<HashMap<AgentId, Vec<ChatMessage>>>>,
    tasks: Arc<RwLock<HashMap<Uuid, TaskRecord>>>,
    messages: Arc<RwLock<Vec<AgentMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.agents.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn list_agents(&self, project_id: Uuid) -> Result<Vec<AgentRecord>, StoreError> {
        let mut agents: Vec<AgentRecord> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn load_history(&self, id: AgentId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.histories.read().await.get(&id).cloned().unwrap_or_default())
    }

    async fn save_history(&self, id: AgentId, history: &[ChatMessage]) -> Result<(), StoreError> {
        if !self.agents.read().await.contains_key(&id) {
            return Err(StoreError::AgentNotFound(id));
        }
        self.histories.write().await.insert(id, history.to_vec());
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn assign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.assign(agent_id)?;
        Ok(task.clone())
    }

    async fn reassign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.reassign(agent_id);
        Ok(task.clone())
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.apply_status(status, result, error)?;
        Ok(task.clone())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(&id) {
            None => Ok(false),
            Some(task) if !task.can_delete() => {
                Err(StoreError::Task(TaskError::DeleteWhileInProgress))
            }
            Some(_) => {
                tasks.remove(&id);
                Ok(true)
            }
        }
    }

    async fn next_ready_task(&self, project_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut ready: Vec<&TaskRecord> = tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Assigned))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(ready.first().map(|t| (*t).clone()))
    }

    async fn completed_task_count(&self, agent_id: AgentId) -> Result<u64, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.agent_id == Some(agent_id) && t.status == TaskStatus::Completed)
            .count() as u64)
    }

    async fn insert_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn list_messages_for(&self, agent_id: AgentId) -> Result<Vec<AgentMessage>, StoreError> {
        let mut inbox: Vec<AgentMessage> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.to_agent == agent_id)
            .cloned()
            .collect();
        inbox.sort_by_key(|m| m.created_at);
        Ok(inbox)
    }
}
