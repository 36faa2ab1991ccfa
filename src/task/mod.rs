//! Task records, the status state machine, and directed agent messages.
//!
//! # State Machine
//! ```text
//! Pending -> Assigned -> InProgress -> Completed
//!                                  \-> Failed
//! Blocked is reachable from any non-terminal state (manual marker);
//! nothing in the core moves a task out of Blocked automatically.
//! ```
//!
//! # Invariants
//! - `started_at` is stamped exactly once, on the first transition to InProgress
//! - `completed_at` is stamped exactly once, on the first terminal transition
//! - both stamps are monotonic: never cleared or overwritten

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agents::AgentId;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet assigned to an agent
    Pending,
    /// Assigned to an agent, work not started
    Assigned,
    /// An agent is actively working on it
    InProgress,
    /// Parked for manual intervention
    Blocked,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Check if the task can still make progress.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Agent currently responsible for the task
    pub agent_id: Option<AgentId>,
    /// Agent (usually a coordinator) that created the task
    pub created_by: Option<AgentId>,
    pub title: String,
    pub description: String,
    /// Higher = more urgent
    pub priority: i64,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a fresh Pending task.
    pub fn new(
        project_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: i64,
        created_by: Option<AgentId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id: None,
            created_by,
            title: title.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Assign the task to an agent.
    ///
    /// Legal only from Pending or Assigned (re-assignment before work starts).
    pub fn assign(&mut self, agent_id: AgentId) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Assigned => {
                self.agent_id = Some(agent_id);
                self.status = TaskStatus::Assigned;
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other,
                to: TaskStatus::Assigned,
            }),
        }
    }

    /// Force the task back to Assigned with a new agent, regardless of prior
    /// status. Used by a coordinator to hand off after a failure.
    pub fn reassign(&mut self, agent_id: AgentId) {
        self.agent_id = Some(agent_id);
        self.status = TaskStatus::Assigned;
    }

    /// Move the task to a new status, stamping timestamps monotonically.
    ///
    /// Blocked is reachable from any non-terminal state. Terminal states
    /// accept result/error text; neither stamp is ever overwritten.
    pub fn apply_status(
        &mut self,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), TaskError> {
        if self.status.is_terminal() && status != self.status {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        match status {
            TaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(Utc::now());
                }
                // Write-once, like the stamp: a repeated terminal transition
                // must not rewrite the recorded outcome.
                if self.result.is_none() {
                    self.result = result;
                }
                if self.error.is_none() {
                    self.error = error;
                }
            }
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Blocked => {}
        }

        self.status = status;
        Ok(())
    }

    /// Whether deletion is allowed. Deleting live work would orphan the
    /// running agent's belief about its own task.
    pub fn can_delete(&self) -> bool {
        self.status != TaskStatus::InProgress
    }
}

/// Type of a directed agent-to-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Message,
    Question,
    Response,
    TaskHandoff,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::Question => "question",
            MessageType::Response => "response",
            MessageType::TaskHandoff => "task_handoff",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(MessageType::Message),
            "question" => Ok(MessageType::Question),
            "response" => Ok(MessageType::Response),
            "task_handoff" => Ok(MessageType::TaskHandoff),
            other => Err(TaskError::InvalidMessageType(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed message between agents in a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub project_id: Uuid,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        project_id: Uuid,
        from_agent: AgentId,
        to_agent: AgentId,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            from_agent,
            to_agent,
            content: content.into(),
            message_type,
            created_at: Utc::now(),
        }
    }
}

/// Errors from task operations.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Cannot delete a task that is in progress")]
    DeleteWhileInProgress,

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskRecord {
        TaskRecord::new(Uuid::new_v4(), "t", "d", 0, None)
    }

    #[test]
    fn assignment_only_before_work_starts() {
        let mut task = task();
        let a = AgentId::new();
        let b = AgentId::new();

        task.assign(a).expect("assign from pending");
        task.assign(b).expect("re-assign while still assigned");
        assert_eq!(task.agent_id, Some(b));

        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        assert!(task.assign(a).is_err());
    }

    #[test]
    fn reassign_forces_assigned_from_any_status() {
        let mut task = task();
        let a = AgentId::new();
        task.assign(a).unwrap();
        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        task.apply_status(TaskStatus::Failed, None, Some("boom".to_string()))
            .unwrap();

        let b = AgentId::new();
        task.reassign(b);
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.agent_id, Some(b));
    }

    #[test]
    fn started_stamp_is_monotonic() {
        let mut task = task();
        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        let first = task.started_at.expect("started stamped");

        task.apply_status(TaskStatus::Blocked, None, None).unwrap();
        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        assert_eq!(task.started_at, Some(first));
    }

    #[test]
    fn completed_stamp_is_monotonic() {
        let mut task = task();
        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        task.apply_status(TaskStatus::Completed, Some("done".to_string()), None)
            .unwrap();
        let first = task.completed_at.expect("completed stamped");

        // Re-applying the same terminal status must not move the stamp or
        // rewrite the recorded outcome.
        task.apply_status(TaskStatus::Completed, Some("again".to_string()), None)
            .unwrap();
        assert_eq!(task.completed_at, Some(first));
        assert_eq!(task.result.as_deref(), Some("done"));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut task = task();
        task.apply_status(TaskStatus::Failed, None, Some("err".to_string()))
            .unwrap();
        assert!(task
            .apply_status(TaskStatus::InProgress, None, None)
            .is_err());
        assert!(task.apply_status(TaskStatus::Blocked, None, None).is_err());
    }

    #[test]
    fn blocked_reachable_from_non_terminal_states() {
        let mut task = task();
        task.apply_status(TaskStatus::Blocked, None, None).unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[test]
    fn delete_refused_only_in_progress() {
        let mut task = task();
        assert!(task.can_delete());
        task.apply_status(TaskStatus::InProgress, None, None).unwrap();
        assert!(!task.can_delete());
        task.apply_status(TaskStatus::Completed, None, None).unwrap();
        assert!(task.can_delete());
    }

    #[test]
    fn message_type_parse_is_strict() {
        assert!("task_handoff".parse::<MessageType>().is_ok());
        assert!("broadcast".parse::<MessageType>().is_err());
    }
}
