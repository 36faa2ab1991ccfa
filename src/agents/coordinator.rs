//! Delegation actions for coordinator-role agents.
//!
//! A coordinator's dispatcher recognizes four action names before falling
//! through to the ordinary tool registry: `assign_task`,
//! `send_agent_message`, `get_agent_status`, and `wait_for_task`. Routing is
//! per call, so one response batch may freely mix delegation actions with
//! ordinary tool actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::executor::{ActionDispatcher, ToolDispatcher};
use super::pool::PoolShared;
use super::AgentId;
use crate::events::AgentEvent;
use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::task::{AgentMessage, MessageType, TaskRecord, TaskStatus};
use crate::tools::ActionResult;

const ASSIGN_TASK: &str = "assign_task";
const SEND_AGENT_MESSAGE: &str = "send_agent_message";
const GET_AGENT_STATUS: &str = "get_agent_status";
const WAIT_FOR_TASK: &str = "wait_for_task";

/// Action dispatcher for agents with the coordinator role.
pub struct CoordinatorDispatch {
    shared: Arc<PoolShared>,
    coordinator_id: AgentId,
    project_id: Uuid,
    inner: ToolDispatcher,
}

impl CoordinatorDispatch {
    pub(crate) fn new(shared: Arc<PoolShared>, coordinator_id: AgentId, project_id: Uuid) -> Self {
        let inner = ToolDispatcher::new(
            Arc::clone(&shared.tools),
            shared.config.workspace_path.clone(),
        );
        Self {
            shared,
            coordinator_id,
            project_id,
            inner,
        }
    }

    /// Create a task and hand it to the first agent with the requested role.
    ///
    /// With no matching agent the task is left Pending and the failed result
    /// carries the created task id, so the caller can react (e.g. spawn the
    /// missing role) instead of losing the work.
    async fn assign_task(&self, args: Value) -> ActionResult {
        let args: AssignTaskArgs = match parse_args(ASSIGN_TASK, args) {
            Ok(args) => args,
            Err(result) => return result,
        };

        let task = TaskRecord::new(
            self.project_id,
            args.title,
            args.description,
            args.priority,
            Some(self.coordinator_id),
        );
        if let Err(e) = self.shared.store.create_task(&task).await {
            return ActionResult::fail("Failed to create task", e.to_string());
        }
        self.shared.events.publish(
            self.project_id,
            AgentEvent::TaskCreated {
                task_id: task.id,
                title: task.title.clone(),
            },
        );

        let agents = match self.shared.store.list_agents(self.project_id).await {
            Ok(agents) => agents,
            Err(e) => return ActionResult::fail("Failed to list agents", e.to_string()),
        };
        let Some(worker) = agents.into_iter().find(|a| a.role == args.role) else {
            return ActionResult::fail(
                format!("No '{}' agent in the project; task left pending", args.role),
                format!("no agent with role '{}'", args.role),
            )
            .with_detail(json!({ "task_id": task.id, "status": TaskStatus::Pending }).to_string());
        };

        match self.shared.store.assign_task(task.id, worker.id).await {
            Ok(assigned) => {
                self.shared.events.publish(
                    self.project_id,
                    AgentEvent::TaskAssigned {
                        task_id: task.id,
                        agent_id: worker.id,
                    },
                );
                ActionResult::ok(format!(
                    "Task '{}' assigned to {} agent {}",
                    assigned.title, worker.role, worker.id
                ))
                .with_detail(
                    json!({
                        "task_id": task.id,
                        "agent_id": worker.id,
                        "status": assigned.status,
                    })
                    .to_string(),
                )
            }
            Err(e) => ActionResult::fail("Failed to assign task", e.to_string())
                .with_detail(json!({ "task_id": task.id }).to_string()),
        }
    }

    /// Record a directed message to another agent in the project.
    async fn send_agent_message(&self, args: Value) -> ActionResult {
        let args: SendMessageArgs = match parse_args(SEND_AGENT_MESSAGE, args) {
            Ok(args) => args,
            Err(result) => return result,
        };

        let target = AgentId::from_uuid(args.target_agent_id);
        if target == self.coordinator_id {
            return ActionResult::fail(
                "Cannot send a message to yourself",
                "target agent is the sender",
            );
        }
        let message_type: MessageType = match args.message_type.parse() {
            Ok(t) => t,
            Err(e) => {
                return ActionResult::fail("Invalid message type", e.to_string());
            }
        };
        match self.shared.store.get_agent(target).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ActionResult::fail(
                    format!("Unknown target agent {}", target),
                    "no agent record for target",
                )
            }
            Err(e) => return ActionResult::fail("Failed to look up target agent", e.to_string()),
        }

        let message = AgentMessage::new(
            self.project_id,
            self.coordinator_id,
            target,
            args.message,
            message_type,
        );
        if let Err(e) = self.shared.store.insert_message(&message).await {
            return ActionResult::fail("Failed to record message", e.to_string());
        }
        self.shared.events.publish(
            self.project_id,
            AgentEvent::MessageSent {
                from_agent: self.coordinator_id,
                to_agent: target,
                message_type: message_type.as_str().to_string(),
            },
        );
        ActionResult::ok(format!("{} sent to agent {}", message_type, target))
            .with_detail(json!({ "message_id": message.id }).to_string())
    }

    /// Snapshot one agent, or every agent in the project when no id is given.
    async fn get_agent_status(&self, args: Value) -> ActionResult {
        let args: AgentStatusArgs = match parse_args(GET_AGENT_STATUS, args) {
            Ok(args) => args,
            Err(result) => return result,
        };

        match args.agent_id {
            Some(id) => {
                let agent_id = AgentId::from_uuid(id);
                match self.shared.agent_status(agent_id).await {
                    Ok(snapshot) => {
                        ActionResult::ok(format!("Agent {} is {}", agent_id, snapshot.status))
                            .with_detail(
                                serde_json::to_string(&snapshot).unwrap_or_default(),
                            )
                    }
                    Err(e) => ActionResult::fail(
                        format!("Failed to get status for agent {}", agent_id),
                        e.to_string(),
                    ),
                }
            }
            None => match self.shared.project_status(self.project_id).await {
                Ok(snapshots) => {
                    ActionResult::ok(format!("{} agents in the project", snapshots.len()))
                        .with_detail(serde_json::to_string(&snapshots).unwrap_or_default())
                }
                Err(e) => ActionResult::fail("Failed to get project status", e.to_string()),
            },
        }
    }

    /// Block this coordinator's loop iteration until the task reaches a
    /// terminal status or the timeout elapses. Deliberately a synchronous
    /// barrier: the coordinator asked to wait on a dependency.
    async fn wait_for_task(&self, args: Value) -> ActionResult {
        let args: WaitForTaskArgs = match parse_args(WAIT_FOR_TASK, args) {
            Ok(args) => args,
            Err(result) => return result,
        };

        let timeout = Duration::from_millis(
            args.timeout_ms.unwrap_or(self.shared.config.wait_timeout_ms),
        );
        let poll = Duration::from_millis(self.shared.config.wait_poll_ms.max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let task = match self.shared.store.get_task(args.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    return ActionResult::fail(
                        format!("Unknown task {}", args.task_id),
                        "no task record with that id",
                    )
                }
                Err(e) => return ActionResult::fail("Failed to poll task", e.to_string()),
            };

            match task.status {
                TaskStatus::Completed => {
                    return ActionResult::ok(format!("Task '{}' completed", task.title))
                        .with_detail(
                            json!({
                                "task_id": task.id,
                                "status": task.status,
                                "result": task.result,
                            })
                            .to_string(),
                        );
                }
                TaskStatus::Failed => {
                    return ActionResult::fail(
                        format!("Task '{}' failed", task.title),
                        task.error.unwrap_or_else(|| "no error recorded".to_string()),
                    )
                    .with_detail(json!({ "task_id": task.id, "status": "failed" }).to_string());
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return ActionResult::fail(
                    format!("Timed out waiting for task '{}'", task.title),
                    format!("task still {} after {}ms", task.status, timeout.as_millis()),
                )
                .with_detail(
                    json!({
                        "task_id": task.id,
                        "timed_out": true,
                        "last_status": task.status,
                    })
                    .to_string(),
                );
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl ActionDispatcher for CoordinatorDispatch {
    async fn dispatch(&self, name: &str, args: Value) -> ActionResult {
        match name {
            ASSIGN_TASK => self.assign_task(args).await,
            SEND_AGENT_MESSAGE => self.send_agent_message(args).await,
            GET_AGENT_STATUS => self.get_agent_status(args).await,
            WAIT_FOR_TASK => self.wait_for_task(args).await,
            other => self.inner.dispatch(other, args).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssignTaskArgs {
    role: String,
    title: String,
    description: String,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    target_agent_id: Uuid,
    message: String,
    #[serde(default = "default_message_type")]
    message_type: String,
}

fn default_message_type() -> String {
    MessageType::Message.as_str().to_string()
}

#[derive(Debug, Default, Deserialize)]
struct AgentStatusArgs {
    #[serde(default)]
    agent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct WaitForTaskArgs {
    task_id: Uuid,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn parse_args<T: DeserializeOwned>(action: &str, args: Value) -> Result<T, ActionResult> {
    serde_json::from_value(args).map_err(|e| {
        ActionResult::fail(
            format!("Invalid arguments for '{}'", action),
            e.to_string(),
        )
    })
}

/// Schemas for the four delegation actions, advertised to the LLM alongside
/// the ordinary tool schemas when the running agent is a coordinator.
pub(crate) fn delegation_schemas() -> Vec<ToolDefinition> {
    let function = |name: &str, description: &str, parameters: Value| ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    };

    vec![
        function(
            ASSIGN_TASK,
            "Create a sub-task and assign it to the first agent with the given role",
            json!({
                "type": "object",
                "properties": {
                    "role": { "type": "string", "description": "Role of the agent to assign to" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "priority": { "type": "integer", "description": "Higher is more urgent", "default": 0 }
                },
                "required": ["role", "title", "description"]
            }),
        ),
        function(
            SEND_AGENT_MESSAGE,
            "Send a directed message to another agent in the project",
            json!({
                "type": "object",
                "properties": {
                    "target_agent_id": { "type": "string", "description": "UUID of the receiving agent" },
                    "message": { "type": "string" },
                    "message_type": {
                        "type": "string",
                        "enum": ["message", "question", "response", "task_handoff"],
                        "default": "message"
                    }
                },
                "required": ["target_agent_id", "message"]
            }),
        ),
        function(
            GET_AGENT_STATUS,
            "Get one agent's status, or every agent's status when no id is given",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string", "description": "UUID of the agent (optional)" }
                }
            }),
        ),
        function(
            WAIT_FOR_TASK,
            "Block until a task completes or fails, or until the timeout elapses",
            json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string", "description": "UUID of the task to wait on" },
                    "timeout_ms": { "type": "integer", "description": "Max wait in milliseconds", "default": 60000 }
                },
                "required": ["task_id"]
            }),
        ),
    ]
}
