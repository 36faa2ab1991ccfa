//! Keyed cache of live agent instances and the execute orchestration.
//!
//! The pool is the only component allowed to start a run. It enforces the
//! one-run-per-agent invariant through the instance's atomic running flag and
//! guarantees that cleanup (flag clear, lock release, history persistence)
//! happens on every exit path, success or failure, before the result is
//! reported.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::coordinator::{self, CoordinatorDispatch};
use super::executor::{ActionDispatcher, ReasoningLoop, RunOutcome, ToolDispatcher};
use super::instance::AgentInstance;
use super::{AgentError, AgentId};
use crate::config::Config;
use crate::events::{AgentEvent, EventBroadcaster};
use crate::llm::LlmClient;
use crate::locks::LockRegistry;
use crate::roles::{RoleRegistry, COORDINATOR_ROLE};
use crate::store::{AgentRecord, StateStore};
use crate::task::TaskStatus;
use crate::tools::ToolRegistry;

/// Collaborators shared by the pool and the coordinator dispatch.
pub(crate) struct PoolShared {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub locks: Arc<LockRegistry>,
    pub events: Arc<dyn EventBroadcaster>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub roles: RoleRegistry,
    pub instances: Mutex<HashMap<AgentId, Arc<AgentInstance>>>,
    pub project_index: Mutex<HashMap<Uuid, HashSet<AgentId>>>,
}

/// Point-in-time view of one agent for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusSnapshot {
    pub agent_id: AgentId,
    pub role: String,
    /// "running", "paused", or "idle"
    pub status: String,
    pub current_task_id: Option<Uuid>,
    pub current_task_title: Option<String>,
    pub completed_tasks: u64,
}

impl PoolShared {
    pub(crate) async fn agent_status(
        &self,
        agent_id: AgentId,
    ) -> Result<AgentStatusSnapshot, AgentError> {
        let record = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(AgentError::UnknownAgent(agent_id))?;

        let (running, paused) = {
            let instances = self.instances.lock().await;
            match instances.get(&agent_id) {
                Some(instance) => (instance.is_running(), instance.is_paused()),
                None => (false, false),
            }
        };

        let current = self
            .store
            .list_tasks(record.project_id)
            .await?
            .into_iter()
            .find(|t| t.agent_id == Some(agent_id) && t.status == TaskStatus::InProgress);

        Ok(AgentStatusSnapshot {
            agent_id,
            role: record.role,
            status: if running {
                "running"
            } else if paused {
                "paused"
            } else {
                "idle"
            }
            .to_string(),
            current_task_id: current.as_ref().map(|t| t.id),
            current_task_title: current.map(|t| t.title),
            completed_tasks: self.store.completed_task_count(agent_id).await?,
        })
    }

    pub(crate) async fn project_status(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<AgentStatusSnapshot>, AgentError> {
        let mut snapshots = Vec::new();
        for record in self.store.list_agents(project_id).await? {
            snapshots.push(self.agent_status(record.id).await?);
        }
        Ok(snapshots)
    }
}

/// Orchestrator over cached agent instances.
pub struct AgentPool {
    shared: Arc<PoolShared>,
}

impl AgentPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        locks: Arc<LockRegistry>,
        events: Arc<dyn EventBroadcaster>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        roles: RoleRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                store,
                locks,
                events,
                llm,
                tools,
                roles,
                instances: Mutex::new(HashMap::new()),
                project_index: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist a new agent record. Convenience for embedders and tests; the
    /// instance itself is created lazily on first access.
    pub async fn create_agent(
        &self,
        project_id: Uuid,
        role: impl Into<String>,
        custom_prompt: Option<String>,
    ) -> Result<AgentRecord, AgentError> {
        let mut record = AgentRecord::new(project_id, role);
        if let Some(prompt) = custom_prompt {
            record = record.with_custom_prompt(prompt);
        }
        self.shared.store.upsert_agent(&record).await?;
        Ok(record)
    }

    /// Return the cached instance, or construct one from persisted state.
    pub async fn get_or_create(&self, agent_id: AgentId) -> Result<Arc<AgentInstance>, AgentError> {
        if let Some(instance) = self.shared.instances.lock().await.get(&agent_id) {
            return Ok(Arc::clone(instance));
        }

        let record = self
            .shared
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(AgentError::UnknownAgent(agent_id))?;
        let history = self.shared.store.load_history(agent_id).await?;
        let prompt = self
            .shared
            .roles
            .effective_prompt(&record.role, record.custom_prompt.as_deref());
        let instance = Arc::new(AgentInstance::new(
            agent_id,
            record.project_id,
            record.role,
            prompt,
            history,
        ));

        // Another caller may have won the construction race; keep theirs.
        let mut instances = self.shared.instances.lock().await;
        let instance = match instances.entry(agent_id) {
            std::collections::hash_map::Entry::Occupied(existing) => Arc::clone(existing.get()),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
                self.shared
                    .project_index
                    .lock()
                    .await
                    .entry(record.project_id)
                    .or_default()
                    .insert(agent_id);
                instance
            }
        };
        Ok(instance)
    }

    /// Drive one reasoning run for an agent.
    ///
    /// Fails fast with `AlreadyRunning` while a run is in flight. Regardless
    /// of outcome the running flag is cleared, the agent's locks are
    /// released, and history is persisted before this returns. With a task
    /// attached, success marks it Completed with the final text and failure
    /// marks it Failed with the error text before the error is re-raised.
    pub async fn execute(
        &self,
        agent_id: AgentId,
        task_id: Option<Uuid>,
        prompt: &str,
    ) -> Result<RunOutcome, AgentError> {
        let instance = self.get_or_create(agent_id).await?;
        if !instance.try_begin_run() {
            return Err(AgentError::AlreadyRunning(agent_id));
        }

        let project_id = instance.project_id;
        self.shared
            .events
            .publish(project_id, AgentEvent::RunStarted { agent_id, task_id });

        let result = self.run_gated(&instance, task_id, prompt).await;

        // Cleanup on every exit path.
        instance.end_run();
        self.shared.locks.release_all_for_holder(agent_id).await;
        let history = instance.history_snapshot().await;
        if let Err(e) = self.shared.store.save_history(agent_id, &history).await {
            tracing::warn!("Failed to persist history for agent {}: {}", agent_id, e);
        }

        match result {
            Ok(outcome) => {
                if let Some(task_id) = task_id {
                    self.finish_task(
                        project_id,
                        task_id,
                        TaskStatus::Completed,
                        Some(outcome.final_text.clone()),
                        None,
                    )
                    .await;
                }
                self.shared
                    .events
                    .publish(project_id, AgentEvent::RunCompleted { agent_id, task_id });
                Ok(outcome)
            }
            Err(e) => {
                if let Some(task_id) = task_id {
                    self.finish_task(
                        project_id,
                        task_id,
                        TaskStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                }
                self.shared.events.publish(
                    project_id,
                    AgentEvent::RunFailed {
                        agent_id,
                        task_id,
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn run_gated(
        &self,
        instance: &AgentInstance,
        task_id: Option<Uuid>,
        prompt: &str,
    ) -> Result<RunOutcome, AgentError> {
        if let Some(task_id) = task_id {
            self.shared
                .store
                .update_task_status(task_id, TaskStatus::InProgress, None, None)
                .await?;
            self.shared.events.publish(
                instance.project_id,
                AgentEvent::TaskStatusChanged {
                    task_id,
                    status: TaskStatus::InProgress,
                },
            );
        }

        let mut schemas = self.shared.tools.get_tool_schemas();
        let dispatcher: Box<dyn ActionDispatcher> = if instance.role == COORDINATOR_ROLE {
            schemas.extend(coordinator::delegation_schemas());
            Box::new(CoordinatorDispatch::new(
                Arc::clone(&self.shared),
                instance.id,
                instance.project_id,
            ))
        } else {
            Box::new(ToolDispatcher::new(
                Arc::clone(&self.shared.tools),
                self.shared.config.workspace_path.clone(),
            ))
        };

        let reasoning = ReasoningLoop::new(
            Arc::clone(&self.shared.llm),
            self.shared.config.default_model.clone(),
            self.shared.config.max_iterations,
        );

        let mut history = instance.history().await;
        reasoning
            .run(
                &instance.system_prompt,
                &mut history,
                prompt,
                &schemas,
                dispatcher.as_ref(),
            )
            .await
    }

    /// Terminal task transition after a run. Failures here are logged, never
    /// raised: the run's own result takes precedence.
    async fn finish_task(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        match self
            .shared
            .store
            .update_task_status(task_id, status, result, error)
            .await
        {
            Ok(_) => {
                self.shared
                    .events
                    .publish(project_id, AgentEvent::TaskStatusChanged { task_id, status });
            }
            Err(e) => {
                tracing::warn!("Failed to mark task {} {}: {}", task_id, status, e);
            }
        }
    }

    /// Flush and evict an idle instance. Evicting an agent that is not
    /// pooled is a safe no-op; evicting a running agent is refused.
    pub async fn release(&self, agent_id: AgentId) -> Result<(), AgentError> {
        let mut instances = self.shared.instances.lock().await;
        let Some(instance) = instances.get(&agent_id).cloned() else {
            return Ok(());
        };
        // Claiming the run flag blocks a concurrent execute from starting on
        // the instance while we flush it out.
        if !instance.try_begin_run() {
            return Err(AgentError::ReleaseWhileRunning(agent_id));
        }
        instances.remove(&agent_id);
        drop(instances);

        self.shared
            .project_index
            .lock()
            .await
            .entry(instance.project_id)
            .or_default()
            .remove(&agent_id);

        let history = instance.history_snapshot().await;
        let saved = self.shared.store.save_history(agent_id, &history).await;
        self.shared.locks.release_all_for_holder(agent_id).await;
        saved?;
        Ok(())
    }

    /// Best-effort release of every pooled instance (shutdown path).
    /// Individual failures are logged and skipped.
    pub async fn release_all(&self) {
        let ids: Vec<AgentId> = self.shared.instances.lock().await.keys().copied().collect();
        for agent_id in ids {
            if let Err(e) = self.release(agent_id).await {
                tracing::warn!("Failed to release agent {}: {}", agent_id, e);
            }
        }
    }

    /// Set the advisory pause flag on a pooled instance.
    pub async fn set_paused(&self, agent_id: AgentId, paused: bool) -> Result<(), AgentError> {
        let instance = self.get_or_create(agent_id).await?;
        instance.set_paused(paused);
        Ok(())
    }

    /// Snapshot one agent's status.
    pub async fn agent_status(&self, agent_id: AgentId) -> Result<AgentStatusSnapshot, AgentError> {
        self.shared.agent_status(agent_id).await
    }

    /// Snapshot every agent in a project.
    pub async fn project_status(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<AgentStatusSnapshot>, AgentError> {
        self.shared.project_status(project_id).await
    }

    /// Agent ids with a live pooled instance for a project.
    pub async fn pooled_agents(&self, project_id: Uuid) -> Vec<AgentId> {
        self.shared
            .project_index
            .lock()
            .await
            .get(&project_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::super::executor::test_support::ScriptedLlm;
    use super::*;
    use crate::events::BroadcastHub;
    use crate::llm::{ChatMessage, ChatResponse, Role, ToolCall};
    use crate::locks::LockKind;
    use crate::store::{MemoryStore, StateStore};
    use crate::task::TaskRecord;
    use crate::tools::{ActionResult, Tool};

    struct Touch;

    #[async_trait]
    impl Tool for Touch {
        fn name(&self) -> &str {
            "touch"
        }

        fn description(&self) -> &str {
            "Create an empty marker"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }

        async fn execute(&self, _args: Value, _workspace: &Path) -> anyhow::Result<ActionResult> {
            Ok(ActionResult::ok("touched"))
        }
    }

    struct Fixture {
        pool: AgentPool,
        store: Arc<dyn StateStore>,
        locks: Arc<LockRegistry>,
        events: Arc<BroadcastHub>,
    }

    fn fixture(llm: Arc<dyn LlmClient>, tools: ToolRegistry) -> Fixture {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockRegistry::new(60_000));
        let events = Arc::new(BroadcastHub::new(32));
        let pool = AgentPool::new(
            Config::new("test-model", std::env::temp_dir()),
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone() as Arc<dyn EventBroadcaster>,
            llm,
            Arc::new(tools),
            RoleRegistry::new(),
        );
        Fixture {
            pool,
            store,
            locks,
            events,
        }
    }

    #[tokio::test]
    async fn second_execute_is_rejected_while_running() {
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::text("done")]));
        let fx = fixture(llm, ToolRegistry::new());
        let agent = fx.pool.create_agent(Uuid::new_v4(), "backend", None).await.unwrap();

        let instance = fx.pool.get_or_create(agent.id).await.unwrap();
        assert!(instance.try_begin_run());

        let err = fx.pool.execute(agent.id, None, "go").await.expect_err("gated");
        assert!(matches!(err, AgentError::AlreadyRunning(id) if id == agent.id));

        instance.end_run();
        let outcome = fx.pool.execute(agent.id, None, "go").await.unwrap();
        assert_eq!(outcome.final_text, "done");
    }

    #[tokio::test]
    async fn execute_completes_the_task_with_the_final_text() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ChatResponse::with_tool_calls(None, vec![ToolCall::function("c1", "touch", "{}")]),
            ChatResponse::text("all wired up"),
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Touch));
        let fx = fixture(llm, tools);

        let project = Uuid::new_v4();
        let agent = fx.pool.create_agent(project, "backend", None).await.unwrap();
        let task = TaskRecord::new(project, "wire it", "d", 5, None);
        fx.store.create_task(&task).await.unwrap();
        fx.store.assign_task(task.id, agent.id).await.unwrap();
        let mut rx = fx.events.subscribe();

        let outcome = fx.pool.execute(agent.id, Some(task.id), "do X").await.unwrap();

        assert_eq!(outcome.final_text, "all wired up");
        assert_eq!(outcome.actions.len(), 1);
        assert!(outcome.actions[0].result.success);

        let task = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("all wired up"));
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());

        let instance = fx.pool.get_or_create(agent.id).await.unwrap();
        assert!(!instance.is_running());

        // user, assistant(+call), tool result, final assistant
        let history = fx.store.load_history(agent.id).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::Tool);

        let (_, first) = rx.recv().await.unwrap();
        assert!(matches!(first, AgentEvent::RunStarted { .. }));
    }

    #[tokio::test]
    async fn failure_still_cleans_up_flag_locks_and_task() {
        let llm = Arc::new(ScriptedLlm::failing());
        let fx = fixture(llm, ToolRegistry::new());

        let project = Uuid::new_v4();
        let agent = fx.pool.create_agent(project, "backend", None).await.unwrap();
        let task = TaskRecord::new(project, "t", "d", 0, None);
        fx.store.create_task(&task).await.unwrap();
        fx.store.assign_task(task.id, agent.id).await.unwrap();
        fx.locks
            .acquire(project, "src/app.rs", agent.id, LockKind::Write, None)
            .await
            .unwrap();

        let err = fx.pool.execute(agent.id, Some(task.id), "go").await.expect_err("llm down");
        assert!(matches!(err, AgentError::Llm(_)));

        let instance = fx.pool.get_or_create(agent.id).await.unwrap();
        assert!(!instance.is_running());
        assert!(fx.locks.check(project, "src/app.rs").await.is_none());

        let task = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());

        // Fatal runs roll history back, so nothing new is persisted.
        assert!(fx.store.load_history(agent.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn coordinator_run_routes_delegation_actions() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ChatResponse::with_tool_calls(
                None,
                vec![ToolCall::function(
                    "c1",
                    "assign_task",
                    r#"{"role":"backend","title":"build api","description":"d","priority":1}"#,
                )],
            ),
            ChatResponse::text("delegated"),
        ]));
        let fx = fixture(llm, ToolRegistry::new());

        let project = Uuid::new_v4();
        let coordinator = fx
            .pool
            .create_agent(project, crate::roles::COORDINATOR_ROLE, None)
            .await
            .unwrap();
        let worker = fx.pool.create_agent(project, "backend", None).await.unwrap();

        let outcome = fx.pool.execute(coordinator.id, None, "plan").await.unwrap();

        assert_eq!(outcome.final_text, "delegated");
        assert!(outcome.actions[0].result.success, "{:?}", outcome.actions[0].result.error);
        let tasks = fx.store.list_tasks(project).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent_id, Some(worker.id));
        assert_eq!(tasks[0].created_by, Some(coordinator.id));
        assert_eq!(tasks[0].status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn release_flushes_history_and_evicts() {
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::text("x")]));
        let fx = fixture(llm, ToolRegistry::new());
        let project = Uuid::new_v4();
        let agent = fx.pool.create_agent(project, "backend", None).await.unwrap();

        let instance = fx.pool.get_or_create(agent.id).await.unwrap();
        instance
            .history()
            .await
            .push(ChatMessage::new(Role::User, "kept"));
        assert_eq!(fx.pool.pooled_agents(project).await.len(), 1);

        fx.pool.release(agent.id).await.unwrap();
        assert!(fx.pool.pooled_agents(project).await.is_empty());
        let history = fx.store.load_history(agent.id).await.unwrap();
        assert_eq!(history.len(), 1);

        // Releasing an agent that is not pooled is a no-op.
        fx.pool.release(agent.id).await.unwrap();
    }

    #[tokio::test]
    async fn release_refused_mid_run() {
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::text("x")]));
        let fx = fixture(llm, ToolRegistry::new());
        let agent = fx.pool.create_agent(Uuid::new_v4(), "backend", None).await.unwrap();

        let instance = fx.pool.get_or_create(agent.id).await.unwrap();
        assert!(instance.try_begin_run());

        let err = fx.pool.release(agent.id).await.expect_err("running");
        assert!(matches!(err, AgentError::ReleaseWhileRunning(_)));
    }

    #[tokio::test]
    async fn status_snapshot_reflects_store_and_flags() {
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::text("x")]));
        let fx = fixture(llm, ToolRegistry::new());
        let project = Uuid::new_v4();
        let agent = fx.pool.create_agent(project, "backend", None).await.unwrap();

        let task = TaskRecord::new(project, "live", "d", 0, None);
        fx.store.create_task(&task).await.unwrap();
        fx.store.assign_task(task.id, agent.id).await.unwrap();
        fx.store
            .update_task_status(task.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();

        let snapshot = fx.pool.agent_status(agent.id).await.unwrap();
        assert_eq!(snapshot.role, "backend");
        assert_eq!(snapshot.status, "idle");
        assert_eq!(snapshot.current_task_id, Some(task.id));
        assert_eq!(snapshot.current_task_title.as_deref(), Some("live"));
        assert_eq!(snapshot.completed_tasks, 0);

        fx.pool.set_paused(agent.id, true).await.unwrap();
        let snapshot = fx.pool.agent_status(agent.id).await.unwrap();
        assert_eq!(snapshot.status, "paused");

        let err = fx.pool.agent_status(AgentId::new()).await.expect_err("unknown");
        assert!(matches!(err, AgentError::UnknownAgent(_)));
    }
}
