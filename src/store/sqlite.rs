//! SQLite-backed state store.
//!
//! One connection guarded by a mutex; every status mutation is
//! read-apply-write under that mutex so the task state machine cannot be
//! raced by a second caller.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AgentRecord, StateStore, StoreError};
use crate::agents::AgentId;
use crate::llm::ChatMessage;
use crate::task::{AgentMessage, TaskError, TaskRecord, TaskStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    role TEXT NOT NULL,
    custom_prompt TEXT,
    history TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id, created_at);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    agent_id TEXT,
    created_by TEXT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(project_id, status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id, status);

CREATE TABLE IF NOT EXISTS agent_messages (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    content TEXT NOT NULL,
    message_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_to ON agent_messages(to_agent, created_at);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `base_dir/crew.db`.
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create store dir: {}", e)))?;
        let db_path = base_dir.join("crew.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn write_task(conn: &Connection, task: &TaskRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO tasks
             (id, project_id, agent_id, created_by, title, description, priority,
              status, result, error, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id.to_string(),
                task.project_id.to_string(),
                task.agent_id.map(|a| a.to_string()),
                task.created_by.map(|a| a.to_string()),
                task.title,
                task.description,
                task.priority,
                task.status.as_str(),
                task.result,
                task.error,
                task.created_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn read_task(conn: &Connection, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let row: Option<TaskRow> = conn
            .query_row(
                "SELECT id, project_id, agent_id, created_by, title, description, priority,
                        status, result, error, created_at, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::into_record).transpose()
    }
}

/// Raw row shape; conversion to domain types happens outside the closure so
/// parse failures surface as `StoreError`, not rusqlite conversion panics.
struct TaskRow {
    id: String,
    project_id: String,
    agent_id: Option<String>,
    created_by: Option<String>,
    title: String,
    description: String,
    priority: i64,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            agent_id: row.get(2)?,
            created_by: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            priority: row.get(6)?,
            status: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        Ok(TaskRecord {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            agent_id: self.agent_id.as_deref().map(parse_agent_id).transpose()?,
            created_by: self.created_by.as_deref().map(parse_agent_id).transpose()?,
            title: self.title,
            description: self.description,
            priority: self.priority,
            status: self.status.parse()?,
            result: self.result,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("Bad uuid '{}': {}", s, e)))
}

fn parse_agent_id(s: &str) -> Result<AgentId, StoreError> {
    parse_uuid(s).map(AgentId::from_uuid)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("Bad timestamp '{}': {}", s, e)))
}

#[async_trait]
impl StateStore for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agents (id, project_id, role, custom_prompt, history, created_at)
             VALUES (?1, ?2, ?3, ?4, '[]', ?5)
             ON CONFLICT(id) DO UPDATE SET
                 project_id = excluded.project_id,
                 role = excluded.role,
                 custom_prompt = excluded.custom_prompt",
            params![
                record.id.to_string(),
                record.project_id.to_string(),
                record.role,
                record.custom_prompt,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String, Option<String>, String)> = conn
            .query_row(
                "SELECT id, project_id, role, custom_prompt, created_at
                 FROM agents WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, project_id, role, custom_prompt, created_at)| {
            Ok::<_, StoreError>(AgentRecord {
                id: parse_agent_id(&id)?,
                project_id: parse_uuid(&project_id)?,
                role,
                custom_prompt,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    async fn list_agents(&self, project_id: Uuid) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, role, custom_prompt, created_at
             FROM agents WHERE project_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut agents = Vec::new();
        for row in rows {
            let (id, project_id, role, custom_prompt, created_at) = row?;
            agents.push(AgentRecord {
                id: parse_agent_id(&id)?,
                project_id: parse_uuid(&project_id)?,
                role,
                custom_prompt,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(agents)
    }

    async fn load_history(&self, id: AgentId) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT history FROM agents WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_history(&self, id: AgentId, history: &[ChatMessage]) -> Result<(), StoreError> {
        let json = serde_json::to_string(history)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE agents SET history = ?2 WHERE id = ?1",
            params![id.to_string(), json],
        )?;
        if updated == 0 {
            return Err(StoreError::AgentNotFound(id));
        }
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        Self::write_task(&conn, task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Self::read_task(&conn, id)
    }

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, agent_id, created_by, title, description, priority,
                    status, result, error, created_at, started_at, completed_at
             FROM tasks WHERE project_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], TaskRow::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_record()?);
        }
        Ok(tasks)
    }

    async fn assign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError> {
        let conn = self.conn.lock().await;
        let mut task = Self::read_task(&conn, id)?.ok_or(StoreError::TaskNotFound(id))?;
        task.assign(agent_id)?;
        Self::write_task(&conn, &task)?;
        Ok(task)
    }

    async fn reassign_task(&self, id: Uuid, agent_id: AgentId) -> Result<TaskRecord, StoreError> {
        let conn = self.conn.lock().await;
        let mut task = Self::read_task(&conn, id)?.ok_or(StoreError::TaskNotFound(id))?;
        task.reassign(agent_id);
        Self::write_task(&conn, &task)?;
        Ok(task)
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        let conn = self.conn.lock().await;
        let mut task = Self::read_task(&conn, id)?.ok_or(StoreError::TaskNotFound(id))?;
        task.apply_status(status, result, error)?;
        Self::write_task(&conn, &task)?;
        Ok(task)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        match Self::read_task(&conn, id)? {
            None => Ok(false),
            Some(task) if !task.can_delete() => {
                Err(StoreError::Task(TaskError::DeleteWhileInProgress))
            }
            Some(_) => {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
                Ok(true)
            }
        }
    }

    async fn next_ready_task(&self, project_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<TaskRow> = conn
            .query_row(
                "SELECT id, project_id, agent_id, created_by, title, description, priority,
                        status, result, error, created_at, started_at, completed_at
                 FROM tasks
                 WHERE project_id = ?1 AND status IN ('pending', 'assigned')
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1",
                params![project_id.to_string()],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::into_record).transpose()
    }

    async fn completed_task_count(&self, agent_id: AgentId) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE agent_id = ?1 AND status = 'completed'",
            params![agent_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn insert_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_messages
             (id, project_id, from_agent, to_agent, content, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.project_id.to_string(),
                message.from_agent.to_string(),
                message.to_agent.to_string(),
                message.content,
                message.message_type.as_str(),
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list_messages_for(&self, agent_id: AgentId) -> Result<Vec<AgentMessage>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, from_agent, to_agent, content, message_type, created_at
             FROM agent_messages WHERE to_agent = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, project_id, from_agent, to_agent, content, message_type, created_at) = row?;
            messages.push(AgentMessage {
                id: parse_uuid(&id)?,
                project_id: parse_uuid(&project_id)?,
                from_agent: parse_agent_id(&from_agent)?,
                to_agent: parse_agent_id(&to_agent)?,
                content,
                message_type: message_type.parse()?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::behavior_tests;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("crewkit=debug")
            .with_test_writer()
            .try_init();
    }

    #[tokio::test]
    async fn sqlite_store_behavior() {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().to_path_buf())
            .await
            .expect("open sqlite store");
        assert!(store.is_persistent());
        behavior_tests::run_all(&store).await;
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = AgentRecord::new(Uuid::new_v4(), "backend");

        {
            let store = SqliteStore::new(dir.path().to_path_buf()).await.unwrap();
            store.upsert_agent(&record).await.unwrap();
            store
                .save_history(
                    record.id,
                    &[ChatMessage::new(crate::llm::Role::User, "persist me")],
                )
                .await
                .unwrap();
        }

        let store = SqliteStore::new(dir.path().to_path_buf()).await.unwrap();
        let history = store.load_history(record.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content.as_deref(), Some("persist me"));
    }
}
