//! Live state of one logical agent.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

use super::AgentId;
use crate::llm::ChatMessage;

/// One logical worker's live state: conversation history plus run flags.
///
/// The running flag is the sole concurrency gate for the agent: it is flipped
/// with a compare-exchange so two concurrent execute calls can never both
/// pass the check. History is append-only during a run and only one run is in
/// flight at a time, so entries are strictly ordered.
pub struct AgentInstance {
    pub id: AgentId,
    pub project_id: Uuid,
    pub role: String,
    pub system_prompt: String,
    running: AtomicBool,
    paused: AtomicBool,
    history: Mutex<Vec<ChatMessage>>,
}

impl AgentInstance {
    pub fn new(
        id: AgentId,
        project_id: Uuid,
        role: impl Into<String>,
        system_prompt: impl Into<String>,
        history: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id,
            project_id,
            role: role.into(),
            system_prompt: system_prompt.into(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            history: Mutex::new(history),
        }
    }

    /// Atomically claim the running flag. Returns false if a run is already
    /// in flight; the losing caller must not touch the instance.
    pub fn try_begin_run(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the running flag at the end of a run (success or failure).
    pub fn end_run(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Advisory pause marker. Callers may check it before execute; the core
    /// never interrupts an in-flight run because of it.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Exclusive access to the conversation history.
    pub async fn history(&self) -> tokio::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.history.lock().await
    }

    /// Clone of the current history (for persistence and inspection).
    pub async fn history_snapshot(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> AgentInstance {
        AgentInstance::new(AgentId::new(), Uuid::new_v4(), "backend", "prompt", vec![])
    }

    #[test]
    fn running_flag_is_claimed_once() {
        let agent = instance();
        assert!(agent.try_begin_run());
        assert!(!agent.try_begin_run());
        agent.end_run();
        assert!(agent.try_begin_run());
    }

    #[test]
    fn pause_is_independent_of_running() {
        let agent = instance();
        agent.set_paused(true);
        assert!(agent.is_paused());
        assert!(agent.try_begin_run());
        assert!(agent.is_paused());
    }
}
