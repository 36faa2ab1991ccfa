//! Role-to-system-prompt resolution.
//!
//! Each agent carries a logical role ("coordinator", "backend", ...). The
//! registry maps roles to default system prompts and lets a per-agent custom
//! prompt override the role default. Consumed at instance creation only.

use std::collections::HashMap;

/// Role name of the supervisor agent recognized by the pool.
pub const COORDINATOR_ROLE: &str = "coordinator";

const COORDINATOR_PROMPT: &str = r#"You are a coordinator agent supervising a project team.
You delegate work instead of doing it yourself.

## Delegation Actions
- assign_task: create a sub-task and hand it to an agent with the right role
- send_agent_message: send a directed message to another agent
- get_agent_status: inspect one agent or the whole team
- wait_for_task: block until a delegated task completes or fails

## Rules
1. Break the goal into concrete sub-tasks with clear descriptions
2. Assign each sub-task to the most suitable role
3. Wait for critical dependencies before building on their results
4. Reassign or rephrase a task when a worker fails
5. When everything is done, summarize the overall outcome"#;

const SPECIALIST_PROMPT: &str = r#"You are an autonomous {role} agent with access to tools.
Use tools to accomplish the task - don't just describe what to do.

## Rules
1. Read files before editing them
2. Verify your work when possible
3. If stuck, explain what's blocking you
4. When done, summarize what you accomplished"#;

/// Registry of role default prompts.
pub struct RoleRegistry {
    prompts: HashMap<String, String>,
}

impl RoleRegistry {
    /// Create a registry with the built-in coordinator prompt.
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        prompts.insert(COORDINATOR_ROLE.to_string(), COORDINATOR_PROMPT.to_string());
        Self { prompts }
    }

    /// Set or replace the default prompt for a role.
    pub fn set_role_prompt(&mut self, role: impl Into<String>, prompt: impl Into<String>) {
        self.prompts.insert(role.into(), prompt.into());
    }

    /// Resolve the effective system prompt for an agent.
    ///
    /// A per-agent custom prompt wins over the role default; unknown roles
    /// fall back to the generic specialist prompt.
    pub fn effective_prompt(&self, role: &str, custom_prompt: Option<&str>) -> String {
        if let Some(custom) = custom_prompt {
            if !custom.trim().is_empty() {
                return custom.to_string();
            }
        }
        match self.prompts.get(role) {
            Some(prompt) => prompt.clone(),
            None => SPECIALIST_PROMPT.replace("{role}", role),
        }
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
