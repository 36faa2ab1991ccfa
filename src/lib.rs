//! # crewkit
//!
//! Orchestration core for cooperating AI agent workers.
//!
//! This library provides:
//! - A bounded tool-calling reasoning loop driving one agent's think/act cycle
//! - An instance pool enforcing one-run-at-a-time per agent
//! - Cooperative read/write file locks with TTL expiry
//! - A task state machine with monotonic started/completed stamps
//! - A coordinator delegation protocol (assign, message, status, wait)
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            AgentPool             │
//!        │  (get_or_create / execute /      │
//!        │   release, running-flag gate)    │
//!        └───────┬──────────────┬───────────┘
//!                │              │
//!                ▼              ▼
//!     ┌───────────────┐   ┌───────────────┐
//!     │ ReasoningLoop │   │ LockRegistry  │
//!     │ (LLM ⇄ tools) │   │ (TTL locks)   │
//!     └───────┬───────┘   └───────────────┘
//!             │
//!             ▼
//!     ┌───────────────┐
//!     │ ToolRegistry  │──── CoordinatorDispatch intercepts
//!     │ (dispatch)    │     assign_task / send_agent_message /
//!     └───────────────┘     get_agent_status / wait_for_task
//! ```
//!
//! ## Run Flow
//! 1. `AgentPool::execute(agent_id, task_id, prompt)` gates on the running flag
//! 2. The reasoning loop sends history + tool schemas to the LLM client
//! 3. Requested tool calls are dispatched; results fed back as tool messages
//! 4. On a no-tool-call response the loop terminates with the final text
//! 5. The pool persists history, releases the agent's locks, updates the task
//!
//! The HTTP transport, browser UI, concrete LLM clients, and sandboxed tool
//! implementations live outside this crate; it depends only on their traits.
//!
//! ## Modules
//! - `agents`: instance pool, reasoning loop, coordinator dispatch
//! - `task`: task records, status machine, directed agent messages
//! - `locks`: cooperative file locking with expiry
//! - `store`: pluggable persistence (memory, SQLite)
//! - `events`: fan-out status/task/lock events

pub mod agents;
pub mod config;
pub mod events;
pub mod llm;
pub mod locks;
pub mod roles;
pub mod store;
pub mod task;
pub mod tools;

pub use agents::{AgentError, AgentId, AgentPool, RunOutcome};
pub use config::Config;
pub use events::{AgentEvent, EventBroadcaster};
pub use locks::{LockKind, LockRegistry};
pub use task::{TaskRecord, TaskStatus};
