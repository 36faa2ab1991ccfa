//! The bounded tool-calling reasoning loop.
//!
//! # Algorithm
//! 1. Append the prompt as a user turn
//! 2. Call the LLM with system prompt + history + declared tool schemas
//! 3. Append the assistant turn (even if its text is empty)
//! 4. No requested actions: the loop terminates with the final text
//! 5. Otherwise dispatch each action, append one tool message per call
//!    keyed to its call id, and go to 2 with the follow-up response
//! 6. After `max_iterations` responses that all request actions, fail
//!    with `LoopExhausted` - a fatal signal the caller must not retry
//!
//! A malformed action argument payload produces a failed result for that
//! call only; sibling calls in the same batch still run. A transport failure
//! fails the whole run and rolls history back to its pre-run length so a
//! retried run starts clean.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AgentError;
use crate::llm::{ChatMessage, LlmClient, Role, ToolCall, ToolDefinition};
use crate::tools::{ActionResult, ToolRegistry};

/// One dispatched action and its structured result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub call_id: String,
    pub name: String,
    pub result: ActionResult,
}

/// Result of one full reasoning run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The terminal free-text response
    pub final_text: String,
    /// Every action dispatched during the run, in order
    pub actions: Vec<ActionLogEntry>,
}

/// Routes a single requested action to a handler.
///
/// The plain implementation wraps the tool registry; the coordinator
/// implementation intercepts delegation actions first.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, name: &str, args: Value) -> ActionResult;
}

/// Dispatcher that resolves every action through the tool registry.
pub struct ToolDispatcher {
    tools: Arc<ToolRegistry>,
    workspace: PathBuf,
}

impl ToolDispatcher {
    pub fn new(tools: Arc<ToolRegistry>, workspace: PathBuf) -> Self {
        Self { tools, workspace }
    }
}

#[async_trait]
impl ActionDispatcher for ToolDispatcher {
    async fn dispatch(&self, name: &str, args: Value) -> ActionResult {
        self.tools.invoke(name, args, &self.workspace).await
    }
}

/// Drives one agent's think/act cycle against the reasoning service.
pub struct ReasoningLoop {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_iterations: usize,
}

impl ReasoningLoop {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            llm,
            model: model.into(),
            max_iterations,
        }
    }

    /// Run the loop, mutating `history` in place.
    ///
    /// On a fatal error (`Llm`, `LoopExhausted`) history is truncated back to
    /// its length at entry.
    pub async fn run(
        &self,
        system_prompt: &str,
        history: &mut Vec<ChatMessage>,
        prompt: &str,
        schemas: &[ToolDefinition],
        dispatcher: &dyn ActionDispatcher,
    ) -> Result<RunOutcome, AgentError> {
        let checkpoint = history.len();
        history.push(ChatMessage::new(Role::User, prompt));

        let mut actions = Vec::new();

        for iteration in 0..self.max_iterations {
            tracing::debug!("Reasoning loop iteration {}", iteration + 1);

            let response = match self
                .llm
                .chat_completion(&self.model, &with_system(system_prompt, history), Some(schemas))
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    history.truncate(checkpoint);
                    return Err(AgentError::Llm(e.to_string()));
                }
            };

            // The assistant turn is appended even when its text is empty, to
            // preserve ordering for the service's context window.
            history.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let calls = response.tool_calls.unwrap_or_default();
            if calls.is_empty() {
                return Ok(RunOutcome {
                    final_text: response.content.unwrap_or_default(),
                    actions,
                });
            }

            for call in &calls {
                let result = self.dispatch_call(call, dispatcher).await;
                actions.push(ActionLogEntry {
                    call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    result: result.clone(),
                });
                history.push(ChatMessage::tool_result(&call.id, result.to_feedback()));
            }
        }

        history.truncate(checkpoint);
        Err(AgentError::LoopExhausted(self.max_iterations))
    }

    /// Resolve one requested action. A malformed argument payload never
    /// aborts the batch; it becomes this call's failed result.
    async fn dispatch_call(&self, call: &ToolCall, dispatcher: &dyn ActionDispatcher) -> ActionResult {
        let raw = call.function.arguments.trim();
        let args: Value = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(e) => {
                    return ActionResult::fail(
                        format!("Malformed arguments for '{}'", call.function.name),
                        format!("argument payload is not valid JSON: {}", e),
                    );
                }
            }
        };
        dispatcher.dispatch(&call.function.name, args).await
    }
}

fn with_system(system_prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::new(Role::System, system_prompt));
    messages.extend_from_slice(history);
    messages
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::llm::ChatResponse;

    fn reasoning_loop(llm: Arc<dyn LlmClient>, cap: usize) -> ReasoningLoop {
        ReasoningLoop::new(llm, "test-model", cap)
    }

    #[tokio::test]
    async fn terminates_on_first_actionless_response() {
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::text("all done")]));
        let reasoning = reasoning_loop(llm.clone(), 10);
        let mut history = Vec::new();

        let outcome = reasoning
            .run("sys", &mut history, "do it", &[], &OkDispatcher)
            .await
            .expect("run succeeds");

        assert_eq!(outcome.final_text, "all done");
        assert!(outcome.actions.is_empty());
        assert_eq!(llm.call_count(), 1);
        // user turn + assistant turn
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn tool_calls_are_dispatched_and_fed_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ChatResponse::with_tool_calls(
                Some("working".to_string()),
                vec![ToolCall::function("call_1", "write_file", r#"{"path":"a"}"#)],
            ),
            ChatResponse::text("finished"),
        ]));
        let reasoning = reasoning_loop(llm.clone(), 10);
        let mut history = Vec::new();

        let outcome = reasoning
            .run("sys", &mut history, "do it", &[], &OkDispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "finished");
        assert_eq!(outcome.actions.len(), 1);
        assert!(outcome.actions[0].result.success);
        assert_eq!(llm.call_count(), 2);

        // user, assistant(+calls), tool result, assistant final
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn exhausts_after_exactly_the_iteration_cap() {
        // Always requests an action: the loop must stop at the cap.
        let llm = Arc::new(ScriptedLlm::new(vec![ChatResponse::with_tool_calls(
            None,
            vec![ToolCall::function("c", "spin", "{}")],
        )]));
        let reasoning = reasoning_loop(llm.clone(), 4);
        let mut history = Vec::new();

        let err = reasoning
            .run("sys", &mut history, "go", &[], &OkDispatcher)
            .await
            .expect_err("must exhaust");
        assert!(matches!(err, AgentError::LoopExhausted(4)));
        assert_eq!(llm.call_count(), 4);
        // Fatal exit rolls history back to its pre-run state.
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn malformed_arguments_fail_only_that_call() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ChatResponse::with_tool_calls(
                None,
                vec![
                    ToolCall::function("bad", "write_file", "{not json"),
                    ToolCall::function("good", "read_file", r#"{"path":"a"}"#),
                ],
            ),
            ChatResponse::text("done"),
        ]));
        let reasoning = reasoning_loop(llm, 10);
        let mut history = Vec::new();

        let outcome = reasoning
            .run("sys", &mut history, "go", &[], &OkDispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.actions.len(), 2);
        assert!(!outcome.actions[0].result.success);
        assert!(outcome.actions[0]
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("not valid JSON"));
        assert!(outcome.actions[1].result.success);
    }

    #[tokio::test]
    async fn transport_failure_rolls_back_the_prompt_turn() {
        let llm = Arc::new(ScriptedLlm::failing());
        let reasoning = reasoning_loop(llm, 10);
        let mut history = vec![ChatMessage::new(Role::User, "earlier")];

        let err = reasoning
            .run("sys", &mut history, "go", &[], &OkDispatcher)
            .await
            .expect_err("transport failure is fatal");
        assert!(matches!(err, AgentError::Llm(_)));
        // Only the pre-existing turn survives.
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content.as_deref(), Some("earlier"));
    }

    #[tokio::test]
    async fn empty_assistant_text_is_still_appended() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ChatResponse::with_tool_calls(None, vec![ToolCall::function("c", "t", "{}")]),
            ChatResponse::text("done"),
        ]));
        let reasoning = reasoning_loop(llm, 10);
        let mut history = Vec::new();

        reasoning
            .run("sys", &mut history, "go", &[], &FailingDispatcher)
            .await
            .unwrap();

        assert_eq!(history[1].role, Role::Assistant);
        assert!(history[1].content.is_none());
        assert!(history[1].tool_calls.is_some());
    }
}
