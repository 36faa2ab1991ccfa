//! Tool system for the reasoning loop.
//!
//! Tools are the "hands and eyes" of an agent. The orchestration core only
//! depends on their contract: a named operation takes JSON arguments and a
//! workspace directory and reports a structured [`ActionResult`]. Concrete
//! sandboxed implementations (file I/O, shell, search, code execution) are
//! registered by the embedder; the registry ships empty.
//!
//! ## Failure contract
//!
//! Ordinary failures come back as `ActionResult { success: false, .. }` so the
//! reasoning loop can feed them to the LLM and let it adapt. `Err` from
//! [`Tool::execute`] is reserved for programmer errors; the registry turns an
//! unknown tool name into a typed failure result rather than panicking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{FunctionDefinition, ToolDefinition};

/// Structured result of one tool action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded
    pub success: bool,
    /// Short human-readable summary
    pub summary: String,
    /// Optional longer detail text (tool output, created ids, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Optional warning that did not prevent success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Error message when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// Create a successful result.
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            detail: None,
            warning: None,
            error: None,
        }
    }

    /// Create a failed result.
    pub fn fail(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            detail: None,
            warning: None,
            error: Some(error.into()),
        }
    }

    /// Attach detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a warning.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Serialize for feedback to the LLM as a tool message body.
    pub fn to_feedback(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.summary.clone())
    }
}

/// Result of resolving a path relative to the workspace.
///
/// Relative paths resolve from the workspace directory; absolute paths pass
/// through. Tool implementations use this to confine and annotate access.
#[derive(Debug, Clone)]
pub struct PathResolution {
    /// The original path string provided by the agent.
    pub original: String,
    /// The fully resolved absolute path.
    pub resolved: PathBuf,
    /// Whether the resolved path is outside the workspace.
    pub is_outside_workspace: bool,
    /// Whether the original path was absolute.
    pub was_absolute: bool,
}

impl PathResolution {
    /// Format a note about path resolution for tool output.
    ///
    /// Empty for the normal case (relative path inside the workspace).
    pub fn note(&self) -> String {
        if self.was_absolute {
            format!("[absolute path: {}]", self.resolved.display())
        } else if self.is_outside_workspace {
            format!("[resolved to: {}]", self.resolved.display())
        } else {
            String::new()
        }
    }
}

/// Resolve a path relative to the workspace.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathResolution {
    let path = Path::new(path_str);
    let was_absolute = path.is_absolute();

    let resolved = if was_absolute {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    // Canonicalize for accurate comparison (handles .., symlinks, etc.)
    let canonical_resolved = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    let canonical_workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let is_outside_workspace = !canonical_resolved.starts_with(&canonical_workspace);

    PathResolution {
        original: path_str.to_string(),
        resolved,
        is_outside_workspace,
        was_absolute,
    }
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// `workspace` is the default directory for relative paths. Ordinary
    /// failures must be reported via `ActionResult::fail`, not `Err`.
    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<ActionResult>;
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry. Embedders register their sandboxed tools.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its own name, replacing any previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        tracing::debug!("Registering tool '{}'", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all available tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    /// Get tool schemas in LLM-compatible format.
    pub fn get_tool_schemas(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect()
    }

    /// Invoke a tool by name.
    ///
    /// An unknown name yields a failed `ActionResult` so one bad call never
    /// aborts the sibling calls in the same batch. A tool `Err` (programmer
    /// error) is also folded into a failed result here; the reasoning loop
    /// treats every dispatch outcome as feedback.
    pub async fn invoke(&self, name: &str, args: Value, workspace: &Path) -> ActionResult {
        let Some(tool) = self.tools.get(name) else {
            return ActionResult::fail(
                format!("Unknown action '{}'", name),
                format!("no tool registered under '{}'", name),
            );
        };

        match tool.execute(args, workspace).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Tool '{}' returned an internal error: {}", name, e);
                ActionResult::fail(format!("Tool '{}' failed", name), e.to_string())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo back the provided text"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<ActionResult> {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Ok(ActionResult::ok("echoed").with_detail(text))
        }
    }

    #[tokio::test]
    async fn invoke_dispatches_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let result = registry
            .invoke("echo", json!({"text": "hi"}), Path::new("."))
            .await;
        assert!(result.success);
        assert_eq!(result.detail.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn unknown_action_is_a_failed_result_not_a_panic() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("nope", json!({}), Path::new(".")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[test]
    fn schemas_cover_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let schemas = registry.get_tool_schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].function.name, "echo");
    }

    #[test]
    fn relative_paths_resolve_inside_workspace() {
        let workspace = Path::new("/tmp");
        let resolution = resolve_path("notes/a.txt", workspace);
        assert!(!resolution.was_absolute);
        assert_eq!(resolution.resolved, PathBuf::from("/tmp/notes/a.txt"));
        // The normal case carries no annotation.
        assert!(resolution.note().is_empty());
    }

    #[test]
    fn unusual_paths_are_annotated_for_tool_output() {
        let workspace = tempfile::tempdir().expect("tempdir");

        let absolute = resolve_path("/etc/hosts", workspace.path());
        assert!(absolute.was_absolute);
        assert!(absolute.note().contains("absolute path"));

        let escaped = resolve_path("..", workspace.path());
        assert!(escaped.is_outside_workspace);
        assert!(escaped.note().contains("resolved to"));
    }
}
