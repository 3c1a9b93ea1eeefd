//! Agent-facing tools for authoring, fixing and restoring plugins.
//!
//! All three return human-readable text the model can reason over rather
//! than structured JSON.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::plugins::{
    CreateOutcome, CreateRequest, LifecycleState, PluginRegistry, TestCase, TestRun, UpdateOutcome,
};
use crate::tools::{Tool, ToolError, ToolOutput, require_param, require_str};

const CREATE_TRACEBACK_LIMIT: usize = 500;
const DEBUG_TRACEBACK_LIMIT: usize = 1500;
const DEBUG_CODE_LIMIT: usize = 2000;

fn truncate(text: &str, limit: usize, marker: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str(marker);
    out
}

/// `[PASS]`/`[FAIL]` lines for a test run. Tracebacks are included when a
/// limit is given; otherwise the failing output is shown.
fn render_test_results(run: &TestRun, traceback_limit: Option<usize>) -> String {
    let mut out = String::from("Test results:\n");
    for result in &run.results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "  [{status}] {}", result.name);
        if result.passed {
            continue;
        }
        if let Some(error) = &result.error {
            let _ = writeln!(out, "    Error: {error}");
        }
        match traceback_limit {
            Some(limit) => {
                if let Some(tb) = &result.traceback {
                    let _ = writeln!(out, "    Traceback:\n{}", truncate(tb, limit, "..."));
                }
            }
            None => {
                if let Some(output) = &result.output {
                    let _ = writeln!(out, "    Output: {output}");
                }
            }
        }
    }
    out
}

fn render_issues(issues: &[String]) -> String {
    let mut out = String::from("Validation issues:\n");
    for issue in issues {
        let _ = writeln!(out, "  - {issue}");
    }
    out
}

fn execution_failed(e: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

// ── create_tool ─────────────────────────────────────────────────────────

pub struct CreateToolTool {
    registry: Arc<PluginRegistry>,
}

impl CreateToolTool {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for CreateToolTool {
    fn name(&self) -> &str {
        "create_tool"
    }

    fn description(&self) -> &str {
        "Create a new tool. The code is checked for unsafe constructs and run against the \
         test cases before it is saved. The code must define a function with the same name \
         as the tool, taking its parameters as keyword arguments and returning a string. \
         Imports, file access and network access are not available."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Tool name in snake_case; must match the function name in the code"
                },
                "description": {
                    "type": "string",
                    "description": "What the tool does"
                },
                "parameters": {
                    "type": "object",
                    "description": "JSON schema of the tool's keyword arguments"
                },
                "code": {
                    "type": "string",
                    "description": "Source defining the tool function"
                },
                "test_cases": {
                    "type": "array",
                    "description": "Each test has a name, input_args (object) and expected_output or expected_contains",
                    "items": {"type": "object"}
                }
            },
            "required": ["name", "description", "parameters", "code", "test_cases"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        let name = require_str(&params, "name")?.to_string();
        let description = require_str(&params, "description")?.to_string();
        let code = require_str(&params, "code")?.to_string();
        let parameters = params
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        let tests = TestCase::list_from_json(require_param(&params, "test_cases")?)
            .map_err(|e| ToolError::InvalidParameters(format!("invalid test_cases: {e}")))?;
        if tests.is_empty() {
            return Err(ToolError::InvalidParameters(
                "at least one test case is required".to_string(),
            ));
        }

        let outcome = self
            .registry
            .create(CreateRequest {
                name: name.clone(),
                description,
                parameters,
                code,
                tests,
            })
            .await
            .map_err(execution_failed)?;

        let text = match outcome {
            CreateOutcome::Enabled { version } => {
                format!("Plugin '{name}' created and enabled ({version})")
            }
            CreateOutcome::PendingReview { version } => {
                format!("Plugin '{name}' created ({version}) and pending review")
            }
            CreateOutcome::ValidationFailed { issues } => {
                format!(
                    "Failed to create tool: Code validation failed\n\n{}",
                    render_issues(&issues)
                )
            }
            CreateOutcome::TestsFailed { run, failure } => {
                let mut text = format!(
                    "Failed to create tool: Tests failed. Plugin saved to pending_review for debugging.\n\n{}",
                    render_test_results(&run, Some(CREATE_TRACEBACK_LIMIT))
                );
                if failure.is_some() {
                    text.push_str("\nUse debug_tool to view full error details and attempt fixes.");
                }
                text
            }
        };

        Ok(ToolOutput::text(text, start.elapsed()))
    }
}

// ── debug_tool ──────────────────────────────────────────────────────────

pub struct DebugToolTool {
    registry: Arc<PluginRegistry>,
}

impl DebugToolTool {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    async fn show_last_failure(&self, name: &str) -> String {
        let Some(failure) = self.registry.last_failure(name).await else {
            return format!("No errors found for tool '{name}'");
        };

        let mut out = format!("=== Debug info for '{name}' ===\n\n");
        let _ = writeln!(out, "Error type: {}", failure.kind);
        let _ = writeln!(
            out,
            "Attempt: {} of {}",
            failure.attempt_number, failure.max_attempts
        );
        let _ = writeln!(out, "Timestamp: {}\n", failure.timestamp.to_rfc3339());
        let _ = writeln!(out, "Error message:\n{}\n", failure.message);

        if !failure.input_args.is_empty() {
            let args = serde_json::Value::Object(failure.input_args.clone());
            let _ = writeln!(out, "Input arguments:\n{args}\n");
        }
        if let Some(expected) = &failure.expected_output {
            let _ = writeln!(out, "Expected output: {expected}");
        }
        if let Some(actual) = &failure.actual_output {
            let _ = writeln!(out, "Actual output: {actual}\n");
        }
        if !failure.traceback.is_empty() {
            let tb = truncate(&failure.traceback, DEBUG_TRACEBACK_LIMIT, "\n... (truncated)");
            let _ = writeln!(out, "Traceback:\n{tb}");
        }

        if let Some(artifact) = self.registry.get(name).await {
            let code = truncate(&artifact.files.code, DEBUG_CODE_LIMIT, "\n... (truncated)");
            let _ = writeln!(out, "\n=== Current code ===\n{code}");
        }

        if failure.attempt_number >= failure.max_attempts {
            let _ = write!(
                out,
                "\n[WARNING] Max attempts ({}) reached. Further fixes need manual intervention.",
                failure.max_attempts
            );
        }
        out
    }

    async fn apply_fix(&self, name: &str, code: &str) -> Result<String, ToolError> {
        let max_attempts = self.registry.config().max_fix_attempts;
        let outcome = self
            .registry
            .update_code(name, code)
            .await
            .map_err(execution_failed)?;

        let text = match outcome {
            UpdateOutcome::Updated { version } => {
                let status = match self.registry.state(name).await {
                    Some(LifecycleState::PendingReview) => {
                        "The tool is in pending_review and requires human approval."
                    }
                    Some(state) if state.is_live() => "The tool is now active and can be used.",
                    _ => "The tool is not currently enabled.",
                };
                format!("Success! Tool '{name}' fixed and updated to {version}.\nAll tests passed. {status}")
            }
            UpdateOutcome::NeedsManualIntervention {
                attempts,
                max_attempts,
            } => format!(
                "Max debug attempts ({max_attempts}) reached for '{name}' after {attempts} failures. \
                 The fix was not applied. Ask the user to reset attempts or roll back."
            ),
            UpdateOutcome::ValidationFailed { issues, attempt } => format!(
                "Fix attempt failed: Code validation failed\n\n{}\nAttempts remaining: {}",
                render_issues(&issues),
                max_attempts.saturating_sub(attempt)
            ),
            UpdateOutcome::TestsFailed { run, attempt, .. } => format!(
                "Fix attempt failed (attempt {attempt})\n\n{}\nAttempts remaining: {}",
                render_test_results(&run, None),
                max_attempts.saturating_sub(attempt)
            ),
        };
        Ok(text)
    }
}

#[async_trait]
impl Tool for DebugToolTool {
    fn name(&self) -> &str {
        "debug_tool"
    }

    fn description(&self) -> &str {
        "Debug a failing tool. Call without fix_code to see the last error, traceback and \
         failing test case. Call with fix_code to apply a fix and re-run the tests. Repeat \
         until the tests pass or the attempt limit is reached."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tool_name": {
                    "type": "string",
                    "description": "Name of the tool to debug"
                },
                "fix_code": {
                    "type": "string",
                    "description": "Replacement code. Omit to view the last error."
                }
            },
            "required": ["tool_name"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let name = require_str(&params, "tool_name")?;

        let text = match params.get("fix_code").and_then(|v| v.as_str()) {
            Some(code) => self.apply_fix(name, code).await?,
            None => self.show_last_failure(name).await,
        };

        Ok(ToolOutput::text(text, start.elapsed()))
    }
}

// ── rollback_tool ───────────────────────────────────────────────────────

pub struct RollbackToolTool {
    registry: Arc<PluginRegistry>,
}

impl RollbackToolTool {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for RollbackToolTool {
    fn name(&self) -> &str {
        "rollback_tool"
    }

    fn description(&self) -> &str {
        "Roll a tool back to an earlier version. Call without version to list the saved \
         versions; call with a label such as 'v1' to restore it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tool_name": {
                    "type": "string",
                    "description": "Name of the tool to roll back"
                },
                "version": {
                    "type": "string",
                    "description": "Version label to restore, e.g. 'v2'. Omit to list versions."
                }
            },
            "required": ["tool_name"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let name = require_str(&params, "tool_name")?;

        let Some(label) = params.get("version").and_then(|v| v.as_str()) else {
            let versions = self.registry.versions(name).await.map_err(execution_failed)?;
            if versions.is_empty() {
                return Ok(ToolOutput::text(
                    format!("No versions found for tool '{name}'"),
                    start.elapsed(),
                ));
            }
            let mut out = format!("=== Versions for '{name}' ===\n\n");
            for version in &versions {
                let _ = writeln!(
                    out,
                    "  {} - {}",
                    version.label,
                    version.created_at.to_rfc3339()
                );
            }
            let _ = write!(
                out,
                "\nTo roll back, call: rollback_tool(tool_name='{name}', version='vN')"
            );
            return Ok(ToolOutput::text(out, start.elapsed()));
        };

        self.registry
            .rollback(name, label)
            .await
            .map_err(execution_failed)?;
        Ok(ToolOutput::text(
            format!("Successfully rolled back '{name}' to {label}"),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::PluginsConfig;
    use crate::hooks::HookBus;
    use crate::tools::ToolRegistry;

    const REVERSE: &str = "def reverse_text(text):\n    return text[::-1]\n";
    const BROKEN: &str = "def reverse_text(text):\n    return text\n";

    async fn registry(auto_approve: bool) -> (TempDir, Arc<PluginRegistry>) {
        let dir = TempDir::new().unwrap();
        let mut config = PluginsConfig::with_dir(dir.path());
        config.auto_approve = auto_approve;
        let registry = PluginRegistry::open(config, Arc::new(ToolRegistry::new()), Arc::new(HookBus::new()))
            .await
            .unwrap();
        (dir, Arc::new(registry))
    }

    fn create_params(code: &str) -> serde_json::Value {
        json!({
            "name": "reverse_text",
            "description": "Reverse a string",
            "parameters": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            },
            "code": code,
            "test_cases": [
                {"name": "basic", "input_args": {"text": "hello"}, "expected_output": "olleh"}
            ]
        })
    }

    async fn run(tool: &dyn Tool, params: serde_json::Value) -> String {
        tool.execute(params).await.unwrap().as_text()
    }

    // ── create_tool ──

    #[tokio::test]
    async fn test_create_tool_enables_with_auto_approve() {
        let (_dir, registry) = registry(true).await;
        let tool = CreateToolTool::new(Arc::clone(&registry));

        let text = run(&tool, create_params(REVERSE)).await;
        assert_eq!(text, "Plugin 'reverse_text' created and enabled (v1)");
        assert_eq!(
            registry.tools().invoke("reverse_text", json!({"text": "abc"})).await,
            "cba"
        );
    }

    #[tokio::test]
    async fn test_create_tool_reports_validation_issues() {
        let (_dir, registry) = registry(false).await;
        let tool = CreateToolTool::new(registry);

        let text = run(&tool, create_params("import os\n\ndef reverse_text(text):\n    return text\n")).await;
        assert!(text.starts_with("Failed to create tool: Code validation failed"));
        assert!(text.contains("  - Forbidden import: os"));
    }

    #[tokio::test]
    async fn test_create_tool_reports_failing_tests() {
        let (_dir, registry) = registry(false).await;
        let tool = CreateToolTool::new(Arc::clone(&registry));

        let text = run(&tool, create_params(BROKEN)).await;
        assert!(text.contains("Plugin saved to pending_review"));
        assert!(text.contains("  [FAIL] basic"));
        assert!(text.contains("Error: Expected 'olleh', got 'hello'"));
        assert!(text.contains("debug_tool"));
        assert_eq!(
            registry.state("reverse_text").await,
            Some(LifecycleState::PendingReview)
        );
    }

    #[tokio::test]
    async fn test_create_tool_requires_tests() {
        let (_dir, registry) = registry(false).await;
        let tool = CreateToolTool::new(registry);

        let mut params = create_params(REVERSE);
        params["test_cases"] = json!([]);
        let err = tool.execute(params).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let err = tool.execute(json!({"name": "x"})).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameters: missing 'description' parameter");
    }

    // ── debug_tool ──

    #[tokio::test]
    async fn test_debug_tool_shows_then_fixes() {
        let (_dir, registry) = registry(false).await;
        run(&CreateToolTool::new(Arc::clone(&registry)), create_params(BROKEN)).await;
        let debug = DebugToolTool::new(Arc::clone(&registry));

        let info = run(&debug, json!({"tool_name": "reverse_text"})).await;
        assert!(info.starts_with("=== Debug info for 'reverse_text' ==="));
        assert!(info.contains("Error type: test_failure"));
        assert!(info.contains("Attempt: 1 of 5"));
        assert!(info.contains("Expected output: olleh"));
        assert!(info.contains("Actual output: hello"));
        assert!(info.contains("=== Current code ===\ndef reverse_text(text):"));

        let fixed = run(&debug, json!({"tool_name": "reverse_text", "fix_code": REVERSE})).await;
        assert!(fixed.starts_with("Success! Tool 'reverse_text' fixed and updated to v1."));
        assert!(fixed.contains("requires human approval"));

        let info = run(&debug, json!({"tool_name": "reverse_text"})).await;
        assert_eq!(info, "No errors found for tool 'reverse_text'");
    }

    #[tokio::test]
    async fn test_debug_tool_counts_down_attempts() {
        let (_dir, registry) = registry(false).await;
        run(&CreateToolTool::new(Arc::clone(&registry)), create_params(BROKEN)).await;
        let debug = DebugToolTool::new(registry);

        let text = run(&debug, json!({"tool_name": "reverse_text", "fix_code": BROKEN})).await;
        assert!(text.starts_with("Fix attempt failed (attempt 2)"));
        assert!(text.contains("    Output: hello"));
        assert!(text.ends_with("Attempts remaining: 3"));
    }

    #[tokio::test]
    async fn test_debug_tool_unknown_plugin() {
        let (_dir, registry) = registry(false).await;
        let debug = DebugToolTool::new(registry);

        let err = debug
            .execute(json!({"tool_name": "ghost", "fix_code": REVERSE}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Execution failed: Plugin 'ghost' not found");
    }

    // ── rollback_tool ──

    #[tokio::test]
    async fn test_rollback_tool_lists_and_restores() {
        let (_dir, registry) = registry(true).await;
        run(&CreateToolTool::new(Arc::clone(&registry)), create_params(REVERSE)).await;
        registry
            .update_code("reverse_text", "def reverse_text(text):\n    return text[::-1] + ''\n")
            .await
            .unwrap();
        let rollback = RollbackToolTool::new(Arc::clone(&registry));

        let listing = run(&rollback, json!({"tool_name": "reverse_text"})).await;
        assert!(listing.starts_with("=== Versions for 'reverse_text' ===\n\n  v1 - "));
        assert!(listing.contains("\n  v2 - "));

        let text = run(&rollback, json!({"tool_name": "reverse_text", "version": "v1"})).await;
        assert_eq!(text, "Successfully rolled back 'reverse_text' to v1");
        assert_eq!(registry.get("reverse_text").await.unwrap().files.code, REVERSE);

        let err = rollback
            .execute(json!({"tool_name": "reverse_text", "version": "v9"}))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Execution failed: Version v9 of 'reverse_text' not found"
        );
    }

    #[tokio::test]
    async fn test_rollback_tool_without_history() {
        let (_dir, registry) = registry(false).await;
        let rollback = RollbackToolTool::new(registry);
        let text = run(&rollback, json!({"tool_name": "reverse_text"})).await;
        assert_eq!(text, "No versions found for tool 'reverse_text'");
    }
}
