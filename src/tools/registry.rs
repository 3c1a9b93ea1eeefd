//! The callable map the agent consults every turn.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::hooks::{HookBus, HookResult};
use crate::tools::tool::{Tool, ToolError, ToolOutput, ToolSchema};

struct Entry {
    tool: Arc<dyn Tool>,
    /// Artifact that registered the tool. `None` for host tools.
    owner: Option<String>,
}

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a host tool, replacing any tool of the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if let Some(Entry {
            owner: Some(owner), ..
        }) = tools.get(&name)
        {
            tracing::warn!(tool = %name, owner = %owner, "Host tool replaces a plugin tool");
        }
        tools.insert(name.clone(), Entry { tool, owner: None });
        tracing::debug!(tool = %name, "Registered tool");
    }

    /// Register a tool on behalf of an artifact. Names held by the host or
    /// by another artifact are refused.
    pub async fn register_for(&self, owner: &str, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let mut tools = self.tools.write().await;
        let name = tool.name().to_string();
        if let Some(holder) = holder_other_than(&tools, &name, owner) {
            return Err(ToolError::NameTaken { name, holder });
        }
        tools.insert(
            name.clone(),
            Entry {
                tool,
                owner: Some(owner.to_string()),
            },
        );
        tracing::debug!(tool = %name, owner = %owner, "Registered tool");
        Ok(())
    }

    /// Swap everything `owner` registered for `replacement` in one step.
    /// On a name conflict nothing changes.
    pub async fn replace_owned(&self, owner: &str, replacement: Vec<Arc<dyn Tool>>) -> Result<(), ToolError> {
        let mut tools = self.tools.write().await;
        for tool in &replacement {
            if let Some(holder) = holder_other_than(&tools, tool.name(), owner) {
                return Err(ToolError::NameTaken {
                    name: tool.name().to_string(),
                    holder,
                });
            }
        }
        tools.retain(|_, entry| entry.owner.as_deref() != Some(owner));
        for tool in replacement {
            let name = tool.name().to_string();
            tracing::debug!(tool = %name, owner = %owner, "Registered tool");
            tools.insert(
                name,
                Entry {
                    tool,
                    owner: Some(owner.to_string()),
                },
            );
        }
        Ok(())
    }

    /// Who other than `owner` holds `name`, if anyone.
    pub async fn holder_of(&self, name: &str, owner: &str) -> Option<String> {
        holder_other_than(&*self.tools.read().await, name, owner)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name).is_some();
        if removed {
            tracing::debug!(tool = %name, "Unregistered tool");
        }
        removed
    }

    /// Remove every tool registered by `owner`, returning their names.
    pub async fn unregister_owner(&self, owner: &str) -> Vec<String> {
        let mut tools = self.tools.write().await;
        let names: Vec<String> = tools
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            tools.remove(name);
        }
        if !names.is_empty() {
            tracing::debug!(owner = %owner, count = names.len(), "Unregistered artifact tools");
        }
        names
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.tool))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the tools registered by `owner`, sorted.
    pub async fn owned_by(&self, owner: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Schemas of every tool, sorted by name.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .await
            .values()
            .map(|entry| entry.tool.schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Function-calling definitions for every tool, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<serde_json::Value> {
        self.schemas()
            .await
            .iter()
            .map(ToolSchema::to_function_definition)
            .collect()
    }

    /// Definitions after the bus's `filter_tools` hooks have run.
    pub async fn filtered_definitions(&self, hooks: &Arc<HookBus>) -> Vec<serde_json::Value> {
        let definitions = self.tool_definitions().await;
        let bus = Arc::clone(hooks);
        dispatch_hooks(move || bus.run_filter_tools(definitions))
            .await
            .unwrap_or_default()
    }

    /// Execute a tool under its own timeout.
    pub async fn execute(&self, name: &str, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tracing::debug!(tool = %name, params = %params, "Tool call started");

        let timeout = tool.execution_timeout();
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, tool.execute(params)).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    tool = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool call succeeded"
                );
                Ok(output)
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    tool = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Tool call failed"
                );
                Err(e)
            }
            Err(_) => {
                tracing::debug!(
                    tool = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_secs = timeout.as_secs(),
                    "Tool call timed out"
                );
                Err(ToolError::Timeout(timeout))
            }
        }
    }

    /// Invoke a tool and render the outcome as text. Failures become
    /// `Error: ...` strings.
    pub async fn invoke(&self, name: &str, params: serde_json::Value) -> String {
        match self.execute(name, params).await {
            Ok(output) => output.as_text(),
            Err(e) => format!("Error: {e}"),
        }
    }

    /// [`invoke`](Self::invoke) wrapped in the bus's `pre_tool_call` and
    /// `post_tool_call` hooks. A blocking pre-hook replaces the call.
    pub async fn invoke_with_hooks(&self, hooks: &Arc<HookBus>, name: &str, params: serde_json::Value) -> String {
        let verdict = {
            let (bus, tool, args) = (Arc::clone(hooks), name.to_string(), params.clone());
            dispatch_hooks(move || bus.run_pre_tool_call(&tool, &args))
                .await
                .unwrap_or_else(|| HookResult::block("hook dispatch failed"))
        };

        let (text, success) = if verdict.blocked {
            (format!("Error: {}", ToolError::Blocked(verdict.message)), false)
        } else {
            match self.execute(name, params.clone()).await {
                Ok(output) => (output.as_text(), true),
                Err(e) => (format!("Error: {e}"), false),
            }
        };

        let (bus, tool, result) = (Arc::clone(hooks), name.to_string(), text.clone());
        dispatch_hooks(move || bus.run_post_tool_call(&tool, &params, &result, success)).await;
        text
    }
}

/// Run synchronous hook dispatch on the blocking pool. Script hooks hold
/// their thread for up to the hook timeout.
async fn dispatch_hooks<T, F>(dispatch: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(dispatch).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Hook dispatch task failed: {}", e);
            None
        }
    }
}

fn holder_other_than(tools: &HashMap<String, Entry>, name: &str, owner: &str) -> Option<String> {
    match &tools.get(name)?.owner {
        None => Some("the host".to_string()),
        Some(other) if other != owner => Some(format!("plugin '{other}'")),
        Some(_) => None,
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
