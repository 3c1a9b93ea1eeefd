//! Built-in tools that come with the agent.

mod plugin_tools;

use std::sync::Arc;

pub use plugin_tools::{CreateToolTool, DebugToolTool, RollbackToolTool};

use crate::plugins::PluginRegistry;
use crate::tools::ToolRegistry;

/// Register the tools the agent uses to author and maintain plugins.
pub async fn register_plugin_tools(tools: &ToolRegistry, plugins: Arc<PluginRegistry>) {
    tools
        .register(Arc::new(CreateToolTool::new(Arc::clone(&plugins))))
        .await;
    tools
        .register(Arc::new(DebugToolTool::new(Arc::clone(&plugins))))
        .await;
    tools.register(Arc::new(RollbackToolTool::new(plugins))).await;
    tracing::debug!("Registered plugin authoring tools");
}
