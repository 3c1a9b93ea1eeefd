//! Tool system.
//!
//! Tools are the agent's callable surface. Host tools and plugin tools
//! share one [`ToolRegistry`]; plugin tools are added and removed only by
//! the plugin registry.

pub mod builtin;

mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{
    Tool, ToolError, ToolOutput, ToolSchema, require_param, require_str, validate_tool_schema,
};
