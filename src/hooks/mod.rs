//! Multi-point hook bus.
//!
//! Hooks let config rules and plugins observe or veto agent behavior at ten
//! fixed points:
//!
//! ```text
//!   agent run ─► pre_agent_run ─► filter_tools ─► pre_tool_call ─► tool ─► post_tool_call
//!                                                                            │
//!   response ◄─ post_agent_run ◄──────────────────────────────────────────────┘
//!
//!   memory:    pre_memory_store, post_memory_search
//!   heartbeat: heartbeat_collect ─► pre_heartbeat ─► post_heartbeat
//! ```
//!
//! Lower priority runs first. A failing hook never fails the action it hooks.

pub mod builtin;
mod hook;
mod registry;

pub use builtin::load_config_hooks;
pub use hook::{HookCallback, HookInfo, HookPoint, HookRegistration, HookResult};
pub use registry::HookBus;

/// Priority given to hooks that do not set one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Priority given to plugin hook bindings that do not set one, so config
/// rules run ahead of generated code.
pub const PLUGIN_DEFAULT_PRIORITY: i32 = 100;
