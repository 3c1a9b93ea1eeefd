//! toolforge: runtime-generated agent capabilities.
//!
//! An agent proposes code for a new tool. toolforge vets the source against
//! a denylist, runs it against its declared tests inside a restricted
//! interpreter, snapshots every accepted version, and only then makes it
//! callable through the [`tools::ToolRegistry`] or observable on the
//! [`hooks::HookBus`].
//!
//! ```text
//!   ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//!   │ CodeValidator│──▶│  TestRunner   │──▶│ VersionStore │
//!   └──────────────┘   │  (sandbox)    │   └──────┬───────┘
//!                      └───────────────┘          │
//!                                         ┌───────▼────────┐
//!                                         │ PluginRegistry │
//!                                         └───┬────────┬───┘
//!                                             │        │
//!                                   ┌─────────▼──┐  ┌──▼──────┐
//!                                   │ToolRegistry│  │ HookBus │
//!                                   └────────────┘  └─────────┘
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod hooks;
pub mod plugins;
pub mod sandbox;
pub mod testing;
pub mod tools;
