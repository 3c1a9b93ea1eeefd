//! Runtime-generated capabilities.
//!
//! Candidate code flows through a fixed pipeline before the agent can call
//! it:
//!
//! ```text
//!   candidate ─► CodeValidator ─► TestRunner ─► VersionStore.save ─► PluginRegistry
//!                  (static)        (sandbox)      (v1, v2, ...)        │
//!                                                                      ├─► ToolRegistry
//!                                                                      └─► HookBus
//! ```
//!
//! The [`PluginRegistry`] owns the lifecycle (see [`lifecycle`]) and is the
//! only component that touches the live registries.

pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod runner;
pub mod store;
pub mod validator;
pub mod versions;

pub use lifecycle::{Action, LifecycleState, Membership};
pub use manifest::{
    Capability, FailureKind, FailureRecord, HookBinding, PluginManifest, TestCase, ToolDefinition,
    TrustLevel,
};
pub use registry::{
    CreateOutcome, CreateRequest, InstallOutcome, PendingPlugin, PluginRegistry, PluginSummary,
    UpdateOutcome,
};
pub use runner::{TestResult, TestRun, TestRunner};
pub use validator::{CodeValidator, ValidationReport};
pub use versions::{VersionInfo, VersionStore};
