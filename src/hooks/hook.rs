//! Hook points, callback shapes and registrations.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HookError;

/// Points in the agent loop where hooks can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    PreToolCall,
    PostToolCall,
    FilterTools,
    PreAgentRun,
    PostAgentRun,
    PreMemoryStore,
    PostMemorySearch,
    PreHeartbeat,
    PostHeartbeat,
    HeartbeatCollect,
}

impl HookPoint {
    pub const ALL: [HookPoint; 10] = [
        HookPoint::PreToolCall,
        HookPoint::PostToolCall,
        HookPoint::FilterTools,
        HookPoint::PreAgentRun,
        HookPoint::PostAgentRun,
        HookPoint::PreMemoryStore,
        HookPoint::PostMemorySearch,
        HookPoint::PreHeartbeat,
        HookPoint::PostHeartbeat,
        HookPoint::HeartbeatCollect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreToolCall => "pre_tool_call",
            HookPoint::PostToolCall => "post_tool_call",
            HookPoint::FilterTools => "filter_tools",
            HookPoint::PreAgentRun => "pre_agent_run",
            HookPoint::PostAgentRun => "post_agent_run",
            HookPoint::PreMemoryStore => "pre_memory_store",
            HookPoint::PostMemorySearch => "post_memory_search",
            HookPoint::PreHeartbeat => "pre_heartbeat",
            HookPoint::PostHeartbeat => "post_heartbeat",
            HookPoint::HeartbeatCollect => "heartbeat_collect",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown hook point '{s}'"))
    }
}

/// Verdict from a blocking pre-hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResult {
    pub blocked: bool,
    pub message: String,
}

impl HookResult {
    /// Let the action proceed.
    pub fn allow() -> Self {
        Self::default()
    }

    /// Veto the action with a message shown in place of its result.
    pub fn block(message: impl Into<String>) -> Self {
        Self {
            blocked: true,
            message: message.into(),
        }
    }
}

pub type PreToolCallFn =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<HookResult, HookError> + Send + Sync>;
pub type PostToolCallFn =
    Arc<dyn Fn(&str, &serde_json::Value, &str, bool) -> Result<(), HookError> + Send + Sync>;
pub type FilterToolsFn = Arc<
    dyn Fn(&[serde_json::Value]) -> Result<Option<Vec<serde_json::Value>>, HookError>
        + Send
        + Sync,
>;
pub type PreAgentRunFn =
    Arc<dyn Fn(&str, Option<&str>) -> Result<HookResult, HookError> + Send + Sync>;
pub type PostAgentRunFn =
    Arc<dyn Fn(&str, &str, Option<&str>) -> Result<Option<String>, HookError> + Send + Sync>;
pub type PreMemoryStoreFn =
    Arc<dyn Fn(&str, &str) -> Result<HookResult, HookError> + Send + Sync>;
pub type PostMemorySearchFn = Arc<
    dyn Fn(&str, &[serde_json::Value]) -> Result<Option<Vec<serde_json::Value>>, HookError>
        + Send
        + Sync,
>;
pub type PreHeartbeatFn = Arc<dyn Fn(usize) -> Result<HookResult, HookError> + Send + Sync>;
pub type PostHeartbeatFn =
    Arc<dyn Fn(usize, bool, Option<&str>) -> Result<(), HookError> + Send + Sync>;
pub type HeartbeatCollectFn =
    Arc<dyn Fn() -> Result<Vec<serde_json::Value>, HookError> + Send + Sync>;

/// A hook callback, typed by the point it serves.
///
/// | point | arguments | returns |
/// |-------|-----------|---------|
/// | `pre_tool_call` | tool name, arguments | [`HookResult`] |
/// | `post_tool_call` | tool name, arguments, result text, success | nothing |
/// | `filter_tools` | tool definitions | replacement list or `None` |
/// | `pre_agent_run` | user message, conversation id | [`HookResult`] |
/// | `post_agent_run` | user message, response, conversation id | replacement or `None` |
/// | `pre_memory_store` | content, source | [`HookResult`] |
/// | `post_memory_search` | query, results | replacement list or `None` |
/// | `pre_heartbeat` | event count | [`HookResult`] |
/// | `post_heartbeat` | event count, success, error | nothing |
/// | `heartbeat_collect` | none | contributed events |
#[derive(Clone)]
pub enum HookCallback {
    PreToolCall(PreToolCallFn),
    PostToolCall(PostToolCallFn),
    FilterTools(FilterToolsFn),
    PreAgentRun(PreAgentRunFn),
    PostAgentRun(PostAgentRunFn),
    PreMemoryStore(PreMemoryStoreFn),
    PostMemorySearch(PostMemorySearchFn),
    PreHeartbeat(PreHeartbeatFn),
    PostHeartbeat(PostHeartbeatFn),
    HeartbeatCollect(HeartbeatCollectFn),
}

impl HookCallback {
    pub fn point(&self) -> HookPoint {
        match self {
            HookCallback::PreToolCall(_) => HookPoint::PreToolCall,
            HookCallback::PostToolCall(_) => HookPoint::PostToolCall,
            HookCallback::FilterTools(_) => HookPoint::FilterTools,
            HookCallback::PreAgentRun(_) => HookPoint::PreAgentRun,
            HookCallback::PostAgentRun(_) => HookPoint::PostAgentRun,
            HookCallback::PreMemoryStore(_) => HookPoint::PreMemoryStore,
            HookCallback::PostMemorySearch(_) => HookPoint::PostMemorySearch,
            HookCallback::PreHeartbeat(_) => HookPoint::PreHeartbeat,
            HookCallback::PostHeartbeat(_) => HookPoint::PostHeartbeat,
            HookCallback::HeartbeatCollect(_) => HookPoint::HeartbeatCollect,
        }
    }

    pub fn pre_tool_call(
        f: impl Fn(&str, &serde_json::Value) -> Result<HookResult, HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::PreToolCall(Arc::new(f))
    }

    pub fn post_tool_call(
        f: impl Fn(&str, &serde_json::Value, &str, bool) -> Result<(), HookError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookCallback::PostToolCall(Arc::new(f))
    }

    pub fn filter_tools(
        f: impl Fn(&[serde_json::Value]) -> Result<Option<Vec<serde_json::Value>>, HookError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookCallback::FilterTools(Arc::new(f))
    }

    pub fn pre_agent_run(
        f: impl Fn(&str, Option<&str>) -> Result<HookResult, HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::PreAgentRun(Arc::new(f))
    }

    pub fn post_agent_run(
        f: impl Fn(&str, &str, Option<&str>) -> Result<Option<String>, HookError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookCallback::PostAgentRun(Arc::new(f))
    }

    pub fn pre_memory_store(
        f: impl Fn(&str, &str) -> Result<HookResult, HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::PreMemoryStore(Arc::new(f))
    }

    pub fn post_memory_search(
        f: impl Fn(&str, &[serde_json::Value]) -> Result<Option<Vec<serde_json::Value>>, HookError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookCallback::PostMemorySearch(Arc::new(f))
    }

    pub fn pre_heartbeat(
        f: impl Fn(usize) -> Result<HookResult, HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::PreHeartbeat(Arc::new(f))
    }

    pub fn post_heartbeat(
        f: impl Fn(usize, bool, Option<&str>) -> Result<(), HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::PostHeartbeat(Arc::new(f))
    }

    pub fn heartbeat_collect(
        f: impl Fn() -> Result<Vec<serde_json::Value>, HookError> + Send + Sync + 'static,
    ) -> Self {
        HookCallback::HeartbeatCollect(Arc::new(f))
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookCallback({})", self.point())
    }
}

/// A named callback bound to one hook point.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub name: String,
    pub callback: HookCallback,
    pub priority: i32,
    pub source: String,
    pub description: String,
}

impl HookRegistration {
    /// New registration with the default priority and source `config`.
    pub fn new(name: impl Into<String>, callback: HookCallback) -> Self {
        Self {
            name: name.into(),
            callback,
            priority: super::DEFAULT_PRIORITY,
            source: "config".to_string(),
            description: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn point(&self) -> HookPoint {
        self.callback.point()
    }

    pub fn info(&self) -> HookInfo {
        HookInfo {
            name: self.name.clone(),
            hook_point: self.point(),
            priority: self.priority,
            source: self.source.clone(),
            description: self.description.clone(),
        }
    }
}

/// Introspection view of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookInfo {
    pub name: String,
    pub hook_point: HookPoint,
    pub priority: i32,
    pub source: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_point_round_trips_through_str() {
        for point in HookPoint::ALL {
            assert_eq!(point.as_str().parse::<HookPoint>().unwrap(), point);
        }
        assert!("pre_everything".parse::<HookPoint>().is_err());
    }

    #[test]
    fn test_hook_point_serde_uses_snake_case() {
        let json = serde_json::to_string(&HookPoint::PostMemorySearch).unwrap();
        assert_eq!(json, "\"post_memory_search\"");
    }

    #[test]
    fn test_indices_are_dense() {
        for (i, point) in HookPoint::ALL.iter().enumerate() {
            assert_eq!(point.index(), i);
        }
    }

    #[test]
    fn test_registration_defaults_and_builders() {
        let reg = HookRegistration::new(
            "noop",
            HookCallback::pre_heartbeat(|_| Ok(HookResult::allow())),
        );
        assert_eq!(reg.priority, 50);
        assert_eq!(reg.source, "config");
        assert_eq!(reg.point(), HookPoint::PreHeartbeat);

        let reg = reg
            .with_priority(5)
            .with_source("plugin:x")
            .with_description("d");
        let info = reg.info();
        assert_eq!(info.priority, 5);
        assert_eq!(info.source, "plugin:x");
        assert_eq!(info.description, "d");
    }

    #[test]
    fn test_hook_result_constructors() {
        assert!(!HookResult::allow().blocked);
        let blocked = HookResult::block("nope");
        assert!(blocked.blocked);
        assert_eq!(blocked.message, "nope");
    }
}
