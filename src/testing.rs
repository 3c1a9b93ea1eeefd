//! Test harness for wiring a [`PluginRegistry`] with its live registries.
//!
//! Provides:
//! - [`TestHarnessBuilder`]: builder with config overrides and optional
//!   authoring tools
//! - [`TestHarness`]: the assembled components ready for use in tests
//! - [`reverse_text_request`]: a known-good candidate artifact
//!
//! # Usage
//!
//! ```rust,no_run
//! use toolforge::testing::TestHarnessBuilder;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let dir = tempfile::tempdir().unwrap();
//!     let harness = TestHarnessBuilder::new(dir.path()).build().await.unwrap();
//!     // use harness.plugins, harness.tools, harness.hooks
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PluginsConfig;
use crate::error::PluginError;
use crate::hooks::HookBus;
use crate::plugins::{CreateRequest, PluginRegistry, TestCase};
use crate::tools::ToolRegistry;
use crate::tools::builtin::register_plugin_tools;

/// Entry function of [`reverse_text_request`].
pub const REVERSE_TEXT_CODE: &str = "def reverse_text(text):\n    return text[::-1]\n";

/// A candidate that passes validation and its single test.
pub fn reverse_text_request() -> CreateRequest {
    CreateRequest {
        name: "reverse_text".to_string(),
        description: "Reverse a string".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string", "description": "Text to reverse"}},
            "required": ["text"]
        }),
        code: REVERSE_TEXT_CODE.to_string(),
        tests: vec![TestCase::new("basic", serde_json::json!({"text": "hello"})).expecting("olleh")],
    }
}

/// Assembled test components.
pub struct TestHarness {
    pub plugins: Arc<PluginRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookBus>,
}

/// Builder for constructing a [`TestHarness`] under a caller-owned
/// directory.
///
/// Defaults:
/// - Config: [`PluginsConfig::with_dir`] on the given directory
/// - Tools: empty registry
/// - Hooks: empty bus
pub struct TestHarnessBuilder {
    dir: PathBuf,
    config: Option<PluginsConfig>,
    tweaks: Vec<Box<dyn FnOnce(&mut PluginsConfig) + Send>>,
    plugin_tools: bool,
}

impl TestHarnessBuilder {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            config: None,
            tweaks: Vec::new(),
            plugin_tools: false,
        }
    }

    /// Replace the whole config. `dir` is still forced to the harness dir.
    pub fn with_config(mut self, config: PluginsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Adjust the config before the registry opens.
    pub fn configure(mut self, tweak: impl FnOnce(&mut PluginsConfig) + Send + 'static) -> Self {
        self.tweaks.push(Box::new(tweak));
        self
    }

    /// Register `create_tool`, `debug_tool` and `rollback_tool`.
    pub fn with_plugin_tools(mut self) -> Self {
        self.plugin_tools = true;
        self
    }

    pub async fn build(self) -> Result<TestHarness, PluginError> {
        let mut config = self.config.unwrap_or_default();
        config.dir = self.dir;
        for tweak in self.tweaks {
            tweak(&mut config);
        }

        let tools = Arc::new(ToolRegistry::new());
        let hooks = Arc::new(HookBus::new());
        let plugins = Arc::new(
            PluginRegistry::open(config, Arc::clone(&tools), Arc::clone(&hooks)).await?,
        );
        if self.plugin_tools {
            register_plugin_tools(&tools, Arc::clone(&plugins)).await;
        }

        Ok(TestHarness {
            plugins,
            tools,
            hooks,
        })
    }
}
