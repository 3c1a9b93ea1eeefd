use std::path::PathBuf;
use std::time::Duration;

use crate::bootstrap::toolforge_base_dir;
use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Plugin system configuration.
#[derive(Debug, Clone)]
pub struct PluginsConfig {
    /// Root of the artifact store (default: ~/.toolforge/plugins/).
    pub dir: PathBuf,
    /// Failed fix attempts tolerated before `update_code` is refused.
    pub max_fix_attempts: u32,
    /// Wall-clock budget for one full test run.
    pub test_timeout_secs: u64,
    /// Wall-clock budget for one live tool invocation.
    pub exec_timeout_secs: u64,
    /// Wall-clock budget for one script hook callback.
    pub hook_timeout_ms: u64,
    /// Largest accepted source text.
    pub max_code_size_bytes: usize,
    /// Interpreter step budget for sandbox-trust code.
    pub max_steps: u64,
    /// Skip review for artifacts whose tests pass. Never applies to `local` trust.
    pub auto_approve: bool,
    /// Whether the agent may create new artifacts at all.
    pub allow_generated: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugins_dir(),
            max_fix_attempts: 5,
            test_timeout_secs: 10,
            exec_timeout_secs: 30,
            hook_timeout_ms: 1000,
            max_code_size_bytes: 10_000,
            max_steps: 5_000_000,
            auto_approve: false,
            allow_generated: true,
        }
    }
}

/// Get the default plugin store directory (~/.toolforge/plugins/).
fn default_plugins_dir() -> PathBuf {
    toolforge_base_dir().join("plugins")
}

impl PluginsConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            dir: optional_env("PLUGINS_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            max_fix_attempts: parse_optional_env(
                "PLUGINS_MAX_FIX_ATTEMPTS",
                defaults.max_fix_attempts,
            )?,
            test_timeout_secs: parse_optional_env(
                "PLUGINS_TEST_TIMEOUT_SECS",
                defaults.test_timeout_secs,
            )?,
            exec_timeout_secs: parse_optional_env(
                "PLUGINS_EXEC_TIMEOUT_SECS",
                defaults.exec_timeout_secs,
            )?,
            hook_timeout_ms: parse_optional_env("PLUGINS_HOOK_TIMEOUT_MS", defaults.hook_timeout_ms)?,
            max_code_size_bytes: parse_optional_env(
                "PLUGINS_MAX_CODE_SIZE_BYTES",
                defaults.max_code_size_bytes,
            )?,
            max_steps: parse_optional_env("PLUGINS_MAX_STEPS", defaults.max_steps)?,
            auto_approve: parse_bool_env("PLUGINS_AUTO_APPROVE", defaults.auto_approve)?,
            allow_generated: parse_bool_env("PLUGINS_ALLOW_GENERATED", defaults.allow_generated)?,
        };

        if config.test_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PLUGINS_TEST_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.max_fix_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PLUGINS_MAX_FIX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    /// Config rooted at an explicit directory, everything else default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_LOCK;

    #[test]
    fn test_defaults() {
        let config = PluginsConfig::default();
        assert_eq!(config.max_fix_attempts, 5);
        assert_eq!(config.test_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_code_size_bytes, 10_000);
        assert!(!config.auto_approve);
        assert!(config.allow_generated);
        assert!(config.dir.ends_with("plugins"));
    }

    #[test]
    fn test_resolve_reads_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: guarded by ENV_LOCK.
        unsafe {
            std::env::set_var("PLUGINS_AUTO_APPROVE", "true");
            std::env::set_var("PLUGINS_MAX_FIX_ATTEMPTS", "2");
            std::env::set_var("PLUGINS_DIR", "/tmp/toolforge-plugins");
        }
        let config = PluginsConfig::resolve().unwrap();
        unsafe {
            std::env::remove_var("PLUGINS_AUTO_APPROVE");
            std::env::remove_var("PLUGINS_MAX_FIX_ATTEMPTS");
            std::env::remove_var("PLUGINS_DIR");
        }
        assert!(config.auto_approve);
        assert_eq!(config.max_fix_attempts, 2);
        assert_eq!(config.dir, PathBuf::from("/tmp/toolforge-plugins"));
    }

    #[test]
    fn test_resolve_rejects_zero_timeout() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { std::env::set_var("PLUGINS_TEST_TIMEOUT_SECS", "0") };
        let result = PluginsConfig::resolve();
        unsafe { std::env::remove_var("PLUGINS_TEST_TIMEOUT_SECS") };
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
