use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bootstrap::toolforge_base_dir;
use crate::config::helpers::{optional_env, parse_bool_env};
use crate::error::ConfigError;

/// Hook system configuration.
#[derive(Debug, Clone)]
pub struct HooksConfig {
    /// Whether config-driven hook rules are registered at startup.
    pub enabled: bool,
    /// TOML file holding `[[rules]]` tables (default: ~/.toolforge/hooks.toml).
    pub rules_path: PathBuf,
    /// Rules loaded from `rules_path`.
    pub rules: Vec<HookRule>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules_path: default_rules_path(),
            rules: Vec::new(),
        }
    }
}

fn default_rules_path() -> PathBuf {
    toolforge_base_dir().join("hooks.toml")
}

/// A declarative hook rule.
///
/// ```toml
/// [[rules]]
/// name = "no-force-push"
/// hook_point = "pre_tool_call"
/// type = "block_command_pattern"
/// patterns = ["git push --force"]
/// ```
///
/// Everything besides the fixed keys lands in `options` and is interpreted
/// per rule type.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HookRule {
    pub name: String,
    pub hook_point: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_rule_priority() -> i32 {
    crate::hooks::DEFAULT_PRIORITY
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<HookRule>,
}

impl HooksConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let enabled = parse_bool_env("HOOKS_ENABLED", true)?;
        let rules_path = optional_env("HOOKS_RULES_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_rules_path);
        let rules = if enabled && rules_path.exists() {
            Self::load_rules(&rules_path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            enabled,
            rules_path,
            rules,
        })
    }

    /// Parse a rules file.
    pub fn load_rules(path: &Path) -> Result<Vec<HookRule>, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse_rules(&raw).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse rules from TOML text.
    pub fn parse_rules(raw: &str) -> Result<Vec<HookRule>, String> {
        let file: RulesFile = toml::from_str(raw).map_err(|e| e.to_string())?;
        Ok(file.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules_with_options() {
        let rules = HooksConfig::parse_rules(
            r#"
[[rules]]
name = "no-rm"
hook_point = "pre_tool_call"
type = "block_command_pattern"
patterns = ["rm -rf"]

[[rules]]
name = "night"
hook_point = "filter_tools"
type = "time_restrict"
priority = 10
start_hour = 23
"#,
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 50);
        assert_eq!(rules[0].kind, "block_command_pattern");
        assert_eq!(rules[0].options["patterns"], serde_json::json!(["rm -rf"]));
        assert_eq!(rules[1].priority, 10);
        assert_eq!(rules[1].options["start_hour"], serde_json::json!(23));
    }

    #[test]
    fn test_parse_rules_empty_file() {
        assert!(HooksConfig::parse_rules("").unwrap().is_empty());
    }

    #[test]
    fn test_load_rules_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.toml");
        std::fs::write(&path, "[[rules]]\nname = 1\n").unwrap();
        let err = HooksConfig::load_rules(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("hooks.toml"));
    }
}
