//! On-disk artifact types: manifest, test cases, failure records.
//!
//! Manifests, tests and schemas are YAML; failure records are JSON.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::hooks::{HookPoint, PLUGIN_DEFAULT_PRIORITY};
use crate::sandbox::SandboxPolicy;
use crate::tools::validate_tool_schema;

/// Artifact names double as the entry function name, so they must be
/// identifiers. Upper case is excluded to keep directory names portable.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,63}$").expect("static name pattern"));

/// Check an artifact name. Returns the reason it is unusable.
pub fn validate_name(name: &str) -> Result<(), String> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err("names must be 1-64 characters of lowercase letters, digits or '_', \
             not starting with a digit"
            .to_string())
    }
}

/// How much host access an artifact's code gets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Generated code: pure builtins, bounded step budget.
    #[default]
    Sandbox,
    /// Operator-installed code: adds clock and environment lookups.
    #[serde(alias = "trusted")]
    Local,
}

impl TrustLevel {
    pub fn policy(&self, max_steps: u64) -> SandboxPolicy {
        match self {
            TrustLevel::Sandbox => SandboxPolicy::sandboxed(max_steps),
            TrustLevel::Local => SandboxPolicy::local(),
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::Sandbox => write!(f, "sandbox"),
            TrustLevel::Local => write!(f, "local"),
        }
    }
}

/// What an artifact contributes once enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Tool,
    Hook,
    PersonalityBundle,
    Widget,
}

/// One callable exposed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Binds a function in the artifact's code to a hook point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookBinding {
    pub hook_point: HookPoint,
    pub function: String,
    #[serde(default = "plugin_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

fn plugin_priority() -> i32 {
    PLUGIN_DEFAULT_PRIORITY
}

/// `manifest.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookBinding>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_author() -> String {
    "unknown".to_string()
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Tool]
}

/// Hand-edited manifests carry empty or free-form timestamps; treat anything
/// unparseable as unset.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }))
}

impl PluginManifest {
    /// Manifest for agent-generated code: always sandbox trust, one tool
    /// named after the artifact.
    pub fn generated(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        Self {
            tools: vec![ToolDefinition::new(&name, &description, parameters)],
            name,
            version: default_version(),
            description,
            author: "llm-generated".to_string(),
            trust_level: TrustLevel::Sandbox,
            capabilities: default_capabilities(),
            permissions: Vec::new(),
            hooks: Vec::new(),
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(raw)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yml::Error> {
        serde_yml::to_string(self)
    }

    /// Structural problems that make the manifest unusable.
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(reason) = validate_name(&self.name) {
            problems.push(format!("name: {reason}"));
        }
        for tool in &self.tools {
            if let Err(reason) = validate_name(&tool.name) {
                problems.push(format!("tools.{}: {reason}", tool.name));
            }
            problems.extend(validate_tool_schema(
                &tool.parameters,
                &format!("tools.{}.parameters", tool.name),
            ));
        }
        if !self.hooks.is_empty() && !self.has_capability(Capability::Hook) {
            problems.push("hooks declared without the 'hook' capability".to_string());
        }
        problems
    }
}

/// `schema.yaml`: the single-tool schema written alongside generated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl From<&ToolDefinition> for ToolSchemaFile {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            name: Some(def.name.clone()),
            description: Some(def.description.clone()),
            parameters: Some(def.parameters.clone()),
        }
    }
}

/// One declared test of an artifact's entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default = "default_test_name")]
    pub name: String,
    #[serde(default, alias = "input_args")]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(
        default,
        alias = "expected_output",
        deserialize_with = "scalar_as_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar_as_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_contains: Option<String>,
}

fn default_test_name() -> String {
    "test".to_string()
}

/// Expected outputs are compared against `str(result)`, so a YAML `5` or
/// `true` means the text `5` or `True`.
fn scalar_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Bool(true)) => Some("True".to_string()),
        Some(serde_json::Value::Bool(false)) => Some("False".to_string()),
        Some(other) => Some(other.to_string()),
    })
}

impl TestCase {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input: input.as_object().cloned().unwrap_or_default(),
            expected: None,
            expected_contains: None,
        }
    }

    pub fn expecting(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn containing(mut self, fragment: impl Into<String>) -> Self {
        self.expected_contains = Some(fragment.into());
        self
    }

    /// Parse a `tests.yaml` body.
    pub fn list_from_yaml(raw: &str) -> Result<Vec<Self>, serde_yml::Error> {
        let tests: Option<Vec<Self>> = serde_yml::from_str(raw)?;
        Ok(tests.unwrap_or_default())
    }

    /// Parse test cases supplied as JSON by the agent.
    pub fn list_from_json(value: &serde_json::Value) -> Result<Vec<Self>, serde_json::Error> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Runtime,
    TestFailure,
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Syntax => "syntax",
            FailureKind::Runtime => "runtime",
            FailureKind::TestFailure => "test_failure",
            FailureKind::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// One failed create/fix attempt, kept until the next success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub tool_name: String,
    #[serde(rename = "error_type")]
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
    #[serde(default)]
    pub input_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub actual_output: Option<String>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
}
