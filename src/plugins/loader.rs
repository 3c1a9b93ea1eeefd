//! Turns stored artifacts into live tools and hook callbacks.
//!
//! Every tool invocation and hook call instantiates the compiled program
//! afresh on a sandbox worker, so no module state survives between calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::PluginsConfig;
use crate::error::{HookError, PluginError};
use crate::hooks::{HookCallback, HookPoint, HookRegistration, HookResult};
use crate::plugins::manifest::{
    Capability, HookBinding, PluginManifest, ToolDefinition, ToolSchemaFile, TrustLevel,
};
use crate::plugins::store::{ArtifactFiles, HelperScript};
use crate::plugins::validator::CodeValidator;
use crate::sandbox::{self, Instance, Program, SandboxPolicy, ScriptError};
use crate::tools::{Tool, ToolError, ToolOutput};

/// Source tag for hooks registered by the artifact `name`.
pub fn hook_source(name: &str) -> String {
    format!("plugin:{name}")
}

/// Tools an artifact exposes: the manifest's `tools`, else the schema file,
/// else a single tool named after the artifact. None without the `tool`
/// capability.
pub fn tool_definitions(manifest: &PluginManifest, schema: Option<&ToolSchemaFile>) -> Vec<ToolDefinition> {
    if !manifest.has_capability(Capability::Tool) {
        return Vec::new();
    }
    if !manifest.tools.is_empty() {
        return manifest.tools.clone();
    }
    if let Some(schema) = schema {
        return vec![ToolDefinition::new(
            schema.name.clone().unwrap_or_else(|| manifest.name.clone()),
            schema
                .description
                .clone()
                .unwrap_or_else(|| manifest.description.clone()),
            schema
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        )];
    }
    vec![ToolDefinition::new(
        &manifest.name,
        &manifest.description,
        json!({"type": "object", "properties": {}}),
    )]
}

/// Live capabilities built from one artifact.
pub struct LoadedPlugin {
    pub tools: Vec<Arc<dyn Tool>>,
    pub hooks: Vec<HookRegistration>,
}

impl LoadedPlugin {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name().to_string()).collect()
    }
}

/// Compile the helper scripts that pass validation at `trust`. Scripts
/// that fail validation or do not parse are skipped with a warning.
pub fn helper_programs(plugin: &str, scripts: &[HelperScript], trust: TrustLevel) -> Vec<Program> {
    let validator = CodeValidator::for_trust(trust);
    let mut programs = Vec::new();
    for script in scripts {
        let report = validator.validate(&script.code);
        if !report.accepted {
            tracing::warn!(
                plugin = %plugin,
                script = %script.file_name,
                issues = ?report.issues,
                "Skipping helper script that failed validation"
            );
            continue;
        }
        match Program::compile(&script.code) {
            Ok(program) => programs.push(program),
            Err(e) => {
                tracing::warn!(plugin = %plugin, script = %script.file_name, "Skipping helper script: {}", e)
            }
        }
    }
    programs
}

/// Compile an artifact and build its tools and hook registrations.
///
/// Helper scripts load ahead of `tool.py`. Declared functions missing from
/// the code are skipped with a warning.
pub fn load_plugin(files: &ArtifactFiles, config: &PluginsConfig) -> Result<LoadedPlugin, PluginError> {
    let manifest = &files.manifest;
    let program = Program::compile(&files.code).map_err(|e| PluginError::Load {
        name: manifest.name.clone(),
        reason: e.to_string(),
    })?;
    let program = helper_programs(&manifest.name, &files.scripts, manifest.trust_level)
        .iter()
        .fold(program, |program, helper| program.with_helper(helper));
    let policy = manifest.trust_level.policy(config.max_steps);

    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    if manifest.has_capability(Capability::Tool) {
        for def in tool_definitions(manifest, files.schema.as_ref()) {
            if !program.defines(&def.name) {
                tracing::warn!(
                    plugin = %manifest.name,
                    "Plugin declares tool '{}' but its code does not define it",
                    def.name
                );
                continue;
            }
            tools.push(Arc::new(ScriptTool::new(
                def,
                program.clone(),
                policy,
                config.exec_timeout(),
            )));
        }
    }

    let mut hooks = Vec::new();
    if manifest.has_capability(Capability::Hook) {
        for binding in &manifest.hooks {
            if !program.defines(&binding.function) {
                tracing::warn!(
                    plugin = %manifest.name,
                    "Plugin declares hook function '{}' but it was not found",
                    binding.function
                );
                continue;
            }
            let hook = ScriptHook {
                program: program.clone(),
                policy,
                timeout: config.hook_timeout(),
                function: Arc::from(binding.function.as_str()),
            };
            hooks.push(
                HookRegistration::new(
                    format!("{}:{}", manifest.name, binding.function),
                    hook.callback(binding.hook_point),
                )
                .with_priority(binding.priority)
                .with_source(hook_source(&manifest.name))
                .with_description(describe(binding)),
            );
        }
    }

    Ok(LoadedPlugin { tools, hooks })
}

fn describe(binding: &HookBinding) -> String {
    if binding.description.is_empty() {
        format!("{} hook", binding.hook_point)
    } else {
        binding.description.clone()
    }
}

// ── tools ──

/// A tool backed by a function in artifact code.
pub struct ScriptTool {
    definition: ToolDefinition,
    program: Program,
    policy: SandboxPolicy,
    timeout: Duration,
}

impl ScriptTool {
    pub fn new(definition: ToolDefinition, program: Program, policy: SandboxPolicy, timeout: Duration) -> Self {
        Self {
            definition,
            program,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> Value {
        self.definition.parameters.clone()
    }

    fn execution_timeout(&self) -> Duration {
        // The worker enforces `timeout` itself; leave it room to report.
        self.timeout + Duration::from_secs(1)
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let kwargs = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ToolError::InvalidParameters(format!(
                    "expected an object of keyword arguments, got {other}"
                )));
            }
        };

        let program = self.program.clone();
        let policy = self.policy;
        let entry = self.definition.name.clone();
        let result = sandbox::run_async(self.timeout, move |deadline| {
            let mut instance = Instance::load(&program, &policy, deadline)?;
            instance.call(&entry, &kwargs)
        })
        .await;

        match result {
            Ok(value) => Ok(ToolOutput::text(value.text, start.elapsed()).with_raw(value.json.to_string())),
            Err(ScriptError::Timeout) => Err(ToolError::Timeout(self.timeout)),
            Err(ScriptError::Raised(exc)) => Err(ToolError::ExecutionFailed(exc.to_string())),
            Err(e) => Err(ToolError::Sandbox(e.to_string())),
        }
    }
}

// ── hooks ──

#[derive(Clone)]
struct ScriptHook {
    program: Program,
    policy: SandboxPolicy,
    timeout: Duration,
    function: Arc<str>,
}

impl ScriptHook {
    /// Call the hook function with positional JSON arguments.
    fn call(&self, args: Vec<Value>) -> Result<Value, HookError> {
        let program = self.program.clone();
        let policy = self.policy;
        let function = Arc::clone(&self.function);
        sandbox::run_blocking(self.timeout, move |deadline: Instant| {
            let mut instance = Instance::load(&program, &policy, deadline)?;
            instance.call_positional(&function, &args)
        })
        .map(|value| value.json)
        .map_err(|e| match e {
            ScriptError::Timeout => HookError::Timeout(self.timeout),
            other => HookError::Failed(other.to_string()),
        })
    }

    fn callback(self, point: HookPoint) -> HookCallback {
        match point {
            HookPoint::PreToolCall => HookCallback::pre_tool_call(move |tool, args| {
                self.call(vec![json!(tool), args.clone()]).map(to_hook_result)
            }),
            HookPoint::PostToolCall => {
                HookCallback::post_tool_call(move |tool, args, result, success| {
                    self.call(vec![json!(tool), args.clone(), json!(result), json!(success)])
                        .map(|_| ())
                })
            }
            HookPoint::FilterTools => HookCallback::filter_tools(move |tools| {
                self.call(vec![Value::Array(tools.to_vec())]).map(to_list)
            }),
            HookPoint::PreAgentRun => HookCallback::pre_agent_run(move |message, conversation| {
                self.call(vec![json!(message), json!(conversation)])
                    .map(to_hook_result)
            }),
            HookPoint::PostAgentRun => {
                HookCallback::post_agent_run(move |message, response, conversation| {
                    self.call(vec![json!(message), json!(response), json!(conversation)])
                        .map(|value| value.as_str().map(str::to_string))
                })
            }
            HookPoint::PreMemoryStore => HookCallback::pre_memory_store(move |content, source| {
                self.call(vec![json!(content), json!(source)])
                    .map(to_hook_result)
            }),
            HookPoint::PostMemorySearch => HookCallback::post_memory_search(move |query, results| {
                self.call(vec![json!(query), Value::Array(results.to_vec())])
                    .map(to_list)
            }),
            HookPoint::PreHeartbeat => HookCallback::pre_heartbeat(move |count| {
                self.call(vec![json!(count)]).map(to_hook_result)
            }),
            HookPoint::PostHeartbeat => HookCallback::post_heartbeat(move |count, success, error| {
                self.call(vec![json!(count), json!(success), json!(error)])
                    .map(|_| ())
            }),
            HookPoint::HeartbeatCollect => HookCallback::heartbeat_collect(move || {
                self.call(Vec::new()).map(|value| match value {
                    Value::Array(items) => items,
                    Value::Object(_) => vec![value],
                    _ => Vec::new(),
                })
            }),
        }
    }
}

/// A dict with a truthy `blocked` key blocks; anything else allows.
fn to_hook_result(value: Value) -> HookResult {
    let blocked = match value.get("blocked") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    };
    if blocked {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        HookResult::block(message)
    } else {
        HookResult::allow()
    }
}

fn to_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hooks::HookBus;
    use crate::plugins::manifest::TrustLevel;

    fn files(code: &str, manifest: PluginManifest) -> ArtifactFiles {
        ArtifactFiles {
            manifest,
            code: code.to_string(),
            tests: Vec::new(),
            schema: None,
            scripts: Vec::new(),
        }
    }

    fn hook_manifest(bindings: Vec<(HookPoint, &str)>) -> PluginManifest {
        let mut manifest = PluginManifest::generated("guard", "Guards things", json!({}));
        manifest.tools.clear();
        manifest.capabilities = vec![Capability::Hook];
        manifest.hooks = bindings
            .into_iter()
            .map(|(hook_point, function)| HookBinding {
                hook_point,
                function: function.to_string(),
                priority: 100,
                description: String::new(),
            })
            .collect();
        manifest
    }

    // ── tool definitions ──

    #[test]
    fn test_definitions_prefer_manifest_then_schema_then_name() {
        let mut manifest = PluginManifest::generated("alpha", "Alpha", json!({"type": "object"}));
        assert_eq!(tool_definitions(&manifest, None)[0].name, "alpha");

        manifest.tools.clear();
        let schema = ToolSchemaFile {
            name: Some("beta".to_string()),
            description: None,
            parameters: None,
        };
        let defs = tool_definitions(&manifest, Some(&schema));
        assert_eq!(defs[0].name, "beta");
        assert_eq!(defs[0].description, "Alpha");

        let defs = tool_definitions(&manifest, None);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "alpha");
        assert_eq!(defs[0].parameters, json!({"type": "object", "properties": {}}));

        manifest.capabilities = vec![Capability::Hook];
        assert!(tool_definitions(&manifest, None).is_empty());
    }

    #[test]
    fn test_compile_failure_is_load_error() {
        let manifest = PluginManifest::generated("broken", "", json!({}));
        let err = load_plugin(&files("def broken(:\n", manifest), &PluginsConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Load { .. }));
    }

    #[test]
    fn test_undefined_tool_skipped() {
        let manifest = PluginManifest::generated("missing", "", json!({}));
        let loaded = load_plugin(
            &files("def other():\n    return 1\n", manifest),
            &PluginsConfig::default(),
        )
        .unwrap();
        assert!(loaded.tools.is_empty());
    }

    #[tokio::test]
    async fn test_helper_scripts_join_the_tool_namespace() {
        let manifest = PluginManifest::generated("slugify", "Make slugs", json!({}));
        let mut files = files("def slugify(text):\n    return join_words(clean(text).split())\n", manifest);
        files.scripts = vec![
            HelperScript {
                file_name: "clean.py".to_string(),
                code: "def clean(text):\n    return text.strip().lower()\n".to_string(),
            },
            HelperScript {
                file_name: "evil.py".to_string(),
                code: "import os\n\ndef join_words(words):\n    return os.getcwd()\n".to_string(),
            },
            HelperScript {
                file_name: "words.py".to_string(),
                code: "def join_words(words):\n    return '-'.join(words)\n".to_string(),
            },
        ];

        let loaded = load_plugin(&files, &PluginsConfig::default()).unwrap();
        let output = loaded.tools[0]
            .execute(json!({"text": "  Hello Big World "}))
            .await
            .unwrap();
        assert_eq!(output.as_text(), "hello-big-world");

        let programs = helper_programs("slugify", &files.scripts, TrustLevel::Sandbox);
        assert_eq!(programs.len(), 2);
    }

    #[test]
    fn test_tool_defined_only_in_helper_is_registered() {
        let manifest = PluginManifest::generated("twice", "", json!({}));
        let mut files = files("BASE = 2\n", manifest);
        files.scripts = vec![HelperScript {
            file_name: "impl.py".to_string(),
            code: "def twice(n=1):\n    return n * 2\n".to_string(),
        }];
        let loaded = load_plugin(&files, &PluginsConfig::default()).unwrap();
        assert_eq!(loaded.tool_names(), vec!["twice"]);
    }

    // ── script tools ──

    #[tokio::test]
    async fn test_script_tool_returns_str_of_result() {
        let manifest = PluginManifest::generated(
            "word_stats",
            "Count words",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        );
        let code = "def word_stats(text):\n    return {'words': len(text.split())}\n";
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        let tool = &loaded.tools[0];

        let output = tool.execute(json!({"text": "a b c"})).await.unwrap();
        assert_eq!(output.as_text(), "{'words': 3}");
        assert_eq!(output.raw.as_deref(), Some(r#"{"words":3}"#));
    }

    #[tokio::test]
    async fn test_script_tool_error_mapping() {
        let manifest = PluginManifest::generated("fails", "", json!({}));
        let code = "def fails(x):\n    raise ValueError('bad ' + str(x))\n";
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        let tool = &loaded.tools[0];

        let err = tool.execute(json!({"x": 1})).await.unwrap_err();
        assert_eq!(err.to_string(), "Execution failed: ValueError: bad 1");

        let err = tool.execute(json!([1])).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_script_tool_times_out() {
        let mut manifest = PluginManifest::generated("spin", "", json!({}));
        manifest.trust_level = TrustLevel::Local;
        let mut config = PluginsConfig::default();
        config.exec_timeout_secs = 1;

        let code = "def spin():\n    while True:\n        pass\n";
        let loaded = load_plugin(&files(code, manifest), &config).unwrap();
        let err = loaded.tools[0].execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_module_state_does_not_leak_between_calls() {
        let manifest = PluginManifest::generated("counter", "", json!({}));
        let code = "seen = []\n\ndef counter():\n    seen.append(1)\n    return len(seen)\n";
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        let tool = &loaded.tools[0];

        assert_eq!(tool.execute(json!({})).await.unwrap().as_text(), "1");
        assert_eq!(tool.execute(json!({})).await.unwrap().as_text(), "1");
    }

    // ── script hooks ──

    #[test]
    fn test_script_pre_hook_blocks() {
        let code = "def no_rm(tool, args):\n    if 'rm' in args.get('command', ''):\n        \
                    return HookResult(blocked=True, message='no rm')\n    return None\n";
        let manifest = hook_manifest(vec![(HookPoint::PreToolCall, "no_rm")]);
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        assert_eq!(loaded.hooks.len(), 1);
        assert_eq!(loaded.hooks[0].name, "guard:no_rm");
        assert_eq!(loaded.hooks[0].source, "plugin:guard");
        assert_eq!(loaded.hooks[0].priority, 100);

        let bus = HookBus::new();
        for hook in loaded.hooks {
            bus.register(hook);
        }
        let blocked = bus.run_pre_tool_call("exec", &json!({"command": "rm -rf /"}));
        assert_eq!(blocked, HookResult::block("no rm"));
        assert!(!bus.run_pre_tool_call("exec", &json!({"command": "ls"})).blocked);
    }

    #[test]
    fn test_script_transform_hooks() {
        let code = "def shout(message, response, conversation):\n    return response.upper()\n\n\
                    def only_first(tools):\n    return tools[:1]\n\n\
                    def beat():\n    return {'event': 'tick'}\n";
        let manifest = hook_manifest(vec![
            (HookPoint::PostAgentRun, "shout"),
            (HookPoint::FilterTools, "only_first"),
            (HookPoint::HeartbeatCollect, "beat"),
        ]);
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        let bus = HookBus::new();
        for hook in loaded.hooks {
            bus.register(hook);
        }

        assert_eq!(bus.run_post_agent_run("hi", "hello".to_string(), None), "HELLO");
        assert_eq!(
            bus.run_filter_tools(vec![json!({"name": "a"}), json!({"name": "b"})]),
            vec![json!({"name": "a"})]
        );
        assert_eq!(bus.run_heartbeat_collect(), vec![json!({"event": "tick"})]);
    }

    #[test]
    fn test_hooks_need_capability() {
        let code = "def h(tool, args):\n    return None\n";
        let mut manifest = hook_manifest(vec![(HookPoint::PreToolCall, "h")]);
        manifest.capabilities = vec![Capability::Tool];
        let loaded = load_plugin(&files(code, manifest), &PluginsConfig::default()).unwrap();
        assert!(loaded.hooks.is_empty());
    }

    #[test]
    fn test_to_hook_result_truthiness() {
        assert!(!to_hook_result(json!(null)).blocked);
        assert!(!to_hook_result(json!({"blocked": false})).blocked);
        assert!(!to_hook_result(json!({"blocked": 0})).blocked);
        assert_eq!(
            to_hook_result(json!({"blocked": 1, "message": "m"})),
            HookResult::block("m")
        );
    }
}
