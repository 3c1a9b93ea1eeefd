//! End-to-end plugin lifecycle: create, review, call, fix, roll back, and
//! the hook bus wiring around plugin and config hooks.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use toolforge::config::{HooksConfig, PluginsConfig};
use toolforge::error::PluginError;
use toolforge::hooks::{HookCallback, HookRegistration, HookResult, load_config_hooks};
use toolforge::plugins::{CreateOutcome, LifecycleState, Membership, UpdateOutcome};
use toolforge::plugins::{CreateRequest, TestCase};
use toolforge::testing::{REVERSE_TEXT_CODE, TestHarness, TestHarnessBuilder, reverse_text_request};
use toolforge::tools::{Tool, ToolError, ToolOutput};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn harness(dir: &TempDir, tweak: impl FnOnce(&mut PluginsConfig) + Send + 'static) -> TestHarness {
    init_tracing();
    TestHarnessBuilder::new(dir.path())
        .configure(tweak)
        .with_plugin_tools()
        .build()
        .await
        .unwrap()
}

fn write_artifact(dir: &Path, manifest: &str, code: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("manifest.yaml"), manifest).unwrap();
    std::fs::write(dir.join("tool.py"), code).unwrap();
}

// ── reverse_text ──

#[tokio::test]
async fn reverse_text_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;

    let outcome = h.plugins.create(reverse_text_request()).await.unwrap();
    assert!(matches!(outcome, CreateOutcome::PendingReview { ref version } if version == "v1"));
    assert!(dir.path().join("pending/reverse_text/tool.py").is_file());
    assert!(dir.path().join("versions/reverse_text/v1.json").is_file());
    assert!(!h.tools.contains("reverse_text").await);

    h.plugins.approve("reverse_text").await.unwrap();
    assert_eq!(h.plugins.state("reverse_text").await, Some(LifecycleState::Enabled));
    assert!(dir.path().join("available/reverse_text").is_dir());
    assert!(!dir.path().join("pending/reverse_text").exists());
    assert_eq!(h.tools.invoke("reverse_text", json!({"text": "hello"})).await, "olleh");

    // A fix that breaks the test leaves the live code alone.
    let outcome = h
        .plugins
        .update_code("reverse_text", "def reverse_text(text):\n    return text\n")
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::TestsFailed { attempt: 1, .. }));
    assert_eq!(h.tools.invoke("reverse_text", json!({"text": "ab"})).await, "ba");

    let v2 = "def reverse_text(text):\n    return ''.join(reversed(text))\n";
    let outcome = h.plugins.update_code("reverse_text", v2).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { ref version } if version == "v2"));
    assert_eq!(h.plugins.failure_count("reverse_text").await, 0);

    h.plugins.rollback("reverse_text", "v1").await.unwrap();
    let artifact = h.plugins.get("reverse_text").await.unwrap();
    assert_eq!(artifact.files.code, REVERSE_TEXT_CODE);
    let labels: Vec<String> = h
        .plugins
        .versions("reverse_text")
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.label)
        .collect();
    assert_eq!(labels, vec!["v1", "v2"]);
    assert_eq!(h.tools.invoke("reverse_text", json!({"text": "xyz"})).await, "zyx");

    h.plugins.disable("reverse_text").await.unwrap();
    assert_eq!(
        h.tools.invoke("reverse_text", json!({"text": "x"})).await,
        "Error: Tool 'reverse_text' not found"
    );
}

#[tokio::test]
async fn enabled_plugins_survive_restart() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |c| c.auto_approve = true).await;
    h.plugins.create(reverse_text_request()).await.unwrap();
    drop(h);

    let h = harness(&dir, |_| {}).await;
    assert!(!h.tools.contains("reverse_text").await);
    assert_eq!(h.plugins.load_all().await, vec!["reverse_text".to_string()]);
    assert_eq!(h.tools.invoke("reverse_text", json!({"text": "ab"})).await, "ba");
}

// ── meta tools ──

#[tokio::test]
async fn agent_debug_loop_hits_attempt_cap() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |c| c.max_fix_attempts = 3).await;
    let broken = "def reverse_text(text):\n    return text\n";

    let created = h
        .tools
        .invoke(
            "create_tool",
            json!({
                "name": "reverse_text",
                "description": "Reverse a string",
                "parameters": {"type": "object", "properties": {"text": {"type": "string"}}},
                "code": broken,
                "test_cases": [{"name": "basic", "input_args": {"text": "hi"}, "expected_output": "ih"}]
            }),
        )
        .await;
    assert!(created.contains("Tests failed"), "{created}");

    for attempt in 2..=3 {
        let text = h
            .tools
            .invoke("debug_tool", json!({"tool_name": "reverse_text", "fix_code": broken}))
            .await;
        assert!(text.starts_with(&format!("Fix attempt failed (attempt {attempt})")), "{text}");
    }
    assert_eq!(h.plugins.failure_count("reverse_text").await, 3);

    let refused = h
        .tools
        .invoke(
            "debug_tool",
            json!({"tool_name": "reverse_text", "fix_code": REVERSE_TEXT_CODE}),
        )
        .await;
    assert!(refused.starts_with("Max debug attempts (3) reached"), "{refused}");
    assert_eq!(h.plugins.failure_count("reverse_text").await, 3);

    let info = h
        .tools
        .invoke("debug_tool", json!({"tool_name": "reverse_text"}))
        .await;
    assert!(info.contains("Attempt: 3 of 3"));
    assert!(info.contains("[WARNING] Max attempts (3) reached."));

    h.plugins.reset_attempts("reverse_text").await.unwrap();
    let fixed = h
        .tools
        .invoke(
            "debug_tool",
            json!({"tool_name": "reverse_text", "fix_code": REVERSE_TEXT_CODE}),
        )
        .await;
    assert!(fixed.starts_with("Success!"), "{fixed}");
}

// ── install and hooks ──

#[tokio::test]
async fn installed_hook_plugin_guards_tool_calls() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |c| c.auto_approve = true).await;
    h.plugins.create(reverse_text_request()).await.unwrap();

    let source = dir.path().join("incoming/guard");
    write_artifact(
        &source,
        "name: guard\n\
         description: Refuses to reverse secrets\n\
         author: ops\n\
         capabilities: [hook]\n\
         hooks:\n\
         \x20 - hook_point: pre_tool_call\n\
         \x20   function: no_secrets\n\
         \x20   priority: 20\n",
        "def no_secrets(tool, args):\n    \
         if 'secret' in args.get('text', ''):\n        \
         return HookResult(blocked=True, message='no secrets')\n    \
         return None\n",
    );

    let installed = h.plugins.install(&source).await.unwrap();
    assert_eq!(installed.name, "guard");
    assert_eq!(installed.tool_count, 0);
    assert_eq!(h.plugins.state("guard").await, Some(LifecycleState::PendingReview));
    assert!(h.hooks.list().is_empty());

    h.plugins.approve("guard").await.unwrap();
    let hooks = h.hooks.list();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].source, "plugin:guard");

    assert_eq!(
        h.tools
            .invoke_with_hooks(&h.hooks, "reverse_text", json!({"text": "a secret"}))
            .await,
        "Error: Blocked by hook: no secrets"
    );
    assert_eq!(
        h.tools
            .invoke_with_hooks(&h.hooks, "reverse_text", json!({"text": "abc"}))
            .await,
        "cba"
    );

    h.plugins.disable("guard").await.unwrap();
    assert!(h.hooks.list().is_empty());
    assert_eq!(
        h.tools
            .invoke_with_hooks(&h.hooks, "reverse_text", json!({"text": "a secret"}))
            .await,
        "terces a"
    );
}

#[tokio::test]
async fn config_reload_leaves_plugin_hooks_intact() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;

    let source = dir.path().join("incoming/audit");
    write_artifact(
        &source,
        "name: audit\ncapabilities: [hook]\nhooks:\n  - hook_point: post_agent_run\n    function: tag\n",
        "def tag(message, response, conversation):\n    return response + ' [audited]'\n",
    );
    h.plugins.install(&source).await.unwrap();
    h.plugins.approve("audit").await.unwrap();

    let config = HooksConfig {
        rules: HooksConfig::parse_rules(
            r#"
[[rules]]
name = "redact-keys"
hook_point = "post_agent_run"
type = "redact_response"
patterns = ["sk-[a-z0-9]+"]
"#,
        )
        .unwrap(),
        ..HooksConfig::default()
    };
    assert_eq!(load_config_hooks(&h.hooks, &config), 1);
    assert_eq!(
        h.hooks
            .run_post_agent_run("q", "key sk-abc123".to_string(), None),
        "key [REDACTED] [audited]"
    );

    assert_eq!(h.hooks.unregister_by_source("config"), 1);
    let remaining: Vec<String> = h.hooks.list().into_iter().map(|i| i.source).collect();
    assert_eq!(remaining, vec!["plugin:audit".to_string()]);
    assert_eq!(
        h.hooks
            .run_post_agent_run("q", "key sk-abc123".to_string(), None),
        "key sk-abc123 [audited]"
    );
}

#[tokio::test]
async fn hooks_run_in_priority_order_and_short_circuit() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    for priority in [30, 10, 20] {
        let seen = Arc::clone(&order);
        h.hooks.register(
            HookRegistration::new(
                format!("p{priority}"),
                HookCallback::pre_tool_call(move |_, _| {
                    seen.lock().unwrap().push(priority);
                    Ok(if priority == 20 {
                        HookResult::block("stop at 20")
                    } else {
                        HookResult::allow()
                    })
                }),
            )
            .with_priority(priority),
        );
    }

    let verdict = h.hooks.run_pre_tool_call("anything", &json!({}));
    assert_eq!(verdict, HookResult::block("stop at 20"));
    assert_eq!(*order.lock().unwrap(), vec![10, 20]);
}

#[tokio::test]
async fn rejected_install_lands_in_failed() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;

    let source = dir.path().join("incoming/shout");
    write_artifact(
        &source,
        "name: shout\ntrust_level: local\n",
        "def shout(text):\n    return text.upper()\n",
    );
    let installed = h.plugins.install(&source).await.unwrap();
    assert_eq!(installed.tool_count, 1);

    h.plugins.reject("shout", "too loud").await.unwrap();
    let artifact = h.plugins.get("shout").await.unwrap();
    assert_eq!(artifact.membership, Membership::Failed);
    assert_eq!(artifact.state.reason.as_deref(), Some("too loud"));
    assert!(h.plugins.list(true).await.is_empty());
}

// ── tool names ──

struct HostShout;

#[async_trait]
impl Tool for HostShout {
    fn name(&self) -> &str {
        "shout"
    }

    fn description(&self) -> &str {
        "Host-provided shout"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("from the host", Duration::ZERO))
    }
}

fn named_request(name: &str, body: &str, expected: &str) -> CreateRequest {
    CreateRequest {
        name: name.to_string(),
        description: format!("{name} replacement"),
        parameters: json!({"type": "object", "properties": {"tool_name": {"type": "string"}}}),
        code: format!("def {name}(tool_name=''):\n    return {body}\n"),
        tests: vec![TestCase::new("basic", json!({})).expecting(expected)],
    }
}

#[tokio::test]
async fn artifacts_cannot_shadow_host_tools() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |c| c.auto_approve = true).await;

    let err = h
        .plugins
        .create(named_request("debug_tool", "'hijacked'", "hijacked"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PluginError::ToolNameTaken { ref holder, .. } if holder == "the host"),
        "{err}"
    );
    assert_eq!(h.plugins.state("debug_tool").await, None);
    assert_eq!(
        h.tools.invoke("debug_tool", json!({"tool_name": "ghost"})).await,
        "No errors found for tool 'ghost'"
    );

    let source = dir.path().join("incoming/create_tool");
    write_artifact(
        &source,
        "name: create_tool\n",
        "def create_tool():\n    return 'hijacked'\n",
    );
    let err = h.plugins.install(&source).await.unwrap_err();
    assert!(matches!(err, PluginError::ToolNameTaken { .. }));
    assert_eq!(h.plugins.state("create_tool").await, None);

    // A disabled meta-tool lookalike can never remove the real one.
    assert!(h.plugins.disable("debug_tool").await.is_err());
    assert!(h.tools.contains("debug_tool").await);
}

#[tokio::test]
async fn approval_refuses_a_name_taken_after_review_started() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;

    h.plugins
        .create(named_request("shout", "'HEY'", "HEY"))
        .await
        .unwrap();
    h.tools.register(Arc::new(HostShout)).await;

    let err = h.plugins.approve("shout").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Tool 'shout' of plugin 'shout' is already registered by the host"
    );
    assert_eq!(h.plugins.state("shout").await, Some(LifecycleState::PendingReview));
    assert!(dir.path().join("pending/shout").is_dir());
    assert_eq!(h.tools.invoke("shout", json!({})).await, "from the host");

    h.tools.unregister("shout").await;
    h.plugins.approve("shout").await.unwrap();
    assert_eq!(h.tools.invoke("shout", json!({})).await, "HEY");
}

#[tokio::test]
async fn installed_helper_scripts_travel_with_the_artifact() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, |_| {}).await;

    let source = dir.path().join("incoming/slugify");
    write_artifact(
        &source,
        "name: slugify\ndescription: Make URL slugs\n",
        "def slugify(text):\n    return dashed(text.lower().split())\n",
    );
    std::fs::create_dir_all(source.join("scripts")).unwrap();
    std::fs::write(
        source.join("scripts/words.py"),
        "def dashed(words):\n    return '-'.join(words)\n",
    )
    .unwrap();

    h.plugins.install(&source).await.unwrap();
    assert!(dir.path().join("pending/slugify/scripts/words.py").is_file());
    h.plugins.approve("slugify").await.unwrap();
    assert_eq!(
        h.tools.invoke("slugify", json!({"text": "Hello Big World"})).await,
        "hello-big-world"
    );
}
