//! Validates that built-in and plugin tool schemas conform to the
//! function-calling rules enforced by `validate_tool_schema`.
//!
//! Catches `required` keys missing from `properties`, non-object top levels
//! and arrays without `items` before a model ever sees the definition.

use serde_json::json;
use tempfile::TempDir;

use toolforge::testing::{TestHarnessBuilder, reverse_text_request};
use toolforge::tools::validate_tool_schema;

/// Validate schemas of every tool registered by `register_plugin_tools()`.
#[tokio::test]
async fn all_builtin_tool_schemas_are_valid() {
    let dir = TempDir::new().unwrap();
    let harness = TestHarnessBuilder::new(dir.path())
        .with_plugin_tools()
        .build()
        .await
        .unwrap();

    let schemas = harness.tools.schemas().await;
    assert!(!schemas.is_empty(), "registry should have tools after registration");

    let mut all_errors = Vec::new();
    for schema in &schemas {
        let errors = validate_tool_schema(&schema.parameters, &schema.name);
        if !errors.is_empty() {
            all_errors.push(format!(
                "Tool '{}' has schema errors:\n  {}",
                schema.name,
                errors.join("\n  ")
            ));
        }
    }

    assert!(
        all_errors.is_empty(),
        "Tool schema validation failures:\n{}",
        all_errors.join("\n\n")
    );
}

/// Guards against a new built-in tool being added without schema coverage.
#[tokio::test]
async fn builtin_registration_covers_expected_tools() {
    let dir = TempDir::new().unwrap();
    let harness = TestHarnessBuilder::new(dir.path())
        .with_plugin_tools()
        .build()
        .await
        .unwrap();

    assert_eq!(
        harness.tools.names().await,
        vec!["create_tool", "debug_tool", "rollback_tool"],
        "Built-in tool set changed. Update this test and ensure new tools have valid schemas."
    );
}

/// A generated plugin's declared schema is what the agent is offered.
#[tokio::test]
async fn plugin_tool_definition_carries_declared_schema() {
    let dir = TempDir::new().unwrap();
    let harness = TestHarnessBuilder::new(dir.path())
        .configure(|c| c.auto_approve = true)
        .build()
        .await
        .unwrap();
    harness.plugins.create(reverse_text_request()).await.unwrap();

    let defs = harness.tools.tool_definitions().await;
    assert_eq!(defs.len(), 1);
    let function = &defs[0]["function"];
    assert_eq!(function["name"], "reverse_text");
    assert_eq!(function["description"], "Reverse a string");
    assert_eq!(function["parameters"]["required"], json!(["text"]));
    assert!(validate_tool_schema(&function["parameters"], "reverse_text").is_empty());
}

/// `filter_tools` hooks shape the definitions without touching the registry.
#[tokio::test]
async fn filtered_definitions_hide_tools_without_unregistering() {
    let dir = TempDir::new().unwrap();
    let harness = TestHarnessBuilder::new(dir.path())
        .with_plugin_tools()
        .build()
        .await
        .unwrap();

    let rules = toolforge::config::HooksConfig::parse_rules(
        r#"
[[rules]]
name = "no-rollbacks"
hook_point = "filter_tools"
type = "denylist"
tools = ["rollback_tool"]
"#,
    )
    .unwrap();
    let config = toolforge::config::HooksConfig {
        rules,
        ..Default::default()
    };
    assert_eq!(toolforge::hooks::load_config_hooks(&harness.hooks, &config), 1);

    let names: Vec<String> = harness
        .tools
        .filtered_definitions(&harness.hooks)
        .await
        .iter()
        .map(|d| d["function"]["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["create_tool", "debug_tool"]);
    assert!(harness.tools.contains("rollback_tool").await);
}
