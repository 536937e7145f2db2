use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use cmb_sandbox::SandboxFactory;
use cmb_session::{BackendFactory, SessionResolver};
use cmb_upstream::{UpstreamManager, builtin};

use crate::handler::{
    BridgeState, handle_eval, handle_get_function_schema, handle_get_functions,
    handle_search_functions, handle_status, tool_definitions,
};

async fn test_state() -> Arc<BridgeState> {
    let manager = UpstreamManager::new(None);
    builtin::register_utils(&manager).await;

    let factory = BackendFactory::new(
        SandboxFactory::new(Duration::from_secs(10)),
        Some(cmb_sandbox::BackendKind::Vm),
    );
    let resolver = SessionResolver::new(Arc::new(factory), Duration::from_secs(1800), false);
    BridgeState::new(manager, resolver)
}

fn result_text(result: &rmcp::model::CallToolResult) -> String {
    result.content[0]
        .as_text()
        .map(|t| t.text.clone())
        .unwrap_or_default()
}

fn args(value: Value) -> rmcp::model::JsonObject {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn eval_returns_json_body_of_the_envelope() {
    let state = test_state().await;
    let result = handle_eval(
        &state,
        None,
        "async () => ({ type: \"json\", value: 6*7 })",
    )
    .await;

    assert_ne!(result.is_error, Some(true));
    assert_eq!(result.content.len(), 1);
    assert_eq!(result_text(&result), "42");
}

#[tokio::test]
async fn eval_error_carries_console_output_block() {
    let state = test_state().await;
    let result = handle_eval(
        &state,
        None,
        "console.log(\"before the crash\"); throw new Error(\"boom\")",
    )
    .await;

    assert_eq!(result.is_error, Some(true));
    let text = result_text(&result);
    assert!(text.contains("boom"), "got: {text}");
    assert!(text.contains("\n\nConsole output:\nbefore the crash"), "got: {text}");
}

#[tokio::test]
async fn eval_reaches_virtual_tools_through_codemode() {
    let state = test_state().await;
    let result = handle_eval(
        &state,
        None,
        "const v = await codemode.utils__yaml_parse({text: \"n: 7\"}); v.n",
    )
    .await;

    assert_ne!(result.is_error, Some(true));
    assert_eq!(result_text(&result), "7");
}

#[tokio::test]
async fn eval_snippet_can_catch_upstream_failure() {
    let state = test_state().await;
    let result = handle_eval(
        &state,
        None,
        "try { await codemode.utils__yaml_parse({}); return \"no\"; } catch (e) { return \"caught\"; }",
    )
    .await;

    assert_ne!(result.is_error, Some(true));
    assert_eq!(result_text(&result), "\"caught\"");
}

#[tokio::test]
async fn status_reports_executor_servers_and_totals() {
    let state = test_state().await;
    // Boot the singleton so executor info exists.
    handle_eval(&state, None, "1").await;

    let result = handle_status(&state).await;
    let payload: Value = serde_json::from_str(&result_text(&result)).unwrap();

    assert_eq!(payload["executor"]["type"], "vm");
    assert_eq!(payload["executor"]["timeout"], 10);
    assert_eq!(payload["totalTools"], 2);
    assert_eq!(payload["servers"][0]["name"], "utils");
    assert_eq!(payload["servers"][0]["toolCount"], 2);
}

#[tokio::test]
async fn get_functions_paginates_and_rejects_bad_cursors() {
    let state = test_state().await;

    let result = handle_get_functions(&state, &args(json!({"pageSize": 1}))).await;
    let page: Value = serde_json::from_str(&result_text(&result)).unwrap();
    assert_eq!(page["totalTools"], 2);
    assert_eq!(page["servers"][0]["server"], "utils");
    assert!(page["nextCursor"].is_string());

    let result =
        handle_get_functions(&state, &args(json!({"cursor": "not-a-valid-cursor!!!"}))).await;
    let payload: Value = serde_json::from_str(&result_text(&result)).unwrap();
    assert_eq!(payload, json!({"error": "Invalid cursor"}));
}

#[tokio::test]
async fn get_function_schema_renders_known_and_rejects_unknown() {
    let state = test_state().await;

    let result =
        handle_get_function_schema(&state, &args(json!({"tool_name": "utils__yaml_parse"}))).await;
    assert_ne!(result.is_error, Some(true));
    let text = result_text(&result);
    assert!(text.contains("declare function utils__yaml_parse"));
    assert!(text.contains("text: string;"));

    let result =
        handle_get_function_schema(&state, &args(json!({"tool_name": "nope__missing"}))).await;
    assert_eq!(result.is_error, Some(true));
    assert!(result_text(&result).contains("Unknown tool 'nope__missing'"));
}

#[tokio::test]
async fn search_functions_ranks_the_yaml_tools() {
    let state = test_state().await;

    let result = handle_search_functions(&state, &args(json!({"query": "YAML parse"}))).await;
    assert_ne!(result.is_error, Some(true));
    let payload: Value = serde_json::from_str(&result_text(&result)).unwrap();
    let results = payload["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["name"], "utils__yaml_parse");
}

#[tokio::test]
async fn discovery_views_reset_on_servers_changed() {
    let state = test_state().await;

    // Prime both caches.
    handle_get_function_schema(&state, &args(json!({"tool_name": "utils__yaml_parse"}))).await;
    handle_search_functions(&state, &args(json!({"query": "yaml"}))).await;
    assert!(!state.schema_cache.is_empty());

    state.on_servers_changed().await;
    assert!(state.schema_cache.is_empty());
    assert!(state.search_index.read().await.is_some());
}

#[test]
fn downstream_tool_set_is_fixed() {
    let names: Vec<String> = tool_definitions()
        .iter()
        .map(|tool| tool.name.to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "eval",
            "status",
            "get_functions",
            "get_function_schema",
            "search_functions"
        ]
    );
}
