use std::fs;

use anyhow::Result;
use serde_json::json;

use cmb_config::{ServerEntry, ServerTransport};

use crate::builtin;
use crate::manager::UpstreamManager;

fn write_script(dir: &std::path::Path) -> Result<std::path::PathBuf> {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}},{"name":"sum_tool","description":"sum","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

fn stdio_entry(script: &std::path::Path) -> ServerEntry {
    ServerEntry {
        transport: ServerTransport::Stdio {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
        },
        env: Default::default(),
        oauth: None,
    }
}

#[tokio::test]
async fn connect_registers_namespaced_tools() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);

    assert!(manager.connect_server("mock", &stdio_entry(&script)).await);

    let descriptors = manager.get_all_tool_descriptors().await;
    assert_eq!(descriptors.len(), 2);
    assert!(descriptors.keys().all(|key| key.starts_with("mock__")));

    let tool = manager.get_tool_by_name("mock__echo_tool").await.unwrap();
    assert_eq!(tool.server, "mock");
    assert_eq!(tool.tool_name, "echo_tool");
    assert_eq!(tool.description, "echo");

    let reply = tool.execute(json!({"value": "ping"})).await.unwrap();
    assert_eq!(reply, json!("pong"));

    manager.disconnect_all().await;
    Ok(())
}

#[tokio::test]
async fn sanitized_names_are_the_public_surface() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);

    assert!(manager.connect_server("my-svc", &stdio_entry(&script)).await);

    // The sanitized form resolves; the raw namespaced form does not.
    assert!(manager.get_tool_by_name("my_svc__echo_tool").await.is_some());
    assert!(manager.get_tool_by_name("my-svc__echo_tool").await.is_none());

    let listing = manager.get_tool_list(None).await;
    assert!(listing.iter().all(|entry| !entry.name.contains('-')));

    manager.disconnect_all().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_every_descriptor() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);

    manager.connect_server("mock", &stdio_entry(&script)).await;
    assert_eq!(manager.connected_server_names().await, vec!["mock"]);

    assert!(manager.disconnect_server("mock").await);
    assert!(!manager.disconnect_server("mock").await);

    assert!(manager.connected_server_names().await.is_empty());
    let descriptors = manager.get_all_tool_descriptors().await;
    assert!(!descriptors.keys().any(|key| key.starts_with("mock__")));
    Ok(())
}

#[tokio::test]
async fn failed_connect_leaves_registry_unchanged() {
    let manager = UpstreamManager::new(None);
    let entry = ServerEntry {
        transport: ServerTransport::Stdio {
            command: "/nonexistent/definitely-not-a-binary".to_string(),
            args: vec![],
        },
        env: Default::default(),
        oauth: None,
    };

    assert!(!manager.connect_server("ghost", &entry).await);
    assert!(manager.connected_server_names().await.is_empty());
    assert!(manager.get_all_tool_descriptors().await.is_empty());
}

#[tokio::test]
async fn descriptor_copies_do_not_affect_the_manager() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);
    manager.connect_server("mock", &stdio_entry(&script)).await;

    let mut copy = manager.get_all_tool_descriptors().await;
    copy.clear();
    assert_eq!(manager.get_all_tool_descriptors().await.len(), 2);

    manager.disconnect_all().await;
    Ok(())
}

#[tokio::test]
async fn virtual_server_registers_without_transport() {
    let manager = UpstreamManager::new(None);
    builtin::register_utils(&manager).await;

    let names = manager.connected_server_names().await;
    assert_eq!(names, vec!["utils"]);

    let parse = manager.get_tool_by_name("utils__yaml_parse").await.unwrap();
    assert!(parse.is_virtual());
    let value = parse
        .execute(json!({"text": "a: 1\nb: [2, 3]"}))
        .await
        .unwrap();
    assert_eq!(value, json!({"a": 1, "b": [2, 3]}));
}

#[tokio::test]
async fn server_tool_info_counts_by_server() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);
    manager.connect_server("mock", &stdio_entry(&script)).await;
    builtin::register_utils(&manager).await;

    let info = manager.get_server_tool_info().await;
    assert_eq!(info.len(), 2);
    let mock = info.iter().find(|s| s.name == "mock").unwrap();
    assert_eq!(mock.tool_count, 2);
    assert_eq!(manager.total_tool_count().await, 4);

    manager.disconnect_all().await;
    Ok(())
}

#[tokio::test]
async fn background_connect_eventually_registers() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path())?;
    let manager = UpstreamManager::new(None);

    manager.connect_server_in_background("mock".to_string(), stdio_entry(&script));

    let mut connected = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if manager.total_tool_count().await == 2 {
            connected = true;
            break;
        }
    }
    assert!(connected, "background connect never completed");

    manager.disconnect_all().await;
    Ok(())
}
