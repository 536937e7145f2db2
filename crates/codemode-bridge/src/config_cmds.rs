//! `cmb config …` subcommands.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use cmb_config::{BridgeConfig, ServerEntry, ServerTransport, default_config_path, default_token_path};

fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

fn load_or_default(path: &PathBuf) -> Result<BridgeConfig> {
    if path.exists() {
        BridgeConfig::load(path)
    } else {
        Ok(BridgeConfig::default())
    }
}

#[allow(clippy::too_many_arguments)]
pub fn handle_add(
    name: String,
    entry_type: String,
    command: Option<String>,
    args: Vec<String>,
    url: Option<String>,
    env: Vec<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let path = resolve_path(config)?;
    let mut parsed_env = BTreeMap::new();
    for pair in env {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--env entries must look like KEY=VALUE, got '{pair}'");
        };
        parsed_env.insert(key.to_string(), value.to_string());
    }

    let transport = match entry_type.as_str() {
        "stdio" => ServerTransport::Stdio {
            command: command.context("--type stdio requires --command")?,
            args,
        },
        "http" => ServerTransport::Http {
            url: url.context("--type http requires --url")?,
        },
        other => bail!("unknown transport type '{other}' (expected: stdio, http)"),
    };

    let mut cfg = load_or_default(&path)?;
    let replaced = cfg
        .servers
        .insert(
            name.clone(),
            ServerEntry {
                transport,
                env: parsed_env,
                oauth: None,
            },
        )
        .is_some();
    cfg.save(&path)?;

    if replaced {
        println!("Replaced server '{name}' in {}", path.display());
    } else {
        println!("Added server '{name}' to {}", path.display());
    }
    Ok(())
}

pub fn handle_remove(name: String, config: Option<PathBuf>) -> Result<()> {
    let path = resolve_path(config)?;
    let mut cfg = load_or_default(&path)?;
    if cfg.servers.remove(&name).is_none() {
        bail!("no server named '{name}' in {}", path.display());
    }
    cfg.save(&path)?;
    println!("Removed server '{name}'");
    Ok(())
}

pub fn handle_edit(config: Option<PathBuf>) -> Result<()> {
    let path = resolve_path(config)?;
    if !path.exists() {
        BridgeConfig::default().save(&path)?;
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = std::process::Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("failed to launch editor '{editor}'"))?;
    if !status.success() {
        bail!("editor exited with {status}");
    }

    // Surface syntax problems right away instead of at the next serve.
    match BridgeConfig::load(&path) {
        Ok(cfg) => println!("Config OK ({} servers)", cfg.servers.len()),
        Err(error) => eprintln!("WARNING: config does not parse: {error:#}"),
    }
    Ok(())
}

pub fn handle_show(name: String, config: Option<PathBuf>) -> Result<()> {
    let path = resolve_path(config)?;
    let cfg = load_or_default(&path)?;
    let entry = cfg
        .servers
        .get(&name)
        .with_context(|| format!("no server named '{name}' in {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}

pub fn handle_list(config: Option<PathBuf>) -> Result<()> {
    let path = resolve_path(config)?;
    let cfg = load_or_default(&path)?;
    if cfg.servers.is_empty() {
        println!("No servers configured ({})", path.display());
        return Ok(());
    }
    for (name, entry) in &cfg.servers {
        let target = match &entry.transport {
            ServerTransport::Stdio { command, args } => {
                format!("{command} {}", args.join(" "))
            }
            ServerTransport::Http { url } => url.clone(),
        };
        let auth = if entry.oauth.is_some() { " [oauth]" } else { "" };
        println!(
            "{name:<20} {:<6} {}{auth}",
            entry.transport.label(),
            target.trim_end()
        );
    }
    Ok(())
}

pub fn handle_info(config: Option<PathBuf>) -> Result<()> {
    let path = resolve_path(config)?;
    let cfg = load_or_default(&path)?;
    println!("Config file: {}", path.display());
    println!("Token file:  {}", default_token_path()?.display());
    println!("Servers:     {}", cfg.servers.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_show_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        handle_add(
            "files".into(),
            "stdio".into(),
            Some("npx".into()),
            vec!["-y".into(), "files-mcp".into()],
            None,
            vec!["REGION=eu".into()],
            Some(path.clone()),
        )
        .unwrap();

        let cfg = BridgeConfig::load(&path).unwrap();
        assert!(cfg.servers["files"].is_stdio());
        assert_eq!(cfg.servers["files"].env["REGION"], "eu");

        handle_show("files".into(), Some(path.clone())).unwrap();
        handle_remove("files".into(), Some(path.clone())).unwrap();
        assert!(BridgeConfig::load(&path).unwrap().servers.is_empty());
    }

    #[test]
    fn add_validates_transport_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let err = handle_add(
            "bad".into(),
            "stdio".into(),
            None,
            vec![],
            None,
            vec![],
            Some(path.clone()),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("--command"));

        let err = handle_add(
            "bad".into(),
            "ws".into(),
            None,
            vec![],
            Some("wss://x".into()),
            vec![],
            Some(path),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown transport type"));
    }

    #[test]
    fn remove_missing_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let err = handle_remove("ghost".into(), Some(path)).unwrap_err();
        assert!(format!("{err:#}").contains("no server named 'ghost'"));
    }

    #[test]
    fn env_entries_must_be_key_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let err = handle_add(
            "s".into(),
            "http".into(),
            None,
            vec![],
            Some("https://x/mcp".into()),
            vec!["NOT_A_PAIR".into()],
            Some(path),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("KEY=VALUE"));
    }
}
