//! The upstream registry.
//!
//! All mutation happens behind one `RwLock`; readers always get fresh
//! copies, so a caller can never corrupt the registry and a half-failed
//! connect never leaves partial state behind.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rmcp::RoleClient;
use rmcp::service::{RunningService, ServiceExt};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

use cmb_config::{ServerEntry, ServerTransport, TokenStore};
use cmb_core::{TOOL_NAME_DELIMITER, sanitize_identifier};

use crate::descriptor::{ToolDescriptor, ToolListEntry};

enum ServerHandle {
    Remote {
        service: RunningService<RoleClient, ()>,
        child: Option<tokio::process::Child>,
    },
    Virtual,
}

#[derive(Default)]
struct Registry {
    servers: HashMap<String, ServerHandle>,
    /// Sanitized namespaced name → descriptor. Never contains a bare key.
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

/// Per-server summary for the `status` tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerToolInfo {
    pub name: String,
    #[serde(rename = "toolCount")]
    pub tool_count: usize,
    pub tools: Vec<String>,
}

pub struct UpstreamManager {
    registry: RwLock<Registry>,
    token_store: Option<Arc<TokenStore>>,
}

impl UpstreamManager {
    pub fn new(token_store: Option<Arc<TokenStore>>) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            token_store,
        })
    }

    /// Connect one upstream server and register its tools atomically.
    ///
    /// Returns false (with a log line) on any failure; the registry is left
    /// exactly as it was.
    pub async fn connect_server(&self, name: &str, entry: &ServerEntry) -> bool {
        match self.try_connect(name, entry).await {
            Ok(tool_count) => {
                tracing::info!(server = %name, tools = tool_count, "upstream server connected");
                true
            }
            Err(error) => {
                tracing::error!(server = %name, error = %error, "upstream connect failed");
                false
            }
        }
    }

    /// Non-blocking connect used at startup so one slow server cannot delay
    /// the bridge becoming ready.
    pub fn connect_server_in_background(self: &Arc<Self>, name: String, entry: ServerEntry) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.connect_server(&name, &entry).await;
        });
    }

    async fn try_connect(&self, name: &str, entry: &ServerEntry) -> Result<usize> {
        let (service, child) = match &entry.transport {
            ServerTransport::Stdio { command, args } => {
                let (service, child) = self
                    .connect_stdio(name, command, args, &entry.env)
                    .await?;
                (service, Some(child))
            }
            ServerTransport::Http { url } => (self.connect_http(name, url).await?, None),
        };

        let peer = service.peer().clone();
        let tools = service
            .list_tools(None)
            .await
            .with_context(|| format!("tools/list failed for '{name}'"))?
            .tools;

        let descriptors: Vec<Arc<ToolDescriptor>> = tools
            .into_iter()
            .map(|tool| Arc::new(ToolDescriptor::remote(name, tool, peer.clone())))
            .collect();
        let count = descriptors.len();

        let previous = {
            let mut registry = self.registry.write().await;
            remove_server_locked(&mut registry, name);
            for descriptor in descriptors {
                registry.tools.insert(descriptor.name.clone(), descriptor);
            }
            registry
                .servers
                .insert(name.to_string(), ServerHandle::Remote { service, child })
        };
        if let Some(handle) = previous {
            shutdown_handle(name, handle).await;
        }

        Ok(count)
    }

    async fn connect_stdio(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<(RunningService<RoleClient, ()>, tokio::process::Child)> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: setsid is async-signal-safe and runs before exec.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{name}'"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{name}'"))?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("MCP handshake failed for '{name}'"))?;

        Ok((service, child))
    }

    async fn connect_http(&self, name: &str, url: &str) -> Result<RunningService<RoleClient, ()>> {
        use rmcp::transport::StreamableHttpClientTransport;
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

        tracing::info!(server = %name, url = %url, "connecting to HTTP MCP server");

        let bearer = match &self.token_store {
            Some(store) => store.bearer_token(name).unwrap_or_else(|error| {
                tracing::warn!(server = %name, error = %error, "token lookup failed");
                None
            }),
            None => None,
        };

        let service = match bearer {
            Some(token) => {
                let mut headers = reqwest::header::HeaderMap::new();
                let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("stored token is not a valid header value")?;
                headers.insert(reqwest::header::AUTHORIZATION, value);
                let client = reqwest::Client::builder()
                    .default_headers(headers)
                    .build()
                    .context("failed to build HTTP client")?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );
                ().serve(transport).await
            }
            None => {
                let transport = StreamableHttpClientTransport::from_uri(url.to_string());
                ().serve(transport).await
            }
        }
        .with_context(|| format!("failed to connect to HTTP MCP server '{name}' at {url}"))?;

        Ok(service)
    }

    /// Register a virtual (in-process) server.
    pub async fn register_server(&self, name: &str, descriptors: Vec<ToolDescriptor>) {
        let mut registry = self.registry.write().await;
        remove_server_locked(&mut registry, name);
        for descriptor in descriptors {
            registry
                .tools
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        registry
            .servers
            .insert(name.to_string(), ServerHandle::Virtual);
    }

    /// Best-effort disconnect: the server and its descriptors are removed
    /// even when the close itself fails.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let handle = {
            let mut registry = self.registry.write().await;
            remove_server_locked(&mut registry, name)
        };
        match handle {
            Some(handle) => {
                shutdown_handle(name, handle).await;
                tracing::info!(server = %name, "upstream server disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let handles: Vec<(String, ServerHandle)> = {
            let mut registry = self.registry.write().await;
            registry.tools.clear();
            registry.servers.drain().collect()
        };

        let mut tasks = JoinSet::new();
        for (name, handle) in handles {
            tasks.spawn(async move {
                shutdown_handle(&name, handle).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Fresh copy of the whole registry; caller mutations never reach the
    /// manager.
    pub async fn get_all_tool_descriptors(&self) -> HashMap<String, Arc<ToolDescriptor>> {
        self.registry.read().await.tools.clone()
    }

    /// Ordered `{server, name, description}` rows, optionally filtered by
    /// (unsanitized) server name.
    pub async fn get_tool_list(&self, server_filter: Option<&str>) -> Vec<ToolListEntry> {
        let registry = self.registry.read().await;
        let mut entries: Vec<ToolListEntry> = registry
            .tools
            .values()
            .filter(|tool| server_filter.is_none_or(|server| tool.server == server))
            .map(|tool| tool.list_entry())
            .collect();
        entries.sort_by(|a, b| (&a.server, &a.name).cmp(&(&b.server, &b.name)));
        entries
    }

    /// Lookup by sanitized name only; raw namespaced forms miss.
    pub async fn get_tool_by_name(&self, sanitized: &str) -> Option<Arc<ToolDescriptor>> {
        self.registry.read().await.tools.get(sanitized).cloned()
    }

    pub async fn get_server_tool_info(&self) -> Vec<ServerToolInfo> {
        let registry = self.registry.read().await;
        let mut info: Vec<ServerToolInfo> = registry
            .servers
            .keys()
            .map(|server| {
                let mut tools: Vec<String> = registry
                    .tools
                    .values()
                    .filter(|tool| &tool.server == server)
                    .map(|tool| tool.name.clone())
                    .collect();
                tools.sort();
                ServerToolInfo {
                    name: server.clone(),
                    tool_count: tools.len(),
                    tools,
                }
            })
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    pub async fn connected_server_names(&self) -> Vec<String> {
        let registry = self.registry.read().await;
        let mut names: Vec<String> = registry.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn total_tool_count(&self) -> usize {
        self.registry.read().await.tools.len()
    }
}

/// Drop a server's handle and every descriptor under its prefix.
fn remove_server_locked(registry: &mut Registry, name: &str) -> Option<ServerHandle> {
    let prefix = format!("{}{}", sanitize_identifier(name), TOOL_NAME_DELIMITER);
    registry.tools.retain(|key, _| !key.starts_with(&prefix));
    registry.servers.remove(name)
}

async fn shutdown_handle(name: &str, handle: ServerHandle) {
    let ServerHandle::Remote { service, child } = handle else {
        return;
    };
    if let Err(error) = service.cancel().await {
        tracing::debug!(server = %name, error = %error, "upstream close failed");
    }
    if let Some(mut child) = child {
        match tokio::time::timeout(std::time::Duration::from_secs(3), child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(server = %name, error = %error, "failed to wait MCP child");
            }
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
