//! The MCP front door: one handler type registered on every downstream
//! server object, serving `eval`, `status`, and the discovery tools.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{Peer, RequestContext};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{Value, json};

use cmb_core::SINGLETON_SESSION_ID;
use cmb_discovery::{SchemaCache, SearchIndex, paginate_tool_list};
use cmb_sandbox::{ToolHandler, ToolTable};
use cmb_session::SessionResolver;
use cmb_upstream::UpstreamManager;

const SEARCH_DEFAULT_LIMIT: usize = 5;
const SEARCH_MAX_LIMIT: usize = 20;

/// Shared bridge state behind every session's handler.
pub struct BridgeState {
    pub manager: Arc<UpstreamManager>,
    pub resolver: Arc<SessionResolver>,
    pub schema_cache: SchemaCache,
    pub search_index: tokio::sync::RwLock<Option<SearchIndex>>,
    peers: tokio::sync::RwLock<HashMap<String, Peer<RoleServer>>>,
}

impl BridgeState {
    pub fn new(manager: Arc<UpstreamManager>, resolver: Arc<SessionResolver>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            resolver,
            schema_cache: SchemaCache::new(),
            search_index: tokio::sync::RwLock::new(None),
            peers: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Snapshot the registry into a sandbox tool table. Recomputed on every
    /// eval so late-connecting servers appear without a restart.
    pub async fn tool_table(&self) -> ToolTable {
        self.manager
            .get_all_tool_descriptors()
            .await
            .into_iter()
            .map(|(name, descriptor)| {
                let handler: ToolHandler = Arc::new(move |args| {
                    let descriptor = descriptor.clone();
                    Box::pin(async move { descriptor.execute(args).await })
                });
                (name, handler)
            })
            .collect()
    }

    pub async fn rebuild_search_index(&self) {
        let entries = self.manager.get_tool_list(None).await;
        match SearchIndex::build(&entries) {
            Ok(index) => *self.search_index.write().await = Some(index),
            Err(error) => {
                tracing::warn!(error = %error, "failed to rebuild search index");
            }
        }
    }

    /// Live-reload hook: drop every memoized discovery view and tell the
    /// connected clients their tool list changed.
    pub async fn on_servers_changed(&self) {
        self.schema_cache.clear();
        self.rebuild_search_index().await;
        self.notify_tool_list_changed().await;
    }

    async fn notify_tool_list_changed(&self) {
        let peers: Vec<Peer<RoleServer>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if let Err(error) = peer.notify_tool_list_changed().await {
                tracing::debug!(error = %error, "tool list change notification failed");
            }
        }
    }

    async fn register_peer(&self, session_id: &str, peer: Peer<RoleServer>) {
        self.peers
            .write()
            .await
            .insert(session_id.to_string(), peer);
    }

    async fn forget_peer(&self, session_id: &str) {
        self.peers.write().await.remove(session_id);
    }
}

/// Owns a session ID for the lifetime of one downstream MCP server object;
/// dropping the last clone disposes the session.
struct SessionHandle {
    id: String,
    state: Arc<BridgeState>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.id == SINGLETON_SESSION_ID {
            return;
        }
        let state = self.state.clone();
        let id = self.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                state.forget_peer(&id).await;
                state.resolver.dispose_session(&id).await;
            });
        }
    }
}

#[derive(Clone)]
pub struct BridgeHandler {
    state: Arc<BridgeState>,
    session: Arc<SessionHandle>,
}

impl BridgeHandler {
    /// Handler for the stdio transport and sessionless internal calls.
    pub fn singleton(state: Arc<BridgeState>) -> Self {
        Self::with_session(state, SINGLETON_SESSION_ID.to_string())
    }

    /// Handler for one HTTP session: a fresh UUID per initialize.
    pub fn for_new_session(state: Arc<BridgeState>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session = %id, "new bridge session");
        Self::with_session(state, id)
    }

    fn with_session(state: Arc<BridgeState>, id: String) -> Self {
        Self {
            session: Arc::new(SessionHandle {
                id,
                state: state.clone(),
            }),
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    fn resolver_key(&self) -> Option<&str> {
        if self.session.id == SINGLETON_SESSION_ID {
            None
        } else {
            Some(self.session.id.as_str())
        }
    }
}

fn schema_object(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

/// The fixed downstream tool set.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        Tool::new(
            "eval",
            "Execute a JavaScript snippet in an isolated sandbox. Upstream tools are \
             callable as `codemode.<server>__<tool>(args)` and return promises; the \
             snippet's final expression (or the arrow function's return value) becomes \
             the result.",
            schema_object(json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The snippet to execute"
                    }
                },
                "required": ["code"]
            })),
        ),
        Tool::new(
            "status",
            "Report the sandbox executor, connected upstream servers, and tool counts.",
            schema_object(json!({"type": "object", "properties": {}})),
        ),
        Tool::new(
            "get_functions",
            "List callable functions, paginated. Pass the returned nextCursor to walk \
             the full list.",
            schema_object(json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "Only list this server"},
                    "cursor": {"type": "string", "description": "Cursor from a previous page"},
                    "pageSize": {"type": "integer", "description": "Tools per page (default 50, max 200)"}
                }
            })),
        ),
        Tool::new(
            "get_function_schema",
            "Return the typed interface for one function, with parameter docs.",
            schema_object(json!({
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string", "description": "Sanitized function name"}
                },
                "required": ["tool_name"]
            })),
        ),
        Tool::new(
            "search_functions",
            "Keyword-search function names and descriptions, best matches first.",
            schema_object(json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search terms"},
                    "limit": {"type": "integer", "description": "Max results (default 5, max 20)"}
                },
                "required": ["query"]
            })),
        ),
    ]
}

pub async fn handle_eval(
    state: &Arc<BridgeState>,
    session_id: Option<&str>,
    code: &str,
) -> CallToolResult {
    let runtime = match state.resolver.resolve(session_id).await {
        Ok(runtime) => runtime,
        Err(error) => return CallToolResult::error(vec![Content::text(error.to_string())]),
    };

    let table = state.tool_table().await;
    match runtime.execute(code, table).await {
        Ok(execution) => match execution.error {
            None => {
                let value = unwrap_result_envelope(execution.value.unwrap_or(Value::Null));
                let text = serde_json::to_string(&value)
                    .unwrap_or_else(|_| "null".to_string());
                CallToolResult::success(vec![Content::text(text)])
            }
            Some(error) => CallToolResult::error(vec![Content::text(with_console_output(
                error,
                &execution.logs,
            ))]),
        },
        Err(error) => {
            if error.requires_dispose() {
                let key = session_id.unwrap_or(SINGLETON_SESSION_ID);
                state.resolver.dispose_session(key).await;
            }
            CallToolResult::error(vec![Content::text(error.to_string())])
        }
    }
}

/// Snippets may return a `{type: "json", value}` envelope; unwrap it so the
/// host sees the payload directly.
fn unwrap_result_envelope(value: Value) -> Value {
    match &value {
        Value::Object(map)
            if map.get("type").and_then(Value::as_str) == Some("json")
                && map.contains_key("value") =>
        {
            map.get("value").cloned().unwrap_or(Value::Null)
        }
        _ => value,
    }
}

fn with_console_output(error: String, logs: &[String]) -> String {
    if logs.is_empty() {
        error
    } else {
        format!("{error}\n\nConsole output:\n{}", logs.join("\n"))
    }
}

pub async fn handle_status(state: &Arc<BridgeState>) -> CallToolResult {
    let payload = json!({
        "executor": state.resolver.executor_info(),
        "servers": state.manager.get_server_tool_info().await,
        "totalTools": state.manager.total_tool_count().await,
    });
    json_content(payload)
}

pub async fn handle_get_functions(state: &Arc<BridgeState>, args: &JsonObject) -> CallToolResult {
    let server = args.get("server").and_then(Value::as_str);
    let cursor = args.get("cursor").and_then(Value::as_str);
    let page_size = args
        .get("pageSize")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    let entries = state.manager.get_tool_list(server).await;
    match paginate_tool_list(&entries, cursor, page_size) {
        Ok(page) => json_content(serde_json::to_value(&page).unwrap_or(Value::Null)),
        // Data-plane error payload, not a protocol failure.
        Err(_) => json_content(json!({"error": "Invalid cursor"})),
    }
}

pub async fn handle_get_function_schema(
    state: &Arc<BridgeState>,
    args: &JsonObject,
) -> CallToolResult {
    let Some(tool_name) = args.get("tool_name").and_then(Value::as_str) else {
        return CallToolResult::error(vec![Content::text(
            "missing required parameter 'tool_name'",
        )]);
    };

    match state.manager.get_tool_by_name(tool_name).await {
        Some(tool) => {
            CallToolResult::success(vec![Content::text(state.schema_cache.get_or_render(&tool))])
        }
        None => CallToolResult::error(vec![Content::text(format!("Unknown tool '{tool_name}'"))]),
    }
}

pub async fn handle_search_functions(
    state: &Arc<BridgeState>,
    args: &JsonObject,
) -> CallToolResult {
    let Some(query) = args.get("query").and_then(Value::as_str) else {
        return CallToolResult::error(vec![Content::text("missing required parameter 'query'")]);
    };
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(SEARCH_DEFAULT_LIMIT)
        .clamp(1, SEARCH_MAX_LIMIT);

    if state.search_index.read().await.is_none() {
        state.rebuild_search_index().await;
    }

    let guard = state.search_index.read().await;
    let Some(index) = guard.as_ref() else {
        return CallToolResult::error(vec![Content::text("search index unavailable")]);
    };
    match index.search(query, limit) {
        Ok(hits) => {
            let rows: Vec<Value> = hits
                .into_iter()
                .map(|hit| {
                    json!({
                        "server": hit.entry.server,
                        "name": hit.entry.name,
                        "description": hit.entry.description,
                        "score": hit.score,
                    })
                })
                .collect();
            json_content(json!({"results": rows}))
        }
        Err(error) => CallToolResult::error(vec![Content::text(format!("search failed: {error}"))]),
    }
}

fn json_content(value: Value) -> CallToolResult {
    let text = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
    CallToolResult::success(vec![Content::text(text)])
}

impl ServerHandler for BridgeHandler {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.state
            .register_peer(&self.session.id, context.peer.clone())
            .await;
        Ok(ListToolsResult::with_all_items(tool_definitions()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.state
            .register_peer(&self.session.id, context.peer.clone())
            .await;
        let args = request.arguments.unwrap_or_default();

        match request.name.as_ref() {
            "eval" => {
                let code = args
                    .get("code")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        McpError::invalid_params("eval requires a 'code' string", None)
                    })?;
                Ok(handle_eval(&self.state, self.resolver_key(), code).await)
            }
            "status" => Ok(handle_status(&self.state).await),
            "get_functions" => Ok(handle_get_functions(&self.state, &args).await),
            "get_function_schema" => Ok(handle_get_function_schema(&self.state, &args).await),
            "search_functions" => Ok(handle_search_functions(&self.state, &args).await),
            other => Err(McpError::invalid_params(
                format!("unknown tool: {other}"),
                None,
            )),
        }
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "codemode-bridge".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
