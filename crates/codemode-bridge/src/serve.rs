//! Transport wiring and process lifecycle for `cmb serve`.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::http::StatusCode;
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use serde_json::json;

use cmb_config::{TokenStore, default_config_path, default_token_path};
use cmb_sandbox::factory::DEFAULT_EXECUTE_TIMEOUT;
use cmb_sandbox::{BackendKind, SandboxFactory};
use cmb_session::{BackendFactory, DEFAULT_IDLE_TIMEOUT, SessionResolver};
use cmb_upstream::{ConfigReloader, UpstreamManager, builtin};
use cmb_watch::FileWatcher;

use crate::handler::{BridgeHandler, BridgeState};

pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub servers: Option<Vec<String>>,
    pub executor_type: Option<String>,
    pub http: Option<String>,
}

pub async fn handle_serve(options: ServeOptions) -> Result<()> {
    let config_path = match options.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let token_path = default_token_path()?;
    let token_store = Arc::new(TokenStore::new(&token_path));

    let explicit = options
        .executor_type
        .as_deref()
        .map(BackendKind::from_str)
        .transpose()
        .context("invalid --executor-type")?;

    let manager = UpstreamManager::new(Some(token_store));
    builtin::register_utils(&manager).await;

    let http_mode = options.http.is_some();
    let factory = BackendFactory::new(SandboxFactory::new(DEFAULT_EXECUTE_TIMEOUT), explicit);
    let resolver = SessionResolver::new(Arc::new(factory), DEFAULT_IDLE_TIMEOUT, http_mode);

    // Boot the shared runtime now so `status` has executor info from the
    // first request on.
    resolver
        .resolve(None)
        .await
        .context("failed to boot the sandbox executor")?;

    let state = BridgeState::new(manager.clone(), resolver.clone());

    let reload_state = state.clone();
    let reloader = ConfigReloader::new(
        &config_path,
        options.servers.clone(),
        manager.clone(),
        Arc::new(move || {
            let state = reload_state.clone();
            Box::pin(async move { state.on_servers_changed().await })
        }),
    );

    if config_path.exists() {
        if let Err(error) = reloader.connect_initial().await {
            tracing::warn!(
                path = %config_path.display(),
                error = %error,
                "could not load config at startup; serving without upstream servers"
            );
        }
    } else {
        tracing::warn!(
            path = %config_path.display(),
            "no config file found; serving with built-in tools only"
        );
    }
    state.rebuild_search_index().await;

    let watch_reloader = reloader.clone();
    let mut config_watcher = FileWatcher::new(
        &config_path,
        Arc::new(move || {
            let reloader = watch_reloader.clone();
            Box::pin(async move {
                reloader.reload().await;
                Ok(())
            })
        }),
    );
    config_watcher.start();

    // External edits to the token file take effect on the next (re)connect;
    // the watcher exists so operators see that the change was noticed.
    let mut token_watcher = FileWatcher::new(
        &token_path,
        Arc::new(move || {
            Box::pin(async move {
                tracing::info!("token file changed; new credentials apply on the next connect");
                Ok(())
            })
        }),
    );
    token_watcher.start();

    let served = match options.http.as_deref() {
        Some(addr) => serve_http(state.clone(), addr).await,
        None => serve_stdio(state.clone()).await,
    };

    tracing::info!("shutting down");
    config_watcher.close().await;
    token_watcher.close().await;
    resolver.dispose_all().await;
    manager.disconnect_all().await;

    served
}

async fn serve_stdio(state: Arc<BridgeState>) -> Result<()> {
    let handler = BridgeHandler::singleton(state);
    let running = handler
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await
        .context("failed to start stdio MCP server")?;

    tokio::select! {
        result = running.waiting() => {
            // Host closed stdin or the transport failed.
            if let Err(error) = result {
                tracing::debug!(error = %error, "stdio server stopped with error");
            }
        }
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn serve_http(state: Arc<BridgeState>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP endpoint at {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local HTTP address")?;

    let service = StreamableHttpService::new(
        move || Ok(BridgeHandler::for_new_session(state.clone())),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let app = axum::Router::new()
        .route("/health", axum::routing::get(health))
        .fallback(not_found)
        .nest_service("/mcp", service);

    tracing::info!(addr = %local_addr, "bridge listening on http://{local_addr}/mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not Found"})))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
