//! Out-of-process sandbox backends.
//!
//! A child process (plain Deno, or Deno inside a network-less container)
//! runs the embedded `runner.js` and speaks the §protocol over stdio. One
//! host-side state machine covers both: Starting → Ready → Busy↔Ready →
//! Disposing → Disposed. Read errors, child exit, and missed heartbeat
//! echoes all collapse into the Disposing edge.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use cmb_core::BridgeError;

use crate::normalize::normalize_snippet;
use crate::protocol::{HostMessage, SandboxMessage};
use crate::{Execution, SandboxRuntime, ToolTable};

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_MISS_LIMIT: u32 = 2;
const MEMORY_LIMIT_MB: u64 = 128;

const RUNNER_SOURCE: &str = include_str!("runner.js");

pub struct ChildRuntime {
    timeout: Duration,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChildRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRuntime")
            .field("timeout", &self.timeout)
            .field("label", &self.inner.label)
            .finish()
    }
}

struct Inner {
    label: &'static str,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Execution>>>,
    /// Per-execute tool snapshots, newest last.
    active_tools: Mutex<Vec<(u64, Arc<ToolTable>)>>,
    next_execute_id: AtomicU64,
    alive: AtomicBool,
    shutdown: CancellationToken,
    /// Keeps the on-disk runner script alive for the child's lifetime.
    _script: tempfile::NamedTempFile,
}

impl ChildRuntime {
    /// Spawn a Deno child with no permission flags: deny-by-default.
    pub async fn spawn_deno(timeout: Duration) -> Result<Self, BridgeError> {
        let script = write_runner_script()?;
        let mut cmd = Command::new("deno");
        cmd.arg("run")
            .arg("--quiet")
            .arg(format!("--v8-flags=--max-old-space-size={MEMORY_LIMIT_MB}"))
            .arg(script.path());
        Self::spawn("deno", cmd, script, timeout).await
    }

    /// Spawn the runner inside a container with networking disabled.
    pub async fn spawn_container(timeout: Duration) -> Result<Self, BridgeError> {
        let script = write_runner_script()?;
        let mut cmd = Command::new("docker");
        cmd.args(container_args(
            &script.path().to_string_lossy(),
            std::process::id(),
            &chrono::Utc::now().to_rfc3339(),
        ));
        Self::spawn("container", cmd, script, timeout).await
    }

    async fn spawn(
        label: &'static str,
        mut cmd: Command,
        script: tempfile::NamedTempFile,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::SandboxCrash(format!("failed to spawn {label} sandbox: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SandboxCrash(format!("no stdin for {label} sandbox")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SandboxCrash(format!("no stdout for {label} sandbox")))?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let inner = Arc::new(Inner {
            label,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending: Mutex::new(HashMap::new()),
            active_tools: Mutex::new(Vec::new()),
            next_execute_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            _script: script,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let last_echo = Arc::new(AtomicU64::new(0));

        tokio::spawn(read_loop(inner.clone(), stdout, ready_tx, last_echo.clone()));
        tokio::spawn(heartbeat_loop(inner.clone(), last_echo));

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                let runtime = Self {
                    timeout,
                    inner: inner.clone(),
                };
                runtime.dispose().await;
                return Err(BridgeError::SandboxCrash(format!(
                    "{label} sandbox never became ready"
                )));
            }
        }

        Ok(Self { timeout, inner })
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for ChildRuntime {
    async fn execute(&self, code: &str, tools: ToolTable) -> Result<Execution, BridgeError> {
        if !self.inner.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::SandboxCrash(format!(
                "{} sandbox is not running",
                self.inner.label
            )));
        }

        let id = self.inner.next_execute_id.fetch_add(1, Ordering::Relaxed);
        let tools = Arc::new(tools);
        let names: Vec<String> = tools.keys().cloned().collect();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, reply_tx);
        self.inner.active_tools.lock().await.push((id, tools));

        let message = HostMessage::Execute {
            id,
            code: normalize_snippet(code),
            tools: names,
        };
        if let Err(error) = self.inner.write(&message).await {
            self.inner.clear_execution(id).await;
            return Err(error);
        }

        let reply = tokio::time::timeout(self.timeout, reply_rx).await;
        self.inner.clear_execution(id).await;

        match reply {
            Ok(Ok(execution)) => Ok(execution),
            Ok(Err(_)) => Err(BridgeError::SandboxCrash(format!(
                "{} sandbox exited mid-execution",
                self.inner.label
            ))),
            Err(_) => Ok(Execution::failed(
                BridgeError::Timeout(self.timeout.as_secs()).to_string(),
                Vec::new(),
            )),
        }
    }

    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl Inner {
    async fn write(&self, message: &HostMessage) -> Result<(), BridgeError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| BridgeError::Protocol(format!("failed to encode host frame: {e}")))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(BridgeError::SandboxCrash(format!(
                "{} sandbox stdin is closed",
                self.label
            )));
        };
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(error) = write.await {
            drop(guard);
            tracing::warn!(sandbox = self.label, error = %error, "sandbox stdin write failed");
            self.dispose().await;
            return Err(BridgeError::SandboxCrash(format!(
                "{} sandbox write failed: {error}",
                self.label
            )));
        }
        Ok(())
    }

    async fn clear_execution(&self, id: u64) {
        self.pending.lock().await.remove(&id);
        self.active_tools.lock().await.retain(|(exec, _)| *exec != id);
    }

    async fn lookup_tool(&self, name: &str) -> Option<crate::ToolHandler> {
        let guard = self.active_tools.lock().await;
        guard
            .iter()
            .rev()
            .find_map(|(_, table)| table.get(name).cloned())
    }

    async fn dispose(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        // Best-effort polite shutdown before the kill.
        if let Some(stdin) = self.stdin.lock().await.as_mut() {
            let _ = stdin.write_all(b"{\"type\":\"shutdown\"}\n").await;
            let _ = stdin.flush().await;
        }
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }

        // Drop reply senders so waiters observe the crash.
        self.pending.lock().await.clear();
        self.active_tools.lock().await.clear();
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    stdout: tokio::process::ChildStdout,
    ready_tx: oneshot::Sender<()>,
    last_echo: Arc<AtomicU64>,
) {
    let mut reader = BufReader::new(stdout).lines();
    let mut ready_tx = Some(ready_tx);

    loop {
        let line = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            line = reader.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(sandbox = inner.label, error = %error, "sandbox read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: SandboxMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(sandbox = inner.label, error = %error, "unparseable sandbox frame");
                continue;
            }
        };

        match message {
            SandboxMessage::Ready => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            SandboxMessage::Heartbeat => {
                last_echo.store(now_millis(), Ordering::Relaxed);
            }
            SandboxMessage::ToolCall { id, name, args } => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let reply = match inner.lookup_tool(&name).await {
                        None => HostMessage::ToolError {
                            id,
                            error: format!("Unknown tool '{name}'"),
                        },
                        Some(handler) => match handler(args).await {
                            Ok(result) => HostMessage::ToolResult { id, result },
                            Err(error) => HostMessage::ToolError { id, error },
                        },
                    };
                    let _ = inner.write(&reply).await;
                });
            }
            SandboxMessage::Result { id, result, logs } => {
                if let Some(tx) = inner.pending.lock().await.remove(&id) {
                    let _ = tx.send(Execution::ok(result, logs));
                }
            }
            SandboxMessage::Error {
                id: Some(id),
                error,
                logs,
            } => {
                if let Some(tx) = inner.pending.lock().await.remove(&id) {
                    let _ = tx.send(Execution::failed(error.message, logs));
                }
            }
            SandboxMessage::Error { id: None, error, .. } => {
                tracing::warn!(sandbox = inner.label, error = %error.message, "sandbox reported fatal error");
                break;
            }
        }
    }

    inner.dispose().await;
}

async fn heartbeat_loop(inner: Arc<Inner>, last_echo: Arc<AtomicU64>) {
    // The first echo window starts at the first beat we send.
    last_echo.store(now_millis(), Ordering::Relaxed);
    let dead_after = HEARTBEAT_INTERVAL.as_millis() as u64 * u64::from(HEARTBEAT_MISS_LIMIT);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }

        if inner.write(&HostMessage::Heartbeat).await.is_err() {
            return;
        }

        let silent_for = now_millis().saturating_sub(last_echo.load(Ordering::Relaxed));
        if silent_for > dead_after {
            tracing::warn!(
                sandbox = inner.label,
                silent_ms = silent_for,
                "sandbox missed heartbeats, declaring it dead"
            );
            inner.dispose().await;
            return;
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn write_runner_script() -> Result<tempfile::NamedTempFile, BridgeError> {
    let mut script = tempfile::Builder::new()
        .prefix("cmb-runner-")
        .suffix(".js")
        .tempfile()
        .map_err(|e| BridgeError::SandboxCrash(format!("failed to stage runner script: {e}")))?;
    script
        .write_all(RUNNER_SOURCE.as_bytes())
        .map_err(|e| BridgeError::SandboxCrash(format!("failed to write runner script: {e}")))?;
    script
        .flush()
        .map_err(|e| BridgeError::SandboxCrash(format!("failed to flush runner script: {e}")))?;
    Ok(script)
}

/// Argument vector for the container backend, split out for testing.
fn container_args(script_path: &str, host_pid: u32, created_at: &str) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--network=none".into(),
        format!("--memory={MEMORY_LIMIT_MB}m"),
        "--label".into(),
        format!("codemode.host-pid={host_pid}"),
        "--label".into(),
        format!("codemode.created-at={created_at}"),
        "-v".into(),
        format!("{script_path}:/runner.js:ro"),
        "denoland/deno:alpine".into(),
        "run".into(),
        "--quiet".into(),
        "/runner.js".into(),
    ]
}
