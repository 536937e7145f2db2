//! In-process QuickJS backend.
//!
//! Each execute gets a fresh `AsyncContext` on a shared `AsyncRuntime`, so
//! globals never leak between runs and executes on one runtime are
//! serialized by the engine. Tool calls bridge through one native async
//! function; a JS prelude builds the frozen `codemode` table on top of it
//! and strips dynamic code generation from the globals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rquickjs::prelude::Async;
use rquickjs::{AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Function, async_with};

use cmb_core::BridgeError;

use crate::normalize::normalize_snippet;
use crate::{Execution, SandboxRuntime, ToolTable};

pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 128 * 1024 * 1024;

/// Prelude evaluated before every snippet: console capture, the `codemode`
/// tool table, and (when hardening is on) removal of `eval`, the `Function`
/// constructor and prototype mutation.
const VM_PRELUDE: &str = r#"(toolNames, harden) => {
  const invoke = globalThis.__cmb_invoke;
  const print = globalThis.__cmb_log;
  delete globalThis.__cmb_invoke;
  delete globalThis.__cmb_log;

  const stringify = (value, seen) => {
    if (typeof value === "function") return "[Function]";
    if (value instanceof Error) return "Error: " + value.message;
    if (value === null) return "null";
    if (value === undefined) return "undefined";
    if (typeof value !== "object") return String(value);
    if (seen.has(value)) return "[Circular]";
    seen.add(value);
    if (Array.isArray(value)) {
      return "[" + value.map((v) => stringify(v, seen)).join(", ") + "]";
    }
    const parts = [];
    for (const key of Object.keys(value)) {
      parts.push(key + ": " + stringify(value[key], seen));
    }
    return "{" + parts.join(", ") + "}";
  };
  const line = (args) => args.map((v) => stringify(v, new Set())).join(" ");

  const consoleObj = {
    log: (...args) => print("log", line(args)),
    info: (...args) => print("log", line(args)),
    debug: (...args) => print("log", line(args)),
    warn: (...args) => print("warn", line(args)),
    error: (...args) => print("error", line(args)),
  };
  Object.defineProperty(globalThis, "console", {
    value: Object.freeze(consoleObj),
    writable: false,
    configurable: false,
  });

  const codemode = {};
  for (const name of toolNames) {
    codemode[name] = async (args) => {
      const raw = await invoke(name, JSON.stringify(args === undefined ? null : args));
      const reply = JSON.parse(raw);
      if (!reply.ok) throw new Error(reply.error);
      return reply.value;
    };
  }
  Object.defineProperty(globalThis, "codemode", {
    value: Object.freeze(codemode),
    writable: false,
    configurable: false,
  });

  if (harden) {
    delete globalThis.eval;
    const denied = () => { throw new Error("code generation is disabled"); };
    try { Function.prototype.constructor = denied; } catch (_) {}
    delete globalThis.Function;
    for (const proto of [
      Object.prototype, Array.prototype, Function.prototype,
      String.prototype, Number.prototype, Boolean.prototype,
    ]) {
      Object.freeze(proto);
    }
    Object.seal(globalThis);
  }
}"#;

pub struct VmRuntime {
    runtime: AsyncRuntime,
    timeout: Duration,
    hardened: bool,
    disposed: Arc<AtomicBool>,
}

impl std::fmt::Debug for VmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRuntime")
            .field("timeout", &self.timeout)
            .field("hardened", &self.hardened)
            .finish()
    }
}

impl VmRuntime {
    /// Create the hardened in-process backend.
    pub async fn new(timeout: Duration) -> Result<Self, BridgeError> {
        Self::with_hardening(timeout, true).await
    }

    /// The insecure variant: same engine, no globals hardening. Snippets can
    /// reach `eval`, the `Function` constructor and mutable prototypes, so
    /// a hostile snippet can escape into the bridge process. Never select
    /// this in production.
    pub async fn new_insecure(timeout: Duration) -> Result<Self, BridgeError> {
        tracing::warn!(
            "insecure VM backend selected: sandbox globals are NOT hardened; \
             do not use this executor in production"
        );
        Self::with_hardening(timeout, false).await
    }

    async fn with_hardening(timeout: Duration, hardened: bool) -> Result<Self, BridgeError> {
        let runtime = AsyncRuntime::new()
            .map_err(|e| BridgeError::SandboxCrash(format!("failed to create VM runtime: {e}")))?;
        runtime.set_memory_limit(DEFAULT_MEMORY_LIMIT_BYTES).await;

        Ok(Self {
            runtime,
            timeout,
            hardened,
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_hardened(&self) -> bool {
        self.hardened
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for VmRuntime {
    async fn execute(&self, code: &str, tools: ToolTable) -> Result<Execution, BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::SandboxCrash("runtime is disposed".into()));
        }

        let normalized = normalize_snippet(code);
        let logs = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let tools = Arc::new(tools);

        // Interrupt long-running JS once the deadline passes or the runtime
        // is disposed; the outer timeout also covers time spent awaiting
        // tool calls.
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let interrupt_flag = deadline_hit.clone();
        let disposed_flag = self.disposed.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || {
                interrupt_flag.load(Ordering::Relaxed) || disposed_flag.load(Ordering::Relaxed)
            })))
            .await;
        let timer_flag = deadline_hit.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_flag.store(true, Ordering::Relaxed);
        });

        let context = AsyncContext::full(&self.runtime)
            .await
            .map_err(|e| BridgeError::SandboxCrash(format!("failed to create VM context: {e}")))?;

        let run_logs = logs.clone();
        let run = async_with!(context => |ctx| {
            run_in_context(&ctx, &normalized, &tools, run_logs, self.hardened).await
        });

        let outcome = tokio::time::timeout(self.timeout + Duration::from_millis(250), run).await;
        timer.abort();
        self.runtime.set_interrupt_handler(None).await;

        let collected = logs.lock().map(|l| l.clone()).unwrap_or_default();
        let execution = match outcome {
            Err(_) => Execution::failed(BridgeError::Timeout(self.timeout.as_secs()).to_string(), collected),
            Ok(Ok(value)) => Execution::ok(value, collected),
            Ok(Err(message)) => {
                let message = if deadline_hit.load(Ordering::Relaxed) && message.contains("interrupted") {
                    BridgeError::Timeout(self.timeout.as_secs()).to_string()
                } else if is_memory_message(&message) {
                    BridgeError::MemoryExhausted.to_string()
                } else {
                    message
                };
                Execution::failed(message, collected)
            }
        };

        Ok(execution)
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

async fn run_in_context(
    ctx: &rquickjs::Ctx<'_>,
    normalized: &str,
    tools: &Arc<ToolTable>,
    logs: Arc<std::sync::Mutex<Vec<String>>>,
    hardened: bool,
) -> Result<serde_json::Value, String> {
    install_bindings(ctx, tools, logs).map_err(|e| format!("failed to set up sandbox: {e}"))?;

    let names = serde_json::to_string(&tools.keys().collect::<Vec<_>>())
        .map_err(|e| format!("failed to encode tool names: {e}"))?;
    let prelude = format!("({VM_PRELUDE})({names}, {hardened})");
    ctx.eval::<(), _>(prelude.as_bytes())
        .catch(ctx)
        .map_err(|e| format!("failed to set up sandbox globals: {}", describe(&e)))?;

    let call = format!("Promise.resolve(({normalized})())");
    let promise = ctx
        .eval::<rquickjs::Promise, _>(call.as_bytes())
        .catch(ctx)
        .map_err(|e| describe(&e))?;

    let value = promise
        .into_future::<rquickjs::Value>()
        .await
        .catch(ctx)
        .map_err(|e| describe(&e))?;

    Ok(to_json(ctx, value))
}

fn install_bindings(
    ctx: &rquickjs::Ctx<'_>,
    tools: &Arc<ToolTable>,
    logs: Arc<std::sync::Mutex<Vec<String>>>,
) -> Result<(), rquickjs::Error> {
    let globals = ctx.globals();

    let log_fn = Function::new(ctx.clone(), move |level: String, text: String| {
        if let Ok(mut guard) = logs.lock() {
            let prefix = match level.as_str() {
                "warn" => "[WARN] ",
                "error" => "[ERROR] ",
                _ => "",
            };
            guard.push(format!("{prefix}{text}"));
        }
        Ok::<(), rquickjs::Error>(())
    })?;
    globals.set("__cmb_log", log_fn)?;

    let table = tools.clone();
    let invoke_fn = Function::new(
        ctx.clone(),
        Async(move |name: String, args: String| {
            let table = table.clone();
            async move {
                let parsed: serde_json::Value =
                    serde_json::from_str(&args).unwrap_or(serde_json::Value::Null);
                let payload = match table.get(&name) {
                    None => serde_json::json!({
                        "ok": false,
                        "error": format!("Unknown tool '{name}'"),
                    }),
                    Some(handler) => match handler(parsed).await {
                        Ok(value) => serde_json::json!({"ok": true, "value": value}),
                        Err(message) => serde_json::json!({"ok": false, "error": message}),
                    },
                };
                Ok::<String, rquickjs::Error>(payload.to_string())
            }
        }),
    )?;
    globals.set("__cmb_invoke", invoke_fn)?;

    Ok(())
}

fn to_json<'a>(ctx: &rquickjs::Ctx<'a>, value: rquickjs::Value<'a>) -> serde_json::Value {
    if value.is_null() || value.is_undefined() {
        return serde_json::Value::Null;
    }
    match ctx.json_stringify(value) {
        Ok(Some(text)) => match text.to_string() {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::Value::Null,
        },
        _ => serde_json::Value::Null,
    }
}

fn describe(error: &CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => {
            let name: Option<String> = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten();
            let message = exception.message().unwrap_or_else(|| error.to_string());
            match name {
                Some(name) if !name.is_empty() => format!("{name}: {message}"),
                _ => message,
            }
        }
        CaughtError::Error(error) => error.to_string(),
        CaughtError::Value(value) => {
            if value.is_null() || value.is_undefined() {
                // QuickJS throws null when it cannot allocate the error
                // object itself.
                "out of memory".to_string()
            } else {
                format!("Thrown value: {value:?}")
            }
        }
    }
}

fn is_memory_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory") || lower.contains("memory limit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_handler;
    use serde_json::json;

    fn table_with_echo() -> ToolTable {
        let mut table = ToolTable::new();
        table.insert(
            "echo__say".to_string(),
            tool_handler(|args| async move { Ok(json!({"echo": args})) }),
        );
        table.insert(
            "bad__fail".to_string(),
            tool_handler(|_args| async move { Err("upstream exploded".to_string()) }),
        );
        table
    }

    #[tokio::test]
    async fn evaluates_a_bare_expression() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm.execute("6*7", ToolTable::new()).await.unwrap();
        assert_eq!(result.error, None);
        assert_eq!(result.value, Some(json!(42)));
    }

    #[tokio::test]
    async fn evaluates_an_arrow_function_expression() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute("async () => ({ type: \"json\", value: 6*7 })", ToolTable::new())
            .await
            .unwrap();
        assert_eq!(result.value, Some(json!({"type": "json", "value": 42})));
    }

    #[tokio::test]
    async fn dispatches_tool_calls_through_the_table() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute(
                "const r = await codemode.echo__say({n: 1}); r.echo.n + 1",
                table_with_echo(),
            )
            .await
            .unwrap();
        assert_eq!(result.error, None);
        assert_eq!(result.value, Some(json!(2)));
    }

    #[tokio::test]
    async fn upstream_rejection_is_catchable_in_snippet() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute(
                "try { await codemode.bad__fail({}); return \"no\"; } catch (e) { return \"caught\"; }",
                table_with_echo(),
            )
            .await
            .unwrap();
        assert_eq!(result.error, None);
        assert_eq!(result.value, Some(json!("caught")));
    }

    #[tokio::test]
    async fn unknown_tool_rejects_with_message() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute("await codemode.echo__say({})", ToolTable::new())
            .await
            .unwrap();
        // Empty table: codemode has no such property at all.
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn console_lines_are_captured_with_level_prefixes() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute(
                "console.log(\"hi\", {a: 1}); console.warn(\"careful\"); console.error(\"bad\"); 1",
                ToolTable::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            result.logs,
            vec!["hi {a: 1}", "[WARN] careful", "[ERROR] bad"]
        );
    }

    #[tokio::test]
    async fn printer_handles_functions_errors_and_cycles() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute(
                "const o = {}; o.self = o; console.log(o, () => 1, new Error(\"oops\")); null",
                ToolTable::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.logs, vec!["{self: [Circular]} [Function] Error: oops"]);
    }

    #[tokio::test]
    async fn busy_loop_times_out() {
        let vm = VmRuntime::new(Duration::from_millis(300)).await.unwrap();
        let result = vm.execute("while (true) {}", ToolTable::new()).await.unwrap();
        let error = result.error.expect("busy loop must time out");
        assert!(error.contains("timed out"), "got: {error}");
    }

    #[tokio::test]
    async fn hardened_globals_reject_eval() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        let result = vm
            .execute("typeof eval === \"undefined\" && typeof Function === \"undefined\"", ToolTable::new())
            .await
            .unwrap();
        assert_eq!(result.value, Some(json!(true)));
    }

    #[tokio::test]
    async fn insecure_variant_keeps_eval() {
        let vm = VmRuntime::new_insecure(Duration::from_secs(5)).await.unwrap();
        assert!(!vm.is_hardened());
        let result = vm
            .execute("eval(\"2 + 2\")", ToolTable::new())
            .await
            .unwrap();
        assert_eq!(result.value, Some(json!(4)));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_execute() {
        let vm = VmRuntime::new(Duration::from_secs(5)).await.unwrap();
        vm.dispose().await;
        vm.dispose().await;
        let err = vm.execute("1", ToolTable::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::SandboxCrash(_)));
    }
}
