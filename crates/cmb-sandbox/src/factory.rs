//! Backend selection.
//!
//! Order of authority: an explicit type from the caller, then the
//! `CMB_EXECUTOR_TYPE` environment variable, then a preference walk over the
//! probes. Probes are side-effect-free and cached for the process lifetime.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use cmb_core::{BridgeError, ExecutorInfo};

use crate::child::ChildRuntime;
use crate::vm::VmRuntime;
use crate::SandboxRuntime;

pub const EXECUTOR_TYPE_ENV: &str = "CMB_EXECUTOR_TYPE";
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vm,
    Deno,
    Container,
    VmInsecure,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Deno => "deno",
            Self::Container => "container",
            Self::VmInsecure => "vm-insecure",
        }
    }

    /// Walk order for automatic selection. The insecure variant is not part
    /// of the walk; it is a last resort with its own warning.
    const PREFERENCE: &'static [BackendKind] =
        &[BackendKind::Vm, BackendKind::Deno, BackendKind::Container];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(Self::Vm),
            "deno" => Ok(Self::Deno),
            "container" | "docker" => Ok(Self::Container),
            "vm-insecure" => Ok(Self::VmInsecure),
            other => Err(BridgeError::BackendUnavailable(other.to_string())),
        }
    }
}

pub struct SandboxFactory {
    timeout: Duration,
}

impl SandboxFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a runtime, honoring an explicit backend request when present.
    pub async fn create(
        &self,
        explicit: Option<BackendKind>,
    ) -> Result<(Arc<dyn SandboxRuntime>, ExecutorInfo), BridgeError> {
        if let Some(kind) = explicit {
            return self.create_named(kind, "explicit").await;
        }

        if let Ok(raw) = std::env::var(EXECUTOR_TYPE_ENV) {
            let kind = BackendKind::from_str(raw.trim())?;
            return self.create_named(kind, "env-override").await;
        }

        for kind in BackendKind::PREFERENCE {
            if probe(*kind).await {
                return self.instantiate(*kind, "auto-detected").await;
            }
        }

        tracing::warn!(
            "no hardened sandbox backend is available; falling back to the insecure VM"
        );
        self.instantiate(BackendKind::VmInsecure, "insecure-fallback")
            .await
    }

    async fn create_named(
        &self,
        kind: BackendKind,
        reason: &str,
    ) -> Result<(Arc<dyn SandboxRuntime>, ExecutorInfo), BridgeError> {
        if !probe(kind).await {
            return Err(BridgeError::BackendUnavailable(kind.to_string()));
        }
        self.instantiate(kind, reason).await
    }

    async fn instantiate(
        &self,
        kind: BackendKind,
        reason: &str,
    ) -> Result<(Arc<dyn SandboxRuntime>, ExecutorInfo), BridgeError> {
        let runtime: Arc<dyn SandboxRuntime> = match kind {
            BackendKind::Vm => Arc::new(VmRuntime::new(self.timeout).await?),
            BackendKind::VmInsecure => Arc::new(VmRuntime::new_insecure(self.timeout).await?),
            BackendKind::Deno => Arc::new(ChildRuntime::spawn_deno(self.timeout).await?),
            BackendKind::Container => Arc::new(ChildRuntime::spawn_container(self.timeout).await?),
        };

        let info = ExecutorInfo {
            kind: kind.to_string(),
            reason: reason.to_string(),
            timeout: self.timeout.as_secs(),
        };
        tracing::info!(backend = %kind, reason = %reason, "sandbox backend selected");
        Ok((runtime, info))
    }
}

/// Cached availability check. Each probe runs at most once per process.
pub async fn probe(kind: BackendKind) -> bool {
    static VM: OnceCell<bool> = OnceCell::const_new();
    static DENO: OnceCell<bool> = OnceCell::const_new();
    static CONTAINER: OnceCell<bool> = OnceCell::const_new();

    match kind {
        // The insecure variant exists precisely so there is always a floor.
        BackendKind::VmInsecure => true,
        BackendKind::Vm => *VM.get_or_init(probe_vm).await,
        BackendKind::Deno => *DENO.get_or_init(probe_deno).await,
        BackendKind::Container => *CONTAINER.get_or_init(probe_container).await,
    }
}

async fn probe_vm() -> bool {
    // Instantiate-and-drop a tiny runtime.
    rquickjs::AsyncRuntime::new().is_ok()
}

async fn probe_deno() -> bool {
    which::which("deno").is_ok()
}

async fn probe_container() -> bool {
    let probe = tokio::process::Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    matches!(
        tokio::time::timeout(Duration::from_secs(3), probe).await,
        Ok(Ok(status)) if status.success()
    )
}
