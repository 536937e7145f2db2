//! Per-client session management.
//!
//! One sandbox runtime per MCP session, created lazily on first touch and
//! evicted after an idle window. Creation is single-flight: concurrent
//! resolves of a new session run the factory exactly once. When creation
//! fails for a named session the caller is handed the singleton instead, so
//! the host sees a tool-level error rather than a dead transport.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use cmb_core::{BridgeError, ExecutorInfo, SINGLETON_SESSION_ID};
use cmb_sandbox::{BackendKind, SandboxFactory, SandboxRuntime};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Creates sandbox runtimes on demand. Split out from [`SandboxFactory`] so
/// the resolver can be exercised without real backends.
#[async_trait::async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn SandboxRuntime>, ExecutorInfo), BridgeError>;
}

/// Production factory: a [`SandboxFactory`] plus an optional pinned backend.
pub struct BackendFactory {
    factory: SandboxFactory,
    explicit: Option<BackendKind>,
}

impl BackendFactory {
    pub fn new(factory: SandboxFactory, explicit: Option<BackendKind>) -> Self {
        Self { factory, explicit }
    }
}

#[async_trait::async_trait]
impl RuntimeFactory for BackendFactory {
    async fn create(&self) -> Result<(Arc<dyn SandboxRuntime>, ExecutorInfo), BridgeError> {
        self.factory.create(self.explicit).await
    }
}

struct SessionEntry {
    runtime: Arc<dyn SandboxRuntime>,
    /// Bumped on every touch; an idle timer only evicts when its captured
    /// epoch still matches.
    epoch: u64,
}

pub struct SessionResolver {
    factory: Arc<dyn RuntimeFactory>,
    idle_timeout: Duration,
    /// In stdio mode the singleton lives for the process; in HTTP mode it is
    /// idle-evicted like any other session.
    singleton_evicts: bool,
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    init_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    boot_info: OnceLock<ExecutorInfo>,
}

impl SessionResolver {
    pub fn new(
        factory: Arc<dyn RuntimeFactory>,
        idle_timeout: Duration,
        singleton_evicts: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            idle_timeout,
            singleton_evicts,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            init_locks: Mutex::new(HashMap::new()),
            boot_info: OnceLock::new(),
        })
    }

    /// Executor info captured when the first runtime booted. `status`
    /// reports this verbatim even after re-creations.
    pub fn executor_info(&self) -> Option<ExecutorInfo> {
        self.boot_info.get().cloned()
    }

    /// Resolve a session to its runtime, creating it on first touch. An
    /// absent/empty session ID resolves the singleton.
    pub async fn resolve(
        self: &Arc<Self>,
        session_id: Option<&str>,
    ) -> Result<Arc<dyn SandboxRuntime>, BridgeError> {
        let key = match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => SINGLETON_SESSION_ID.to_string(),
        };

        if let Some(runtime) = self.touch_existing(&key).await {
            return Ok(runtime);
        }

        let init_lock = {
            let mut locks = self.init_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = init_lock.lock().await;

        // A concurrent resolver may have finished while we waited.
        if let Some(runtime) = self.touch_existing(&key).await {
            return Ok(runtime);
        }

        match self.factory.create().await {
            Ok((runtime, info)) => {
                let _ = self.boot_info.set(info);
                self.insert(&key, runtime.clone()).await;
                Ok(runtime)
            }
            Err(error) if key != SINGLETON_SESSION_ID => {
                tracing::error!(session = %key, error = %error, "session runtime creation failed");
                tracing::warn!(
                    session = %key,
                    "falling back to the shared runtime; session isolation is NOT active"
                );
                drop(_guard);
                // Nothing was registered for the failed session, so a later
                // resolve retries the factory.
                Box::pin(self.resolve(None)).await
            }
            Err(error) => {
                tracing::error!(error = %error, "singleton runtime creation failed");
                Err(error)
            }
        }
    }

    /// Dispose a single session. Idempotent; concurrent callers race on the
    /// map removal, so a runtime is disposed exactly once.
    pub async fn dispose_session(&self, session_id: &str) {
        let removed = self.sessions.lock().await.remove(session_id);
        if let Some(entry) = removed {
            entry.runtime.dispose().await;
            tracing::debug!(session = %session_id, "session disposed");
        }
        self.init_locks.lock().await.remove(session_id);
    }

    /// Dispose everything, in parallel. Used on shutdown.
    pub async fn dispose_all(&self) {
        let entries: Vec<(String, SessionEntry)> =
            self.sessions.lock().await.drain().collect();
        let mut tasks = JoinSet::new();
        for (name, entry) in entries {
            tasks.spawn(async move {
                entry.runtime.dispose().await;
                name
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Ok(name) = result {
                tracing::debug!(session = %name, "session disposed at shutdown");
            }
        }
        self.init_locks.lock().await.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn touch_existing(self: &Arc<Self>, key: &str) -> Option<Arc<dyn SandboxRuntime>> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(key)?;
        entry.epoch += 1;
        let epoch = entry.epoch;
        let runtime = entry.runtime.clone();
        drop(sessions);
        self.arm_idle_timer(key, epoch);
        Some(runtime)
    }

    async fn insert(self: &Arc<Self>, key: &str, runtime: Arc<dyn SandboxRuntime>) {
        self.sessions
            .lock()
            .await
            .insert(key.to_string(), SessionEntry { runtime, epoch: 0 });
        self.arm_idle_timer(key, 0);
    }

    /// Spawn a detached eviction timer for the current epoch. A later touch
    /// bumps the epoch, turning this timer into a no-op; no timer ever
    /// blocks shutdown.
    fn arm_idle_timer(self: &Arc<Self>, key: &str, epoch: u64) {
        if key == SINGLETON_SESSION_ID && !self.singleton_evicts {
            return;
        }

        let resolver = Arc::downgrade(self);
        let key = key.to_string();
        let idle = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(resolver) = resolver.upgrade() else {
                return;
            };

            let expired = {
                let mut sessions = resolver.sessions.lock().await;
                match sessions.get(&key) {
                    Some(entry) if entry.epoch == epoch => sessions.remove(&key),
                    _ => None,
                }
            };
            if let Some(entry) = expired {
                tracing::info!(session = %key, idle_secs = idle.as_secs(), "evicting idle session");
                entry.runtime.dispose().await;
                resolver.init_locks.lock().await.remove(&key);
            }
        });
    }
}
