//! Single-file change watcher.
//!
//! Wraps a native `notify` watcher with the semantics the config reloader
//! needs: change events are debounced, a callback fires only when the file's
//! mtime actually advanced, and a missing file degrades to a polling loop
//! that re-attaches (and fires once) when the file reappears.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Async callback invoked on a debounced, mtime-confirmed change.
pub type ChangeCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct FileWatcher {
    path: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
    callback: ChangeCallback,
    watching: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, callback: ChangeCallback) -> Self {
        Self::with_timing(path, callback, DEFAULT_DEBOUNCE, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_timing(
        path: impl Into<PathBuf>,
        callback: ChangeCallback,
        debounce: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            debounce,
            poll_interval,
            callback,
            watching: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Attach the watcher and start delivering callbacks.
    ///
    /// `is_watching()` reports true from here until `close`, even when the
    /// native attach failed and the watcher is polling (or permanently
    /// quiet after a non-recoverable attach error).
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        self.watching.store(true, Ordering::SeqCst);
        let path = self.path.clone();
        let debounce = self.debounce;
        let poll_interval = self.poll_interval;
        let callback = self.callback.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            run(path, debounce, poll_interval, callback, shutdown).await;
        }));
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Stop watching. Idempotent; a close during a debounce window cancels
    /// the pending fire.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.watching.store(false, Ordering::SeqCst);
    }
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Attach a native watcher.
///
/// Watches the parent directory and filters for our file: editors replace
/// files by rename, and a watch pinned to the old inode would go silent
/// after the first save. A missing file (or parent) surfaces as not-found
/// so the caller can fall back to polling.
fn attach_watcher(
    path: &Path,
    tx: mpsc::Sender<()>,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    use notify::{Event, EventKind, RecursiveMode, Watcher};

    if !path.exists() {
        return Err(notify::Error::path_not_found());
    }

    let file_name = path.file_name().map(|name| name.to_owned());
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res
            && matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            )
        {
            let ours = event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
            if ours {
                let _ = tx.try_send(());
            }
        }
    })?;
    let watch_target = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(path);
    watcher.watch(watch_target, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn is_not_found(error: &notify::Error) -> bool {
    matches!(&error.kind, notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
        || matches!(error.kind, notify::ErrorKind::PathNotFound)
}

async fn run(
    path: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
    callback: ChangeCallback,
    shutdown: CancellationToken,
) {
    let mut last_mtime = read_mtime(&path);

    loop {
        let (tx, mut rx) = mpsc::channel::<()>(16);
        let watcher = match attach_watcher(&path, tx) {
            Ok(watcher) => watcher,
            Err(error) if is_not_found(&error) => {
                if !poll_until_present(&path, poll_interval, &shutdown).await {
                    return;
                }
                // The file came back: fire immediately and re-attach.
                last_mtime = read_mtime(&path);
                run_callback(&callback).await;
                continue;
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to attach file watcher");
                // Stay in a claims-watching state without firing.
                shutdown.cancelled().await;
                return;
            }
        };

        // Hold the watcher for the lifetime of the event loop.
        let _watcher = watcher;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }

                    // Debounce window: collapse the burst into one check.
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(debounce) => {}
                    }
                    while rx.try_recv().is_ok() {}

                    match read_mtime(&path) {
                        Some(mtime) if last_mtime != Some(mtime) => {
                            last_mtime = Some(mtime);
                            run_callback(&callback).await;
                        }
                        Some(_) => {
                            tracing::trace!(path = %path.display(), "change event without mtime advance");
                        }
                        None => {
                            // Deleted out from under the native watcher.
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Poll until the file exists again. Returns false when shut down first.
async fn poll_until_present(
    path: &Path,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(poll_interval) => {
                if path.exists() {
                    return true;
                }
            }
        }
    }
}

async fn run_callback(callback: &ChangeCallback) {
    if let Err(error) = callback().await {
        tracing::warn!(error = %error, "file watcher callback failed");
    }
}
