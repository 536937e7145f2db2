//! Config-driven reconnect sequence.
//!
//! On a config change: parse, serialize the in-scope entries into stable
//! strings, diff against the last committed snapshot, drive the manager, and
//! only then commit the new snapshot. A parse failure keeps the previous
//! snapshot (and every live connection) intact. Re-entrant reloads are
//! dropped while one is in flight.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;

use cmb_config::BridgeConfig;

use crate::manager::UpstreamManager;

/// Entry-level difference between two config snapshots.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Diff two `name → stable-serialized-entry` maps.
    pub fn diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Self {
        let mut set = Self::default();
        for (name, serialized) in new {
            match old.get(name) {
                None => set.added.push(name.clone()),
                Some(previous) if previous != serialized => set.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in old.keys() {
            if !new.contains_key(name) {
                set.removed.push(name.clone());
            }
        }
        set
    }
}

pub type ServersChangedCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct ConfigReloader {
    path: PathBuf,
    allowed: Option<Vec<String>>,
    manager: Arc<UpstreamManager>,
    snapshot: tokio::sync::Mutex<BTreeMap<String, String>>,
    reloading: AtomicBool,
    on_servers_changed: ServersChangedCallback,
}

impl ConfigReloader {
    pub fn new(
        path: impl Into<PathBuf>,
        allowed: Option<Vec<String>>,
        manager: Arc<UpstreamManager>,
        on_servers_changed: ServersChangedCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            allowed,
            manager,
            snapshot: tokio::sync::Mutex::new(BTreeMap::new()),
            reloading: AtomicBool::new(false),
            on_servers_changed,
        })
    }

    fn in_scope(&self, name: &str) -> bool {
        self.allowed
            .as_deref()
            .is_none_or(|allow| allow.iter().any(|a| a == name))
    }

    /// Startup path: seed the snapshot and kick off background connects so a
    /// slow server never delays the front door.
    pub async fn connect_initial(&self) -> anyhow::Result<()> {
        let config = BridgeConfig::load(&self.path)?;
        *self.snapshot.lock().await = config.snapshot(self.allowed.as_deref());

        for (name, entry) in &config.servers {
            if self.in_scope(name) {
                self.manager
                    .connect_server_in_background(name.clone(), entry.clone());
            }
        }
        Ok(())
    }

    /// The reload sequence, invoked by the file watcher.
    pub async fn reload(&self) {
        if self.reloading.swap(true, Ordering::SeqCst) {
            tracing::info!("config reload already in progress, dropping change event");
            return;
        }
        self.run_reload().await;
        self.reloading.store(false, Ordering::SeqCst);
    }

    async fn run_reload(&self) {
        let config = match BridgeConfig::load(&self.path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %error,
                    "config reload failed to parse; keeping current servers"
                );
                return;
            }
        };

        let new_snapshot = config.snapshot(self.allowed.as_deref());
        let changes = {
            let snapshot = self.snapshot.lock().await;
            ChangeSet::diff(&snapshot, &new_snapshot)
        };

        if changes.is_empty() {
            tracing::debug!("config reload found no server changes");
            return;
        }

        tracing::info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            changed = changes.changed.len(),
            "applying config changes"
        );

        let mut disconnects = JoinSet::new();
        for name in changes.removed.iter().chain(changes.changed.iter()) {
            let manager = self.manager.clone();
            let name = name.clone();
            disconnects.spawn(async move {
                manager.disconnect_server(&name).await;
            });
        }
        while disconnects.join_next().await.is_some() {}

        let mut connects = JoinSet::new();
        for name in changes.added.iter().chain(changes.changed.iter()) {
            let Some(entry) = config.servers.get(name).cloned() else {
                continue;
            };
            let manager = self.manager.clone();
            let name = name.clone();
            connects.spawn(async move {
                // A single failure logs and moves on; the other servers and
                // the change callback are unaffected.
                manager.connect_server(&name, &entry).await;
            });
        }
        while connects.join_next().await.is_some() {}

        *self.snapshot.lock().await = new_snapshot;
        (self.on_servers_changed)().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_classifies_added_removed_changed() {
        let old = map(&[("a", "cfg-a"), ("b", "cfg-b")]);
        let new = map(&[("a", "cfg-a2"), ("c", "cfg-c")]);

        let changes = ChangeSet::diff(&old, &new);
        assert_eq!(changes.added, vec!["c"]);
        assert_eq!(changes.removed, vec!["b"]);
        assert_eq!(changes.changed, vec!["a"]);
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let old = map(&[("a", "cfg-a")]);
        let changes = ChangeSet::diff(&old, &old.clone());
        assert!(changes.is_empty());
    }

    fn write_config(path: &std::path::Path, names: &[(&str, &str)]) {
        let servers: Vec<String> = names
            .iter()
            .map(|(name, command)| {
                format!("\"{name}\": {{\"type\": \"stdio\", \"command\": \"{command}\"}}")
            })
            .collect();
        std::fs::write(path, format!("{{\"servers\": {{{}}}}}", servers.join(","))).unwrap();
    }

    fn counting_callback() -> (ServersChangedCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: ServersChangedCallback = Arc::new(move || {
            let inner = inner.clone();
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            })
        });
        (callback, count)
    }

    #[tokio::test]
    async fn reload_with_no_changes_invokes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[("a", "cat")]);

        let manager = UpstreamManager::new(None);
        let (callback, fired) = counting_callback();
        let reloader = ConfigReloader::new(&path, None, manager.clone(), callback);

        // Seed the snapshot, then reload the identical file.
        *reloader.snapshot.lock().await =
            BridgeConfig::load(&path).unwrap().snapshot(None);
        reloader.reload().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(manager.connected_server_names().await.is_empty());
    }

    #[tokio::test]
    async fn parse_failure_keeps_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[("a", "cat")]);

        let manager = UpstreamManager::new(None);
        let (callback, fired) = counting_callback();
        let reloader = ConfigReloader::new(&path, None, manager, callback);
        let seeded = BridgeConfig::load(&path).unwrap().snapshot(None);
        *reloader.snapshot.lock().await = seeded.clone();

        std::fs::write(&path, "{not json").unwrap();
        reloader.reload().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(*reloader.snapshot.lock().await, seeded);
    }

    #[tokio::test]
    async fn reload_applies_add_remove_change_and_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        // `true`/`false` exit immediately, so every connect fails; the
        // sequence (and the callback) must still run to the end.
        write_config(&path, &[("a", "true"), ("b", "true")]);

        let manager = UpstreamManager::new(None);
        let (callback, fired) = counting_callback();
        let reloader = ConfigReloader::new(&path, None, manager.clone(), callback);
        *reloader.snapshot.lock().await =
            BridgeConfig::load(&path).unwrap().snapshot(None);

        write_config(&path, &[("a", "false"), ("c", "true")]);
        reloader.reload().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The snapshot advanced to the new file.
        let snapshot = reloader.snapshot.lock().await.clone();
        assert!(snapshot.contains_key("c"));
        assert!(!snapshot.contains_key("b"));
        assert!(snapshot["a"].contains("false"));
    }

    #[tokio::test]
    async fn allow_list_scopes_the_diff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[("a", "true")]);

        let manager = UpstreamManager::new(None);
        let (callback, fired) = counting_callback();
        let reloader = ConfigReloader::new(
            &path,
            Some(vec!["a".to_string()]),
            manager,
            callback,
        );
        *reloader.snapshot.lock().await = BridgeConfig::load(&path)
            .unwrap()
            .snapshot(Some(&["a".to_string()]));

        // Adding an out-of-scope server is invisible.
        write_config(&path, &[("a", "true"), ("z", "true")]);
        reloader.reload().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
