//! Persisted OAuth state.
//!
//! A single JSON object keyed by server name (or URL), written atomically.
//! External edits are picked up by the serve loop through the file watcher,
//! so this type only does load/save/query.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_information: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    /// Milliseconds since the epoch at the time the entry was written.
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

impl TokenEntry {
    /// A token is expired once `last_updated + (expires_in || 3600)s` is in
    /// the past.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        let Some(tokens) = &self.tokens else {
            return true;
        };
        let lifetime_ms =
            tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) as i64 * 1000;
        self.last_updated + lifetime_ms < now_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all entries. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<String, TokenEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file: {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse token file: {}", self.path.display()))
    }

    pub fn get(&self, server: &str) -> Result<Option<TokenEntry>> {
        Ok(self.load()?.remove(server))
    }

    /// Returns the bearer token for a server when one is stored and fresh.
    pub fn bearer_token(&self, server: &str) -> Result<Option<String>> {
        let Some(entry) = self.get(server)? else {
            return Ok(None);
        };
        if entry.is_expired() {
            return Ok(None);
        }
        Ok(entry.tokens.map(|t| t.access_token))
    }

    pub fn set(&self, server: &str, entry: TokenEntry) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(server.to_string(), entry);
        self.write(&entries)
    }

    /// Remove a server's entry. Returns true when something was removed.
    pub fn remove(&self, server: &str) -> Result<bool> {
        let mut entries = self.load()?;
        let removed = entries.remove(server).is_some();
        if removed {
            self.write(&entries)?;
        }
        Ok(removed)
    }

    /// Atomic rewrite: write a sibling temp file, then rename over the
    /// original so watchers never observe a torn file.
    fn write(&self, entries: &BTreeMap<String, TokenEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create token directory: {}", parent.display())
            })?;
        }
        let contents =
            serde_json::to_string_pretty(entries).context("Failed to serialize token file")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write token file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace token file: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(expires_in: Option<u64>, last_updated: i64) -> TokenEntry {
        TokenEntry {
            client_information: None,
            tokens: Some(OAuthTokens {
                access_token: "tok".into(),
                refresh_token: None,
                expires_in,
                token_type: Some("Bearer".into()),
            }),
            last_updated,
        }
    }

    #[test]
    fn test_expiry_uses_expires_in() {
        let entry = entry_with(Some(60), 1_000_000);
        assert!(!entry.is_expired_at(1_000_000 + 59_999));
        assert!(entry.is_expired_at(1_000_000 + 60_001));
    }

    #[test]
    fn test_expiry_defaults_to_one_hour() {
        let entry = entry_with(None, 0);
        assert!(!entry.is_expired_at(3_600_000 - 1));
        assert!(entry.is_expired_at(3_600_000 + 1));
    }

    #[test]
    fn test_entry_without_tokens_is_expired() {
        let entry = TokenEntry {
            client_information: None,
            tokens: None,
            last_updated: i64::MAX / 2,
        };
        assert!(entry.is_expired_at(0));
    }

    #[test]
    fn test_set_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        assert!(store.get("api").unwrap().is_none());

        let now = chrono::Utc::now().timestamp_millis();
        store.set("api", entry_with(Some(3600), now)).unwrap();
        assert_eq!(store.bearer_token("api").unwrap().as_deref(), Some("tok"));

        assert!(store.remove("api").unwrap());
        assert!(!store.remove("api").unwrap());
        assert!(store.get("api").unwrap().is_none());
    }

    #[test]
    fn test_expired_token_yields_no_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        store.set("api", entry_with(Some(1), 0)).unwrap();
        assert!(store.bearer_token("api").unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }
}
