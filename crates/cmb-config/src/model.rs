use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Transport half of a server entry.
///
/// Serialized with `#[serde(tag = "type")]` so JSON uses `"type": "stdio"`
/// or `"type": "http"`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerTransport {
    /// Spawn a child process speaking MCP over stdin/stdout.
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
    /// Connect to a remote MCP server via streamable HTTP.
    #[serde(rename = "http")]
    Http { url: String },
}

/// One upstream server entry in the config file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerEntry {
    #[serde(flatten)]
    pub transport: ServerTransport,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

/// OAuth settings for a server that requires a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ServerTransport {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

impl ServerEntry {
    pub fn is_stdio(&self) -> bool {
        matches!(&self.transport, ServerTransport::Stdio { .. })
    }

    /// Stable serialized form used by the reload differ.
    ///
    /// `serde_json` maps are ordered, so two semantically equal entries
    /// always serialize to the same string.
    pub fn snapshot(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Deserializer that validates the contract up front: every entry needs a
/// `type`, stdio entries need `command`, http entries need `url`.
impl<'de> Deserialize<'de> for ServerEntry {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            transport_type: Option<String>,
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            url: Option<String>,
            #[serde(default)]
            env: BTreeMap<String, String>,
            oauth: Option<OAuthConfig>,
        }

        let raw = Raw::deserialize(deserializer)?;

        let transport = match raw.transport_type.as_deref() {
            Some("stdio") => {
                let command = raw.command.ok_or_else(|| {
                    serde::de::Error::custom("type = \"stdio\" requires a 'command' field")
                })?;
                ServerTransport::Stdio {
                    command,
                    args: raw.args,
                }
            }
            Some("http") => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom("type = \"http\" requires a 'url' field")
                })?;
                ServerTransport::Http { url }
            }
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "unknown transport type '{other}' (expected: stdio, http)"
                )));
            }
            None => {
                return Err(serde::de::Error::custom(
                    "missing 'type' field; use type = \"stdio\" (with 'command') or type = \"http\" (with 'url')",
                ));
            }
        };

        Ok(ServerEntry {
            transport,
            env: raw.env,
            oauth: raw.oauth,
        })
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

impl BridgeConfig {
    /// Load and parse the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str::<Self>(raw).map_err(Into::into)
    }

    /// Write the config back, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Per-entry stable snapshot map used by the reload differ, optionally
    /// restricted to an allow-list of server names.
    pub fn snapshot(&self, allowed: Option<&[String]>) -> BTreeMap<String, String> {
        self.servers
            .iter()
            .filter(|(name, _)| {
                allowed.is_none_or(|allow| allow.iter().any(|a| a == name.as_str()))
            })
            .map(|(name, entry)| (name.clone(), entry.snapshot()))
            .collect()
    }
}
