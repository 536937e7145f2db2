//! Configuration and persisted state for the bridge.
//!
//! The config file is a single JSON document `{ "servers": { <name>:
//! <entry> } }`; OAuth tokens live in a separate per-user JSON file.

pub mod model;
pub mod paths;
pub mod tokens;

pub use model::{BridgeConfig, OAuthConfig, ServerEntry, ServerTransport};
pub use paths::{default_config_path, default_token_path};
pub use tokens::{OAuthTokens, TokenEntry, TokenStore};
