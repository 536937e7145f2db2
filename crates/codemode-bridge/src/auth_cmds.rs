//! `cmb auth …` subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use cmb_config::{
    BridgeConfig, OAuthConfig, OAuthTokens, TokenEntry, TokenStore, default_config_path,
    default_token_path,
};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub async fn handle_login(server: String, config: Option<PathBuf>) -> Result<()> {
    let config_path = match config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let cfg = BridgeConfig::load(&config_path)?;
    let entry = cfg
        .servers
        .get(&server)
        .with_context(|| format!("no server named '{server}' in {}", config_path.display()))?;
    let Some(oauth) = &entry.oauth else {
        bail!("server '{server}' has no oauth configuration");
    };

    let tokens = request_token(oauth).await?;
    let store = TokenStore::new(default_token_path()?);
    store.set(
        &server,
        TokenEntry {
            client_information: Some(serde_json::json!({"client_id": oauth.client_id})),
            tokens: Some(OAuthTokens {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_in: tokens.expires_in,
                token_type: tokens.token_type,
            }),
            last_updated: chrono::Utc::now().timestamp_millis(),
        },
    )?;

    println!("Stored token for '{server}' in {}", store.path().display());
    Ok(())
}

async fn request_token(oauth: &OAuthConfig) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "client_credentials".to_string()),
        ("client_id", oauth.client_id.clone()),
    ];
    if let Some(secret) = &oauth.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    if let Some(scope) = &oauth.scope {
        form.push(("scope", scope.clone()));
    }

    let response = reqwest::Client::new()
        .post(&oauth.token_url)
        .form(&form)
        .send()
        .await
        .with_context(|| format!("token request to {} failed", oauth.token_url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token endpoint returned {status}: {body}");
    }

    response
        .json::<TokenResponse>()
        .await
        .context("token endpoint returned an unparseable body")
}

pub fn handle_logout(server: String) -> Result<()> {
    let store = TokenStore::new(default_token_path()?);
    if store.remove(&server)? {
        println!("Removed stored token for '{server}'");
    } else {
        println!("No stored token for '{server}'");
    }
    Ok(())
}

pub fn handle_list() -> Result<()> {
    let store = TokenStore::new(default_token_path()?);
    let entries = store.load()?;
    if entries.is_empty() {
        println!("No stored tokens ({})", store.path().display());
        return Ok(());
    }

    for (server, entry) in entries {
        let state = if entry.is_expired() { "expired" } else { "valid" };
        let updated = chrono::DateTime::from_timestamp_millis(entry.last_updated)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        println!("{server:<24} {state:<8} updated {updated}");
    }
    Ok(())
}
