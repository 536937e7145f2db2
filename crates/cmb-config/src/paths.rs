use std::path::PathBuf;

use anyhow::{Context, Result};

fn config_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "codemode-bridge")
        .context("Failed to determine project directories")?;
    Ok(dirs.config_dir().to_path_buf())
}

/// Default config file location (`~/.config/codemode-bridge/config.json` on
/// Linux).
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Default token file location, next to the config file.
pub fn default_token_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("tokens.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_a_directory() {
        let config = default_config_path().unwrap();
        let tokens = default_token_path().unwrap();
        assert_eq!(config.parent(), tokens.parent());
        assert!(config.ends_with("config.json"));
        assert!(tokens.ends_with("tokens.json"));
    }
}
