use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cmb", version)]
#[command(about = "Code-mode MCP bridge: one eval tool in front of many tool servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge (stdio transport by default)
    Serve {
        /// Config file path (defaults to the per-user config location)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Only expose these servers from the config (comma-separated)
        #[arg(long, value_delimiter = ',')]
        servers: Option<Vec<String>>,

        /// Pin the sandbox backend (vm, deno, container, vm-insecure)
        #[arg(long)]
        executor_type: Option<String>,

        /// Serve over HTTP at host:port instead of stdio
        #[arg(long)]
        http: Option<String>,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },

    /// Manage stored OAuth credentials
    Auth {
        #[command(subcommand)]
        cmd: AuthCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Add or replace a server entry
    Add {
        /// Server name
        name: String,

        /// Transport type (stdio or http)
        #[arg(long = "type")]
        entry_type: String,

        /// Command to spawn (stdio)
        #[arg(long)]
        command: Option<String>,

        /// Command argument, repeatable (stdio)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Server URL (http)
        #[arg(long)]
        url: Option<String>,

        /// KEY=VALUE environment entry, repeatable
        #[arg(long = "env")]
        env: Vec<String>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Remove a server entry
    Remove {
        name: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Open the config file in $EDITOR
    Edit {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print one server entry
    Show {
        name: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List configured servers
    List {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print config and token file locations
    Info {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Obtain and store a token for a server with an oauth config
    Login {
        server: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Drop the stored token for a server
    Logout { server: String },

    /// List stored tokens and their expiry state
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_parses_server_list_and_http() {
        let cli = Cli::parse_from([
            "cmb", "serve", "--servers", "a,b,c", "--http", "127.0.0.1:8976",
        ]);
        match cli.command {
            Commands::Serve { servers, http, .. } => {
                assert_eq!(servers.unwrap(), vec!["a", "b", "c"]);
                assert_eq!(http.unwrap(), "127.0.0.1:8976");
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn config_add_accepts_repeated_args() {
        let cli = Cli::parse_from([
            "cmb", "config", "add", "files", "--type", "stdio", "--command", "npx",
            "--arg", "-y", "--arg", "files-mcp",
        ]);
        match cli.command {
            Commands::Config {
                cmd: ConfigCommands::Add { name, args, .. },
            } => {
                assert_eq!(name, "files");
                assert_eq!(args, vec!["-y", "files-mcp"]);
            }
            _ => panic!("expected config add"),
        }
    }
}
