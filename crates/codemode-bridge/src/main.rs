use anyhow::Result;
use clap::Parser;

mod auth_cmds;
mod cli;
mod config_cmds;
mod handler;
mod serve;

use cli::{AuthCommands, Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdio MCP framing on stdout stays clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("Error: {error:#}");
            classify_exit_code(&error)
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            config,
            servers,
            executor_type,
            http,
        } => {
            serve::handle_serve(serve::ServeOptions {
                config,
                servers,
                executor_type,
                http,
            })
            .await
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Add {
                name,
                entry_type,
                command,
                args,
                url,
                env,
                config,
            } => config_cmds::handle_add(name, entry_type, command, args, url, env, config),
            ConfigCommands::Remove { name, config } => config_cmds::handle_remove(name, config),
            ConfigCommands::Edit { config } => config_cmds::handle_edit(config),
            ConfigCommands::Show { name, config } => config_cmds::handle_show(name, config),
            ConfigCommands::List { config } => config_cmds::handle_list(config),
            ConfigCommands::Info { config } => config_cmds::handle_info(config),
        },
        Commands::Auth { cmd } => match cmd {
            AuthCommands::Login { server, config } => {
                auth_cmds::handle_login(server, config).await
            }
            AuthCommands::Logout { server } => auth_cmds::handle_logout(server),
            AuthCommands::List => auth_cmds::handle_list(),
        },
    }
}

/// 1 for user-correctable problems, 2 for internal failures.
fn classify_exit_code(error: &anyhow::Error) -> i32 {
    use cmb_core::BridgeError;

    if let Some(bridge) = error.downcast_ref::<BridgeError>() {
        return match bridge {
            BridgeError::ConfigParse(_)
            | BridgeError::ConfigValidation(_)
            | BridgeError::BackendUnavailable(_)
            | BridgeError::ToolNotFound(_)
            | BridgeError::InvalidCursor => 1,
            _ => 2,
        };
    }

    // anyhow contexts wrapping config/user input problems.
    let rendered = format!("{error:#}");
    if rendered.contains("no server named")
        || rendered.contains("Failed to parse config")
        || rendered.contains("requires")
        || rendered.contains("unknown transport type")
    {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmb_core::BridgeError;

    #[test]
    fn user_errors_exit_one() {
        let err = anyhow::Error::new(BridgeError::BackendUnavailable("jvm".into()));
        assert_eq!(classify_exit_code(&err), 1);

        let err = anyhow::anyhow!("no server named 'ghost' in /tmp/config.json");
        assert_eq!(classify_exit_code(&err), 1);
    }

    #[test]
    fn internal_errors_exit_two() {
        let err = anyhow::Error::new(BridgeError::SandboxCrash("boom".into()));
        assert_eq!(classify_exit_code(&err), 2);

        let err = anyhow::anyhow!("something unexpected");
        assert_eq!(classify_exit_code(&err), 2);
    }
}
