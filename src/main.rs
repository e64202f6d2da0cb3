use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crewboard::config::CrewboardConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "crewboard")]
#[command(version, about = "Team project board: projects, tasks, calendar and patch notes")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding `.crewboard/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create `.crewboard/` with a default config file and database
    Init,
    /// Run the HTTP and WebSocket server until Ctrl+C
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a separately served UI)
        #[arg(long)]
        dev: bool,

        /// Open the browser once the server is listening
        #[arg(long)]
        open: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage user accounts directly in the database
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default crewboard.toml file
    Init,
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    /// Create a user account
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long, env = "CREWBOARD_USER_PASSWORD", hide_env_values = true)]
        password: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },
    /// List user accounts
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Commands that write the config file run before it is loaded
    match &cli.command {
        Commands::Init => return cmd::cmd_init(&project_dir),
        Commands::Config { command } => return cmd::cmd_config(&project_dir, command.clone()),
        _ => {}
    }

    let config = CrewboardConfig::new(project_dir)?;
    let level = if cli.verbose {
        "debug"
    } else {
        config.toml.logging.level.as_str()
    };
    let log_dir = config.log_dir();
    let _log_guard =
        crewboard::logging::init_tracing(config.toml.logging.format, level, log_dir.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
            open,
        } => {
            cmd::cmd_serve(
                &config,
                cmd::ServeArgs {
                    host,
                    port,
                    db_path,
                    dev,
                    open,
                },
            )
            .await?;
        }
        Commands::User { command } => cmd::cmd_user(&config, command)?,
        Commands::Init | Commands::Config { .. } => {}
    }

    Ok(())
}
