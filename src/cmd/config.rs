//! Configuration view and validation commands — `crewboard config`.

use anyhow::Result;
use console::style;

use super::super::ConfigCommands;
use crewboard::config::{CONFIG_FILE, CrewboardConfig, CrewboardToml, STATE_DIR};

fn print_toml(toml: &CrewboardToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();
    println!("[database]");
    println!("  path = \"{}\"", toml.database.path.display());
    println!();
    println!("[auth]");
    println!("  session_ttl_hours = {}", toml.auth.session_ttl_hours);
    println!("  allow_registration = {}", toml.auth.allow_registration);
    println!("  min_password_length = {}", toml.auth.min_password_length);
    println!();
    println!("[logging]");
    println!("  format = \"{}\"", toml.logging.format);
    println!("  level = \"{}\"", toml.logging.level);
    if let Some(dir) = &toml.logging.directory {
        println!("  directory = \"{}\"", dir.display());
    }
    println!();
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("crewboard configuration").bold());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No crewboard.toml found at {}", config_path.display());
                println!("Run 'crewboard config init' to create one.");
            }
            println!();

            // Effective values include CREWBOARD_* environment overrides
            let config = CrewboardConfig::new(project_dir.to_path_buf())?;
            print_toml(&config.toml);
            println!("Database file: {}", config.db_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No crewboard.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = CrewboardToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("{} Configuration is valid.", style("✓").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("crewboard.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&state_dir)?;
            CrewboardToml::default().save(&config_path)?;

            println!("Created crewboard.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [auth] session_ttl_hours, allow_registration, min_password_length");
            println!("  - [logging] format, level, directory");
            println!();
        }
    }

    Ok(())
}
