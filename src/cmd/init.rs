//! Project initialization — `crewboard init`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

use crewboard::board::db::BoardDb;
use crewboard::config::{CONFIG_FILE, CrewboardConfig, CrewboardToml, STATE_DIR};

/// Result of initializing a crewboard project.
#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    /// False when a config file was already present
    pub created_config: bool,
}

/// Create `.crewboard/`, a default config file if none exists, and the
/// database with its schema.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = project_dir.join(STATE_DIR);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create directory: {}", state_dir.display()))?;

    let config_path = state_dir.join(CONFIG_FILE);
    let created_config = !config_path.exists();
    if created_config {
        CrewboardToml::default().save(&config_path)?;
    }

    let config = CrewboardConfig::new(project_dir.to_path_buf())?;
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    BoardDb::new(&db_path)?;

    Ok(InitResult {
        state_dir: config.state_dir,
        db_path,
        created_config,
    })
}

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let result = init_project(project_dir)?;

    println!();
    if result.created_config {
        println!(
            "{} Initialized crewboard in {}",
            style("✓").green().bold(),
            result.state_dir.display()
        );
    } else {
        println!(
            "{} crewboard already initialized in {}",
            style("•").yellow(),
            result.state_dir.display()
        );
    }
    println!("  Database: {}", result.db_path.display());
    println!();
    println!("Next steps:");
    println!(
        "  {}",
        style("crewboard user create --name <name> --email <email> --password <password> --admin").cyan()
    );
    println!("  {}", style("crewboard serve --open").cyan());
    println!();
    Ok(())
}
