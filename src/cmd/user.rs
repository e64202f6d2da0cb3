//! Account bootstrap commands — `crewboard user`.

use anyhow::{Context, Result};
use console::style;

use super::super::UserCommands;
use crewboard::board::auth::{hash_password, new_salt, normalize_email};
use crewboard::board::db::BoardDb;
use crewboard::board::models::UserRole;
use crewboard::config::CrewboardConfig;

fn open_db(config: &CrewboardConfig) -> Result<BoardDb> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    BoardDb::new(&db_path)
}

pub fn cmd_user(config: &CrewboardConfig, command: UserCommands) -> Result<()> {
    let db = open_db(config)?;

    match command {
        UserCommands::Create {
            name,
            email,
            password,
            admin,
        } => {
            let name = name.trim();
            if name.is_empty() {
                anyhow::bail!("Name must not be empty");
            }
            let email = normalize_email(&email)
                .with_context(|| format!("Invalid email '{}'", email))?;
            let min_len = config.toml.auth.min_password_length;
            if password.chars().count() < min_len {
                anyhow::bail!("Password must be at least {} characters", min_len);
            }
            let role = if admin { UserRole::Admin } else { UserRole::Member };
            let salt = new_salt();
            let user = db.create_user(name, &email, role, &hash_password(&password, &salt), &salt)?;
            tracing::info!(user_id = user.id, role = %user.role, "User created from CLI");
            println!(
                "{} Created {} {} <{}> (id {})",
                style("✓").green().bold(),
                user.role,
                user.name,
                user.email,
                user.id
            );
        }
        UserCommands::List => {
            let users = db.list_users()?;
            if users.is_empty() {
                println!("No users yet. Create one with 'crewboard user create'.");
                return Ok(());
            }
            println!(
                "{:<6} {:<8} {:<24} {}",
                style("ID").bold(),
                style("ROLE").bold(),
                style("NAME").bold(),
                style("EMAIL").bold()
            );
            for user in users {
                let role = match user.role {
                    UserRole::Admin => style(user.role.to_string()).magenta(),
                    UserRole::Member => style(user.role.to_string()).dim(),
                };
                println!("{:<6} {:<8} {:<24} {}", user.id, role, user.name, user.email);
            }
        }
    }

    Ok(())
}
