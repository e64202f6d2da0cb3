//! Configuration for crewboard.
//!
//! Settings are read from `.crewboard/crewboard.toml` and layered:
//! file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4150
//! dev_mode = false
//!
//! [database]
//! path = ".crewboard/crewboard.db"
//!
//! [auth]
//! session_ttl_hours = 168
//! allow_registration = true
//! min_password_length = 8
//!
//! [logging]
//! format = "pretty"
//! level = "info"
//! directory = ".crewboard/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".crewboard";

/// Name of the config file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "crewboard.toml";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored when attached to a terminal
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for a separately served UI
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4150
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file, relative to the project directory unless absolute
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(STATE_DIR).join("crewboard.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Account and session policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// Lifetime of a login session
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Whether `POST /api/auth/register` is open
    #[serde(default = "default_allow_registration")]
    pub allow_registration: bool,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

fn default_session_ttl_hours() -> i64 {
    168
}

fn default_allow_registration() -> bool {
    true
}

fn default_min_password_length() -> usize {
    8
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
            allow_registration: default_allow_registration(),
            min_password_length: default_min_password_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to a daily rolling file here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
            directory: None,
        }
    }
}

/// The complete crewboard.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrewboardToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CrewboardToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crewboard.toml")
    }

    /// Load `crewboard.toml` from the state directory, or defaults if the
    /// file does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize crewboard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CREWBOARD_*` environment overrides. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("CREWBOARD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CREWBOARD_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid CREWBOARD_PORT"),
            }
        }
        if let Some(path) = lookup("CREWBOARD_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(format) = lookup("CREWBOARD_LOG_FORMAT") {
            match format.parse() {
                Ok(f) => self.logging.format = f,
                Err(_) => tracing::warn!(value = %format, "Ignoring invalid CREWBOARD_LOG_FORMAT"),
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the OS will pick a random port".to_string());
        }
        if self.server.host.trim().is_empty() {
            warnings.push("server.host is empty".to_string());
        }
        if self.auth.session_ttl_hours <= 0 {
            warnings.push(format!(
                "auth.session_ttl_hours is {}: sessions will expire immediately",
                self.auth.session_ttl_hours
            ));
        }
        if self.auth.min_password_length < 6 {
            warnings.push(format!(
                "auth.min_password_length {} is below 6",
                self.auth.min_password_length
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct CrewboardConfig {
    pub project_dir: PathBuf,
    /// `<project_dir>/.crewboard`
    pub state_dir: PathBuf,
    pub toml: CrewboardToml,
}

impl CrewboardConfig {
    /// Load file settings and environment overrides for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = CrewboardToml::load_or_default(&state_dir)?;
        toml.apply_env();

        Ok(Self {
            project_dir,
            state_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    /// Database path, resolved against the project directory.
    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.database.path)
    }

    /// Log directory, resolved against the project directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_deref().map(|d| self.resolve(d))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
